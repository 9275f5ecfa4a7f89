//! AMD-style flash ROM state machine, ported from
//! `original_source/src/Flash.cpp`'s `ReadMem`/`WriteMem`. 2 MiB of flash,
//! addressed a byte at a time by `address >> 6` (the source's quirk of
//! treating every memory access as 64-byte-strided, preserved here since
//! it is how firmware images built against this chipset are laid out).

use std::sync::Mutex;

use es40_bus::BusEndpoint;
use es40_snapshot::Savable;

const FLASH_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Step1,
    Step2,
    Autosel,
    Program,
    EraseStep3,
    EraseStep4,
    EraseStep5,
    Confirm0,
    Confirm1,
}

struct Inner {
    data: Vec<u8>,
    mode: Mode,
}

pub struct Flash {
    inner: Mutex<Inner>,
}

impl Default for Flash {
    fn default() -> Self {
        Self::new()
    }
}

impl Flash {
    pub fn new() -> Self {
        Flash {
            inner: Mutex::new(Inner {
                data: vec![0xff; FLASH_SIZE],
                mode: Mode::Read,
            }),
        }
    }

    /// Load a firmware image at offset 0, as if freshly programmed.
    pub fn load_image(&self, image: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let n = image.len().min(inner.data.len());
        inner.data[..n].copy_from_slice(&image[..n]);
    }

    pub fn read(&self, address: u64) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        let a = (address >> 6) as usize;
        match inner.mode {
            Mode::Autosel => match a {
                0 => 0x01,
                1 => 0xad,
                _ => 0,
            },
            Mode::Confirm0 => {
                inner.mode = Mode::Read;
                0x80
            }
            Mode::Confirm1 => {
                inner.mode = Mode::Confirm0;
                0x80
            }
            _ => *inner.data.get(a).unwrap_or(&0xff),
        }
    }

    pub fn write(&self, address: u64, data: u8) {
        let mut inner = self.inner.lock().unwrap();
        let a = (address >> 6) as usize;
        match inner.mode {
            Mode::Read | Mode::Autosel => {
                inner.mode = if a == 0x5555 && data == 0xaa {
                    Mode::Step1
                } else {
                    Mode::Read
                };
            }
            Mode::Step1 => {
                inner.mode = if a == 0x2aaa && data == 0x55 {
                    Mode::Step2
                } else {
                    Mode::Read
                };
            }
            Mode::Step2 => {
                inner.mode = if a != 0x5555 {
                    Mode::Read
                } else {
                    match data {
                        0x90 => Mode::Autosel,
                        0xa0 => Mode::Program,
                        0x80 => Mode::EraseStep3,
                        _ => Mode::Read,
                    }
                };
            }
            Mode::EraseStep3 => {
                inner.mode = if a == 0x5555 && data == 0xaa {
                    Mode::EraseStep4
                } else {
                    Mode::Read
                };
            }
            Mode::EraseStep4 => {
                inner.mode = if a == 0x2aaa && data == 0x55 {
                    Mode::EraseStep5
                } else {
                    Mode::Read
                };
            }
            Mode::EraseStep5 => {
                if a == 0x5555 && data == 0x10 {
                    inner.data.fill(0xff);
                    inner.mode = Mode::Confirm1;
                } else if data == 0x30 {
                    let block = (a >> 16) << 16;
                    let end = (block + 0x10000).min(inner.data.len());
                    inner.data[block..end].fill(0xff);
                    inner.mode = Mode::Confirm1;
                } else {
                    inner.mode = Mode::Read;
                }
            }
            Mode::Program => {
                if a < inner.data.len() {
                    inner.data[a] = data;
                }
                inner.mode = Mode::Read;
            }
            Mode::Confirm0 | Mode::Confirm1 => {
                inner.mode = Mode::Read;
            }
        }
    }
}

impl Mode {
    fn to_u8(self) -> u8 {
        match self {
            Mode::Read => 0,
            Mode::Step1 => 1,
            Mode::Step2 => 2,
            Mode::Autosel => 3,
            Mode::Program => 4,
            Mode::EraseStep3 => 5,
            Mode::EraseStep4 => 6,
            Mode::EraseStep5 => 7,
            Mode::Confirm0 => 8,
            Mode::Confirm1 => 9,
        }
    }

    fn from_u8(v: u8) -> Option<Mode> {
        Some(match v {
            0 => Mode::Read,
            1 => Mode::Step1,
            2 => Mode::Step2,
            3 => Mode::Autosel,
            4 => Mode::Program,
            5 => Mode::EraseStep3,
            6 => Mode::EraseStep4,
            7 => Mode::EraseStep5,
            8 => Mode::Confirm0,
            9 => Mode::Confirm1,
            _ => return None,
        })
    }
}

impl Savable for Flash {
    fn magic1(&self) -> [u8; 4] {
        *b"FLS0"
    }
    fn magic2(&self) -> [u8; 4] {
        *b"0SLF"
    }
    fn save_state(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut buf = Vec::with_capacity(1 + inner.data.len());
        buf.push(inner.mode.to_u8());
        buf.extend_from_slice(&inner.data);
        buf
    }
    fn load_state(&self, blob: &[u8]) -> es40_error::Result<()> {
        if blob.len() != 1 + FLASH_SIZE {
            return Err(es40_error::Error::illegal_state("flash", "bad snapshot length"));
        }
        let mode = Mode::from_u8(blob[0])
            .ok_or_else(|| es40_error::Error::illegal_state("flash", "bad mode byte"))?;
        let mut inner = self.inner.lock().unwrap();
        inner.mode = mode;
        inner.data.copy_from_slice(&blob[1..]);
        Ok(())
    }
}

impl BusEndpoint for Flash {
    fn read(&self, _range_id: u32, offset: u64, _size: u8) -> u64 {
        self.read(offset) as u64
    }

    fn write(&self, _range_id: u32, offset: u64, _size: u8, value: u64) {
        self.write(offset, value as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlock(flash: &Flash) {
        flash.write(0x5555 << 6, 0xaa);
        flash.write(0x2aaa << 6, 0x55);
    }

    #[test]
    fn autoselect_reports_manufacturer_and_device() {
        let flash = Flash::new();
        unlock(&flash);
        flash.write(0x5555 << 6, 0x90);
        assert_eq!(flash.read(0), 0x01);
        assert_eq!(flash.read(1 << 6), 0xad);
    }

    #[test]
    fn byte_program_sequence_writes_one_byte() {
        let flash = Flash::new();
        unlock(&flash);
        flash.write(0x5555 << 6, 0xa0);
        flash.write(0x100 << 6, 0x42);
        assert_eq!(flash.read(0x100 << 6), 0x42);
    }

    #[test]
    fn chip_erase_fills_with_0xff_after_programming() {
        let flash = Flash::new();
        unlock(&flash);
        flash.write(0x5555 << 6, 0xa0);
        flash.write(0x10 << 6, 0x00);
        assert_eq!(flash.read(0x10 << 6), 0x00);

        unlock(&flash);
        flash.write(0x5555 << 6, 0x80);
        unlock(&flash);
        flash.write(0x5555 << 6, 0x10);
        assert_eq!(flash.read(0x10 << 6), 0xff);
    }
}
