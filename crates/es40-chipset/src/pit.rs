//! 8254 Programmable Interval Timer, three channels at ports 0x40-0x43,
//! grounded on `original_source/src/AliM1543C.cpp`'s `pit_read`/`pit_write`/
//! `pit_clock`. Channel 0 is tied to IRQ 0 (the system tick); channel 1 is
//! the legacy RAM-refresh counter (unused here); channel 2 drives the
//! speaker gate sampled through port 0x61.

use std::sync::{Arc, Mutex};

use es40_bus::BusEndpoint;
use es40_interrupts::PicPair;
use es40_snapshot::Savable;

/// One 8254 counter. `current`/`latch` hold the live and reload values
/// (the source keeps both in one `pit_counter[9]` array indexed by
/// channel and channel+6 respectively).
#[derive(Debug, Clone, Copy, Default)]
struct Channel {
    mode: u8,
    status: u8,
    current: u32,
    reload: u32,
}

pub struct Pit {
    inner: Mutex<Inner>,
    pic: Arc<Mutex<PicPair>>,
}

struct Inner {
    channel: [Channel; 3],
}

/// How far a counter decrements per timer tick (the source's `PIT_FACTOR`,
/// tuned against its host-clock calibration; here it is just a fixed step
/// since there is no real wall-clock driving `pit_clock`).
const PIT_FACTOR: u32 = 5000;

impl Pit {
    pub fn new(pic: Arc<Mutex<PicPair>>) -> Self {
        Pit {
            inner: Mutex::new(Inner {
                channel: [Channel::default(); 3],
            }),
            pic,
        }
    }

    /// Read one of ports 0x40 (counter 0) .. 0x43 (control word). The
    /// hardware never returns meaningful data for a plain counter read
    /// without a latch command first; the source always returns 0 here.
    pub fn read_port(&self, port: u8) -> u8 {
        let _ = port;
        0
    }

    pub fn write_port(&self, port: u8, value: u8) {
        let mut inner = self.inner.lock().unwrap();
        if port == 3 {
            if value == 0 {
                return;
            }
            let sel = (value >> 6) & 0x03;
            if sel == 3 {
                // 8254 read-back command, not modeled beyond acknowledging it.
                return;
            }
            let ch = sel as usize;
            inner.channel[ch].status = value & 0x3f;
            inner.channel[ch].mode = (value & 0x30) >> 4;
        } else {
            let ch = port as usize;
            match inner.channel[ch].mode {
                0 => {}
                1 | 3 => {
                    inner.channel[ch].reload =
                        (inner.channel[ch].reload & 0xff) | ((value as u32) << 8);
                    inner.channel[ch].current = inner.channel[ch].reload;
                    if inner.channel[ch].mode == 3 {
                        inner.channel[ch].mode = 2;
                    } else {
                        inner.channel[ch].status &= !0xc0;
                    }
                }
                2 => {
                    let mut reload = (inner.channel[ch].reload & 0xff00) | value as u32;
                    if (inner.channel[ch].status & 0x30) >> 4 == 3 && reload == 0 {
                        reload = 65536;
                    }
                    inner.channel[ch].reload = reload;
                    inner.channel[ch].current = reload;
                    inner.channel[ch].status &= !0xc0;
                }
                _ => unreachable!(),
            }
        }
    }

    /// Port 0x61 bit 5: channel 2's current output level (speaker gate).
    pub fn channel2_output(&self) -> bool {
        self.inner.lock().unwrap().channel[2].status & 0x80 != 0
    }

    /// One timer tick (the main loop calls this at a fixed rate, the
    /// source's `do_pit_clock`/`pit_clock` split collapsed into one step).
    pub fn tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        for i in 0..3 {
            let ch = &mut inner.channel[i];
            if ch.status & 0x40 != 0 {
                continue;
            }
            ch.current = ch.current.saturating_sub(PIT_FACTOR);
            match (ch.status & 0x0e) >> 1 {
                0 => {
                    if ch.current == 0 {
                        ch.status |= 0xc0;
                    }
                }
                3 => {
                    if ch.current == 0 {
                        if ch.status & 0x80 != 0 {
                            ch.status &= !0x80;
                        } else {
                            ch.status |= 0x80;
                            if i == 0 {
                                self.pic.lock().unwrap().interrupt(0, 0);
                            }
                        }
                        ch.current = ch.reload;
                    }
                    ch.current = ch.current.saturating_sub(PIT_FACTOR);
                }
                _ => {}
            }
        }
    }
}

impl Savable for Pit {
    fn magic1(&self) -> [u8; 4] {
        *b"PIT0"
    }
    fn magic2(&self) -> [u8; 4] {
        *b"0TIP"
    }
    fn save_state(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut buf = Vec::with_capacity(3 * 10);
        for ch in inner.channel {
            buf.push(ch.mode);
            buf.push(ch.status);
            buf.extend_from_slice(&ch.current.to_le_bytes());
            buf.extend_from_slice(&ch.reload.to_le_bytes());
        }
        buf
    }
    fn load_state(&self, blob: &[u8]) -> es40_error::Result<()> {
        if blob.len() != 30 {
            return Err(es40_error::Error::illegal_state("pit", "bad snapshot length"));
        }
        let mut inner = self.inner.lock().unwrap();
        for (i, ch) in inner.channel.iter_mut().enumerate() {
            let base = i * 10;
            ch.mode = blob[base];
            ch.status = blob[base + 1];
            ch.current = u32::from_le_bytes(blob[base + 2..base + 6].try_into().unwrap());
            ch.reload = u32::from_le_bytes(blob[base + 6..base + 10].try_into().unwrap());
        }
        Ok(())
    }
}

impl BusEndpoint for Pit {
    fn read(&self, _range_id: u32, offset: u64, _size: u8) -> u64 {
        self.read_port(offset as u8) as u64
    }

    fn write(&self, _range_id: u32, offset: u64, _size: u8, value: u64) {
        self.write_port(offset as u8, value as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use es40_interrupts::InterruptLine;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestLine(Arc<AtomicBool>);
    impl InterruptLine for TestLine {
        fn set_line(&self, asserted: bool) {
            self.0.store(asserted, Ordering::SeqCst);
        }
    }

    fn setup() -> (Pit, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut pair = PicPair::new(Box::new(TestLine(flag.clone())));
        pair.write_cmd(0, 0x11).unwrap();
        pair.write_data(0, 0x20).unwrap();
        pair.write_data(0, 0x04).unwrap();
        pair.write_data(0, 0x01).unwrap();
        let pic = Arc::new(Mutex::new(pair));
        (Pit::new(pic), flag)
    }

    #[test]
    fn channel0_square_wave_asserts_irq0() {
        let (pit, flag) = setup();
        pit.write_port(3, 0x36); // channel 0, lsb+msb, mode 3
        pit.write_port(0, 0x00);
        pit.write_port(0, 0x01); // small reload so one tick underflows
        for _ in 0..10 {
            pit.tick();
        }
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn channel2_output_reflects_in_port61() {
        let (pit, _flag) = setup();
        pit.write_port(3, 0xb6); // channel 2, lsb+msb, mode 3
        pit.write_port(2, 0x01);
        pit.write_port(2, 0x00);
        for _ in 0..10 {
            pit.tick();
        }
        assert!(pit.channel2_output());
    }

    #[test]
    fn save_restore_roundtrip_preserves_channel_state() {
        let (mut pit, _flag) = setup();
        pit.write_port(3, 0xb6);
        pit.write_port(2, 0x34);
        pit.write_port(2, 0x12);
        let blob = pit.save_state();

        let (mut other, _flag2) = setup();
        other.load_state(&blob).unwrap();
        assert_eq!(
            other.inner.lock().unwrap().channel[2].reload,
            pit.inner.lock().unwrap().channel[2].reload
        );
    }
}
