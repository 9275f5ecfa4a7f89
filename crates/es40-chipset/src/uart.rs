//! 16550-compatible UART, grounded on `original_source/src/Serial.cpp`
//! (`bIER`/`bIIR`/`bFCR`/`bLCR`/`bMCR`/`bLSR`/`bMSR`, a 1024-byte receive
//! FIFO, and divisor-latch access through LCR bit 7).
//!
//! Output bytes are handed to a [`SerialBackend`] instead of a raw file
//! descriptor, so the same register model serves a loopback test double
//! or a TCP-backed terminal without the device knowing which.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use es40_bus::BusEndpoint;
use es40_interrupts::PicPair;
use es40_snapshot::Savable;

const FIFO_SIZE: usize = 1024;

/// Where a UART's transmitted bytes go, and where its received bytes come
/// from. A `TcpSerialBackend` (spec.md §4.8) implements this over a TCP
/// stream; tests use an in-memory loopback.
pub trait SerialBackend: Send + Sync {
    fn transmit(&self, byte: u8);
}

pub struct NullBackend;
impl SerialBackend for NullBackend {
    fn transmit(&self, _byte: u8) {}
}

struct Inner {
    ier: u8,
    iir: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    spr: u8,
    divisor_lsb: u8,
    divisor_msb: u8,
    rx: VecDeque<u8>,
    irq_active: bool,
}

pub struct Uart {
    inner: Mutex<Inner>,
    backend: Arc<dyn SerialBackend>,
    pic: Arc<Mutex<PicPair>>,
    irq: u8,
}

impl Uart {
    pub fn new(backend: Arc<dyn SerialBackend>, pic: Arc<Mutex<PicPair>>, irq: u8) -> Self {
        Uart {
            inner: Mutex::new(Inner {
                ier: 0,
                iir: 0x01,
                fcr: 0,
                lcr: 0,
                mcr: 0,
                spr: 0,
                divisor_lsb: 0,
                divisor_msb: 0,
                rx: VecDeque::new(),
                irq_active: false,
            }),
            backend,
            pic,
            irq,
        }
    }

    /// Feed a byte into the receive FIFO, as if it arrived over the wire.
    /// Dropped once the FIFO reaches 1024 bytes (`Serial.cpp`'s
    /// `FIFO_SIZE`).
    pub fn receive(&self, byte: u8) {
        let mut inner = self.inner.lock().unwrap();
        if inner.rx.len() < FIFO_SIZE {
            inner.rx.push_back(byte);
        }
        self.eval_interrupts(&mut inner);
    }

    fn eval_interrupts(&self, inner: &mut Inner) {
        inner.iir = if inner.ier & 0x01 != 0 && !inner.rx.is_empty() {
            0x04
        } else if inner.ier & 0x02 != 0 {
            0x02
        } else {
            0x01
        };
        let should_assert = inner.iir > 0x01;
        if should_assert && !inner.irq_active {
            inner.irq_active = true;
            self.pic.lock().unwrap().interrupt(0, self.irq);
        } else if !should_assert && inner.irq_active {
            inner.irq_active = false;
        }
    }

    pub fn read_port(&self, offset: u64) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        match offset {
            0 => {
                if inner.lcr & 0x80 != 0 {
                    inner.divisor_lsb
                } else {
                    inner.rx.pop_front().unwrap_or(0)
                }
            }
            1 => {
                if inner.lcr & 0x80 != 0 {
                    inner.divisor_msb
                } else {
                    inner.ier
                }
            }
            2 => {
                let d = inner.iir;
                inner.iir = 0x01;
                d
            }
            3 => inner.lcr,
            4 => inner.mcr,
            5 => {
                if inner.rx.is_empty() {
                    0x60
                } else {
                    0x61
                }
            }
            6 => 0x30,
            _ => inner.spr,
        }
    }

    pub fn write_port(&self, offset: u64, value: u8) {
        let mut inner = self.inner.lock().unwrap();
        match offset {
            0 => {
                if inner.lcr & 0x80 != 0 {
                    inner.divisor_lsb = value;
                } else {
                    self.backend.transmit(value);
                    self.eval_interrupts(&mut inner);
                }
            }
            1 => {
                if inner.lcr & 0x80 != 0 {
                    inner.divisor_msb = value;
                } else {
                    inner.ier = value;
                    self.eval_interrupts(&mut inner);
                }
            }
            2 => inner.fcr = value,
            3 => inner.lcr = value,
            4 => inner.mcr = value,
            _ => inner.spr = value,
        }
    }
}

impl Savable for Uart {
    fn magic1(&self) -> [u8; 4] {
        *b"UAR0"
    }
    fn magic2(&self) -> [u8; 4] {
        *b"0RAU"
    }
    fn save_state(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut buf = vec![
            inner.ier,
            inner.iir,
            inner.fcr,
            inner.lcr,
            inner.mcr,
            inner.spr,
            inner.divisor_lsb,
            inner.divisor_msb,
            inner.irq_active as u8,
        ];
        buf.extend_from_slice(&(inner.rx.len() as u32).to_le_bytes());
        buf.extend(inner.rx.iter().copied());
        buf
    }
    fn load_state(&self, blob: &[u8]) -> es40_error::Result<()> {
        if blob.len() < 13 {
            return Err(es40_error::Error::illegal_state("uart", "truncated snapshot"));
        }
        let len = u32::from_le_bytes(blob[9..13].try_into().unwrap()) as usize;
        if blob.len() != 13 + len {
            return Err(es40_error::Error::illegal_state("uart", "bad rx fifo length"));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.ier = blob[0];
        inner.iir = blob[1];
        inner.fcr = blob[2];
        inner.lcr = blob[3];
        inner.mcr = blob[4];
        inner.spr = blob[5];
        inner.divisor_lsb = blob[6];
        inner.divisor_msb = blob[7];
        inner.irq_active = blob[8] != 0;
        inner.rx = blob[13..].iter().copied().collect();
        Ok(())
    }
}

impl BusEndpoint for Uart {
    fn read(&self, _range_id: u32, offset: u64, _size: u8) -> u64 {
        self.read_port(offset) as u64
    }

    fn write(&self, _range_id: u32, offset: u64, _size: u8, value: u64) {
        self.write_port(offset, value as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use es40_interrupts::InterruptLine;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct TestLine(Arc<AtomicBool>);
    impl InterruptLine for TestLine {
        fn set_line(&self, asserted: bool) {
            self.0.store(asserted, Ordering::SeqCst);
        }
    }

    struct CapturingBackend(StdMutex<Vec<u8>>);
    impl SerialBackend for CapturingBackend {
        fn transmit(&self, byte: u8) {
            self.0.lock().unwrap().push(byte);
        }
    }

    fn setup() -> (Uart, Arc<AtomicBool>, Arc<CapturingBackend>) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut pair = PicPair::new(Box::new(TestLine(flag.clone())));
        pair.write_cmd(0, 0x11).unwrap();
        pair.write_data(0, 0x20).unwrap();
        pair.write_data(0, 0x04).unwrap();
        pair.write_data(0, 0x01).unwrap();
        let backend = Arc::new(CapturingBackend(StdMutex::new(Vec::new())));
        let uart = Uart::new(backend.clone(), Arc::new(Mutex::new(pair)), 4);
        (uart, flag, backend)
    }

    #[test]
    fn transmitted_byte_reaches_backend() {
        let (uart, _flag, backend) = setup();
        uart.write_port(0, b'A');
        assert_eq!(backend.0.lock().unwrap().as_slice(), &[b'A']);
    }

    #[test]
    fn rx_data_ready_raises_irq_when_enabled() {
        let (uart, flag, _backend) = setup();
        uart.write_port(1, 0x01); // enable data-ready interrupt
        uart.receive(b'Z');
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(uart.read_port(0), b'Z');
    }

    #[test]
    fn divisor_latch_is_gated_by_lcr_bit7() {
        let (uart, _flag, _backend) = setup();
        uart.write_port(3, 0x80);
        uart.write_port(0, 0x0c);
        uart.write_port(1, 0x00);
        assert_eq!(uart.read_port(0), 0x0c);
        uart.write_port(3, 0x00);
    }

    #[test]
    fn fifo_drops_past_1024_bytes() {
        let (uart, _flag, _backend) = setup();
        for i in 0..1100 {
            uart.receive((i % 256) as u8);
        }
        assert_eq!(uart.inner.lock().unwrap().rx.len(), FIFO_SIZE);
    }
}
