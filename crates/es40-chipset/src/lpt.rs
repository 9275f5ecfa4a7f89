//! Parallel port (LPT), grounded on `original_source/src/AliM1543C.cpp`'s
//! `lpt_read`/`lpt_write`/`lpt_reset`. Output bytes are written through a
//! sink (a file in the source, any `std::io::Write` here) on a strobe
//! with the select bit set, raising IRQ 7 if interrupts are enabled.

use std::io::Write;
use std::sync::{Arc, Mutex};

use es40_bus::BusEndpoint;
use es40_interrupts::PicPair;
use es40_snapshot::Savable;

struct Inner {
    data: u8,
    status: u8,
    control: u8,
    init: bool,
}

pub struct Lpt {
    inner: Mutex<Inner>,
    sink: Mutex<Option<Box<dyn Write + Send>>>,
    pic: Arc<Mutex<PicPair>>,
}

impl Lpt {
    pub fn new(pic: Arc<Mutex<PicPair>>) -> Self {
        Lpt {
            inner: Mutex::new(Inner {
                data: 0xff,
                status: 0xd8,
                control: 0x0c,
                init: false,
            }),
            sink: Mutex::new(None),
            pic,
        }
    }

    pub fn set_sink(&self, sink: Box<dyn Write + Send>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    pub fn read_port(&self, offset: u64) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        match offset {
            0 => inner.data,
            1 => {
                let data = inner.status;
                if inner.status & 0x80 == 0 && inner.control & 0x01 == 0 {
                    if inner.status & 0x40 != 0 {
                        inner.status &= !0x40;
                    } else {
                        inner.status |= 0x40;
                        inner.status |= 0x80;
                    }
                }
                data
            }
            _ => inner.control,
        }
    }

    pub fn write_port(&self, offset: u64, data: u8) {
        let mut inner = self.inner.lock().unwrap();
        match offset {
            0 => inner.data = data,
            1 => {}
            2 => {
                if data & 0x04 == 0 {
                    inner.init = true;
                    inner.status = 0xd8;
                } else if data & 0x08 != 0 && data & 0x01 != 0 {
                    inner.status &= !0x80;
                    if inner.init {
                        if let Some(sink) = self.sink.lock().unwrap().as_mut() {
                            let _ = sink.write_all(&[inner.data]);
                        }
                    }
                    if inner.control & 0x10 != 0 {
                        self.pic.lock().unwrap().interrupt(0, 7);
                    }
                }
                inner.control = data;
            }
            _ => {}
        }
    }
}

impl Savable for Lpt {
    fn magic1(&self) -> [u8; 4] {
        *b"LPT0"
    }
    fn magic2(&self) -> [u8; 4] {
        *b"0TPL"
    }
    fn save_state(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        vec![inner.data, inner.status, inner.control, inner.init as u8]
    }
    fn load_state(&self, blob: &[u8]) -> es40_error::Result<()> {
        if blob.len() != 4 {
            return Err(es40_error::Error::illegal_state("lpt", "bad snapshot length"));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.data = blob[0];
        inner.status = blob[1];
        inner.control = blob[2];
        inner.init = blob[3] != 0;
        Ok(())
    }
}

impl BusEndpoint for Lpt {
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

    struct TestLine(Arc<AtomicBool>);
    impl InterruptLine for TestLine {
        fn set_line(&self, asserted: bool) {
            self.0.store(asserted, Ordering::SeqCst);
        }
    }

    fn setup() -> (Lpt, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut pair = PicPair::new(Box::new(TestLine(flag.clone())));
        pair.write_cmd(0, 0x11).unwrap();
        pair.write_data(0, 0x20).unwrap();
        pair.write_data(0, 0x04).unwrap();
        pair.write_data(0, 0x01).unwrap();
        (Lpt::new(Arc::new(Mutex::new(pair))), flag)
    }

    #[test]
    fn strobe_with_interrupt_enable_raises_irq7() {
        let (lpt, flag) = setup();
        lpt.write_port(2, 0x00); // init pulse
        lpt.write_port(0, b'X');
        lpt.write_port(2, 0x1d); // select + strobe + irq enable
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn data_readback_returns_last_write() {
        let (lpt, _flag) = setup();
        lpt.write_port(0, 0x42);
        assert_eq!(lpt.read_port(0), 0x42);
    }
}
