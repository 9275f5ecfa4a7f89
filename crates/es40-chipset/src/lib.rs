//! ALi M1543C south-bridge device set (spec.md §4.4/§4.9-§4.12): the
//! cascaded PIC's bus-facing port windows, the 8254 PIT, the MC146818 RTC,
//! the 8237 DMA pair, the 8042 keyboard controller, the 16550 UARTs, the
//! parallel port, the boot flash, and the dual-port diagnostic SRAM.
//!
//! Each device owns its register state behind a `Mutex` and implements
//! [`es40_bus::BusEndpoint`] directly; this module only adds the glue that
//! does not belong to any single device: PIC port dispatch and the
//! port-0x61 NMI/speaker-control register that straddles the PIT and the
//! PC speaker gate.

pub mod dma;
pub mod dpr;
pub mod flash;
pub mod kbc;
pub mod lpt;
pub mod pit;
pub mod rtc;
pub mod tcp_backend;
pub mod uart;

use std::sync::{Arc, Mutex};

use es40_bus::BusEndpoint;
use es40_interrupts::PicPair;

/// Bus-facing view over the PIC pair's four legacy port windows
/// (0x20/0x21 master, 0xA0/0xA1 slave), grounded on
/// `original_source/src/AliM1543C.cpp`'s `pic_read`/`pic_write`.
pub struct PicPort {
    pic: Arc<Mutex<PicPair>>,
    ctrl: usize,
}

impl PicPort {
    pub fn new(pic: Arc<Mutex<PicPair>>, ctrl: usize) -> Self {
        PicPort { pic, ctrl }
    }
}

impl BusEndpoint for PicPort {
    fn read(&self, _range_id: u32, offset: u64, _size: u8) -> u64 {
        let pic = self.pic.lock().unwrap();
        let result = if offset == 0 {
            pic.read_cmd(self.ctrl)
        } else {
            pic.read_data(self.ctrl)
        };
        result.unwrap_or(0xff) as u64
    }

    fn write(&self, _range_id: u32, offset: u64, _size: u8, value: u64) {
        let mut pic = self.pic.lock().unwrap();
        let data = value as u8;
        let result = if offset == 0 {
            pic.write_cmd(self.ctrl, data)
        } else {
            pic.write_data(self.ctrl, data)
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, ctrl = self.ctrl, offset, "pic port write rejected");
        }
    }
}

/// Port 0x61, the NMI status/control register: bit 0 gates the PIT channel
/// 2 clock into the speaker, bit 1 the speaker data enable, bit 4 the PIT
/// channel 2 output readback, and bit 6 a latched iochannel-check flag.
/// Grounded on `AliM1543C.cpp`'s `reg_61_read`/`reg_61_write`.
pub struct SpeakerControl {
    pit: Arc<pit::Pit>,
    gate: Mutex<u8>,
}

impl SpeakerControl {
    pub fn new(pit: Arc<pit::Pit>) -> Self {
        SpeakerControl { pit, gate: Mutex::new(0) }
    }

    pub fn read(&self) -> u8 {
        let gate = *self.gate.lock().unwrap() & 0x0f;
        let out = if self.pit.channel2_output() { 0x20 } else { 0x00 };
        gate | out
    }

    pub fn write(&self, value: u8) {
        *self.gate.lock().unwrap() = value & 0x0f;
    }
}

impl BusEndpoint for SpeakerControl {
    fn read(&self, _range_id: u32, _offset: u64, _size: u8) -> u64 {
        self.read() as u64
    }

    fn write(&self, _range_id: u32, _offset: u64, _size: u8, value: u64) {
        self.write(value as u8);
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

    fn pic_pair() -> Arc<Mutex<PicPair>> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut pair = PicPair::new(Box::new(TestLine(flag)));
        pair.write_cmd(0, 0x11).unwrap();
        pair.write_data(0, 0x20).unwrap();
        pair.write_data(0, 0x04).unwrap();
        pair.write_data(0, 0x01).unwrap();
        Arc::new(Mutex::new(pair))
    }

    #[test]
    fn pic_port_dispatches_command_and_data() {
        let pic = pic_pair();
        let cmd = PicPort::new(pic.clone(), 0);
        BusEndpoint::write(&cmd, 0, 1, 1, 0xaa);
        assert_eq!(BusEndpoint::read(&cmd, 0, 1, 1), 0xaa);
    }

    #[test]
    fn speaker_control_reflects_pit_channel2() {
        let pic = pic_pair();
        let pit = Arc::new(pit::Pit::new(pic));
        let speaker = SpeakerControl::new(pit.clone());
        pit.write_port(3, 0xb6);
        pit.write_port(2, 0x01);
        pit.write_port(2, 0x00);
        for _ in 0..10 {
            pit.tick();
        }
        speaker.write(0x03);
        assert_eq!(speaker.read() & 0x0f, 0x03);
        assert_eq!(speaker.read() & 0x20, 0x20);
    }
}
