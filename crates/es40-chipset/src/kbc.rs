//! 8042 keyboard/mouse controller, ports 0x60/0x64, grounded on
//! `original_source/src/Keyboard.cpp` (itself adapted from Bochs). This
//! keeps the controller-command subset the source actually exercises
//! (get/set command byte, aux and keyboard clock enable, self test,
//! interface test, output-port read/write, write-to-mouse) and the two
//! FIFOs (`kbd_internal_buffer`, the controller output queue) bounded at
//! 1024 bytes as the source's `BX_KBD_ELEMENTS`/`BX_MOUSE_BUFF_SIZE`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use es40_bus::BusEndpoint;
use es40_interrupts::PicPair;
use es40_snapshot::Savable;

const FIFO_CAPACITY: usize = 1024;

#[derive(Default)]
struct Status {
    outb: bool,
    auxb: bool,
    sysf: bool,
    c_d: bool,
    inpb: bool,
}

struct Inner {
    status: Status,
    kbd_output_buffer: u8,
    aux_output_buffer: u8,
    kbd_fifo: VecDeque<u8>,
    mouse_fifo: VecDeque<u8>,
    kbd_clock_enabled: bool,
    aux_clock_enabled: bool,
    allow_irq1: bool,
    allow_irq12: bool,
    scancodes_translate: bool,
    expecting_port60h: Option<Expecting>,
    irq12_requested: bool,
    irq1_requested: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Expecting {
    CommandByte,
    OutputPort,
    WriteToMouse,
}

pub struct Kbc {
    inner: Mutex<Inner>,
    pic: Arc<Mutex<PicPair>>,
}

impl Kbc {
    pub fn new(pic: Arc<Mutex<PicPair>>) -> Self {
        Kbc {
            inner: Mutex::new(Inner {
                status: Status { sysf: true, ..Default::default() },
                kbd_output_buffer: 0,
                aux_output_buffer: 0,
                kbd_fifo: VecDeque::new(),
                mouse_fifo: VecDeque::new(),
                kbd_clock_enabled: true,
                aux_clock_enabled: true,
                allow_irq1: true,
                allow_irq12: true,
                scancodes_translate: true,
                expecting_port60h: None,
                irq12_requested: false,
                irq1_requested: false,
            }),
            pic,
        }
    }

    /// Push a raw scancode from the emulated keyboard device into the
    /// internal FIFO, per `CKeyboard::enQ`. Dropped if the FIFO is full.
    pub fn enqueue_scancode(&self, scancode: u8) {
        let mut inner = self.inner.lock().unwrap();
        if inner.kbd_fifo.len() >= FIFO_CAPACITY {
            tracing::warn!("keyboard FIFO full, dropping scancode");
            return;
        }
        inner.kbd_fifo.push_back(scancode);
        self.deliver_kbd(&mut inner);
    }

    pub fn enqueue_mouse_byte(&self, byte: u8) {
        let mut inner = self.inner.lock().unwrap();
        if inner.mouse_fifo.len() >= FIFO_CAPACITY {
            tracing::warn!("mouse FIFO full, dropping byte");
            return;
        }
        inner.mouse_fifo.push_back(byte);
        self.deliver_mouse(&mut inner);
    }

    fn deliver_kbd(&self, inner: &mut Inner) {
        if !inner.status.outb && inner.kbd_clock_enabled {
            if let Some(b) = inner.kbd_fifo.pop_front() {
                inner.kbd_output_buffer = b;
                inner.status.outb = true;
                inner.status.auxb = false;
                if inner.allow_irq1 {
                    inner.irq1_requested = true;
                    self.pic.lock().unwrap().interrupt(0, 1);
                }
            }
        }
    }

    fn deliver_mouse(&self, inner: &mut Inner) {
        if !inner.status.outb && inner.aux_clock_enabled {
            if let Some(b) = inner.mouse_fifo.pop_front() {
                inner.aux_output_buffer = b;
                inner.status.outb = true;
                inner.status.auxb = true;
                if inner.allow_irq12 {
                    inner.irq12_requested = true;
                    self.pic.lock().unwrap().interrupt(1, 4);
                }
            }
        }
    }

    pub fn read_data(&self) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        if inner.status.auxb {
            let val = inner.aux_output_buffer;
            inner.status.outb = false;
            inner.status.auxb = false;
            inner.irq12_requested = false;
            self.deliver_kbd_or_mouse_after_read(&mut inner);
            val
        } else if inner.status.outb {
            let val = inner.kbd_output_buffer;
            inner.status.outb = false;
            inner.irq1_requested = false;
            self.deliver_kbd_or_mouse_after_read(&mut inner);
            val
        } else {
            inner.kbd_output_buffer
        }
    }

    fn deliver_kbd_or_mouse_after_read(&self, inner: &mut Inner) {
        if !inner.mouse_fifo.is_empty() {
            self.deliver_mouse(inner);
        } else {
            self.deliver_kbd(inner);
        }
    }

    pub fn read_status(&self) -> u8 {
        let inner = self.inner.lock().unwrap();
        (inner.status.auxb as u8) << 5
            | (inner.status.c_d as u8) << 3
            | (inner.status.sysf as u8) << 2
            | (inner.status.inpb as u8) << 1
            | (inner.status.outb as u8)
    }

    pub fn write_data(&self, value: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.status.c_d = false;
        match inner.expecting_port60h.take() {
            Some(Expecting::CommandByte) => {
                inner.scancodes_translate = value & 0x40 != 0;
                inner.aux_clock_enabled = value & 0x20 == 0;
                inner.kbd_clock_enabled = value & 0x10 == 0;
                inner.allow_irq12 = value & 0x02 != 0;
                inner.allow_irq1 = value & 0x01 != 0;
            }
            Some(Expecting::OutputPort) | Some(Expecting::WriteToMouse) => {
                // Accepted for protocol completeness; the emulated platform
                // has no gate-A20 line or real PS/2 mouse to forward this to.
            }
            None => {
                // A data byte sent straight to the keyboard device itself
                // (e.g. 0xF4 enable scanning); acknowledge it.
                self.enqueue_scancode_locked(&mut inner, 0xfa);
            }
        }
    }

    fn enqueue_scancode_locked(&self, inner: &mut Inner, scancode: u8) {
        if inner.kbd_fifo.len() < FIFO_CAPACITY {
            inner.kbd_fifo.push_back(scancode);
        }
        self.deliver_kbd(inner);
    }

    fn controller_enq(&self, inner: &mut Inner, data: u8) {
        inner.kbd_output_buffer = data;
        inner.status.outb = true;
        inner.status.auxb = false;
    }

    pub fn write_command(&self, value: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.status.c_d = true;
        inner.expecting_port60h = None;
        match value {
            0x20 => {
                let byte = ((inner.scancodes_translate as u8) << 6)
                    | ((!inner.aux_clock_enabled as u8) << 5)
                    | ((!inner.kbd_clock_enabled as u8) << 4)
                    | ((inner.status.sysf as u8) << 2)
                    | ((inner.allow_irq12 as u8) << 1)
                    | (inner.allow_irq1 as u8);
                self.controller_enq(&mut inner, byte);
            }
            0x60 => inner.expecting_port60h = Some(Expecting::CommandByte),
            0xa7 => inner.aux_clock_enabled = false,
            0xa8 => inner.aux_clock_enabled = true,
            0xa9 => self.controller_enq(&mut inner, 0x00),
            0xaa => {
                inner.status.sysf = true;
                self.controller_enq(&mut inner, 0x55);
            }
            0xab => self.controller_enq(&mut inner, 0x00),
            0xad => inner.kbd_clock_enabled = false,
            0xae => inner.kbd_clock_enabled = true,
            0xc0 => self.controller_enq(&mut inner, 0x80),
            0xd0 => {
                let byte =
                    ((inner.irq12_requested as u8) << 5) | ((inner.irq1_requested as u8) << 4) | 0x01;
                self.controller_enq(&mut inner, byte);
            }
            0xd1 => inner.expecting_port60h = Some(Expecting::OutputPort),
            0xd2 | 0xd3 => inner.expecting_port60h = Some(Expecting::WriteToMouse),
            0xd4 => inner.expecting_port60h = Some(Expecting::WriteToMouse),
            _ => {}
        }
    }
}

fn encode_fifo(buf: &mut Vec<u8>, fifo: &VecDeque<u8>) {
    buf.extend_from_slice(&(fifo.len() as u32).to_le_bytes());
    buf.extend(fifo.iter().copied());
}

fn decode_fifo(blob: &[u8], pos: &mut usize) -> es40_error::Result<VecDeque<u8>> {
    if blob.len() < *pos + 4 {
        return Err(es40_error::Error::illegal_state("kbc", "truncated fifo length"));
    }
    let len = u32::from_le_bytes(blob[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if blob.len() < *pos + len {
        return Err(es40_error::Error::illegal_state("kbc", "truncated fifo body"));
    }
    let fifo = blob[*pos..*pos + len].iter().copied().collect();
    *pos += len;
    Ok(fifo)
}

impl Savable for Kbc {
    fn magic1(&self) -> [u8; 4] {
        *b"KBC0"
    }
    fn magic2(&self) -> [u8; 4] {
        *b"0CBK"
    }
    fn save_state(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let flags = (inner.status.outb as u8)
            | (inner.status.auxb as u8) << 1
            | (inner.status.sysf as u8) << 2
            | (inner.status.c_d as u8) << 3
            | (inner.status.inpb as u8) << 4
            | (inner.kbd_clock_enabled as u8) << 5
            | (inner.aux_clock_enabled as u8) << 6
            | (inner.scancodes_translate as u8) << 7;
        let flags2 = (inner.allow_irq1 as u8)
            | (inner.allow_irq12 as u8) << 1
            | (inner.irq1_requested as u8) << 2
            | (inner.irq12_requested as u8) << 3;
        let expecting = match inner.expecting_port60h {
            None => 0u8,
            Some(Expecting::CommandByte) => 1,
            Some(Expecting::OutputPort) => 2,
            Some(Expecting::WriteToMouse) => 3,
        };
        let mut buf = vec![
            flags,
            flags2,
            expecting,
            inner.kbd_output_buffer,
            inner.aux_output_buffer,
        ];
        encode_fifo(&mut buf, &inner.kbd_fifo);
        encode_fifo(&mut buf, &inner.mouse_fifo);
        buf
    }
    fn load_state(&self, blob: &[u8]) -> es40_error::Result<()> {
        if blob.len() < 5 {
            return Err(es40_error::Error::illegal_state("kbc", "truncated snapshot header"));
        }
        let flags = blob[0];
        let flags2 = blob[1];
        let expecting = blob[2];
        let mut pos = 5;
        let kbd_fifo = decode_fifo(blob, &mut pos)?;
        let mouse_fifo = decode_fifo(blob, &mut pos)?;
        let mut inner = self.inner.lock().unwrap();
        inner.status.outb = flags & 0x01 != 0;
        inner.status.auxb = flags & 0x02 != 0;
        inner.status.sysf = flags & 0x04 != 0;
        inner.status.c_d = flags & 0x08 != 0;
        inner.status.inpb = flags & 0x10 != 0;
        inner.kbd_clock_enabled = flags & 0x20 != 0;
        inner.aux_clock_enabled = flags & 0x40 != 0;
        inner.scancodes_translate = flags & 0x80 != 0;
        inner.allow_irq1 = flags2 & 0x01 != 0;
        inner.allow_irq12 = flags2 & 0x02 != 0;
        inner.irq1_requested = flags2 & 0x04 != 0;
        inner.irq12_requested = flags2 & 0x08 != 0;
        inner.expecting_port60h = match expecting {
            1 => Some(Expecting::CommandByte),
            2 => Some(Expecting::OutputPort),
            3 => Some(Expecting::WriteToMouse),
            _ => None,
        };
        inner.kbd_output_buffer = blob[3];
        inner.aux_output_buffer = blob[4];
        inner.kbd_fifo = kbd_fifo;
        inner.mouse_fifo = mouse_fifo;
        Ok(())
    }
}

impl BusEndpoint for Kbc {
    fn read(&self, _range_id: u32, offset: u64, _size: u8) -> u64 {
        match offset {
            0 => self.read_data() as u64,
            _ => self.read_status() as u64,
        }
    }

    fn write(&self, _range_id: u32, offset: u64, _size: u8, value: u64) {
        match offset {
            0 => self.write_data(value as u8),
            _ => self.write_command(value as u8),
        }
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

    fn setup() -> (Kbc, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut pair = PicPair::new(Box::new(TestLine(flag.clone())));
        pair.write_cmd(0, 0x11).unwrap();
        pair.write_data(0, 0x20).unwrap();
        pair.write_data(0, 0x04).unwrap();
        pair.write_data(0, 0x01).unwrap();
        (Kbc::new(Arc::new(Mutex::new(pair))), flag)
    }

    #[test]
    fn scancode_sets_outb_and_raises_irq1() {
        let (kbc, flag) = setup();
        kbc.enqueue_scancode(0x1e);
        assert_eq!(kbc.read_status() & 0x01, 0x01);
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(kbc.read_data(), 0x1e);
        assert_eq!(kbc.read_status() & 0x01, 0x00);
    }

    #[test]
    fn self_test_reports_55_and_sets_sysf() {
        let (kbc, _flag) = setup();
        kbc.write_command(0xaa);
        assert_eq!(kbc.read_status() & 0x04, 0x04);
        assert_eq!(kbc.read_data(), 0x55);
    }

    #[test]
    fn fifo_drops_past_capacity() {
        let (kbc, _flag) = setup();
        for i in 0..(FIFO_CAPACITY + 10) {
            kbc.enqueue_scancode((i % 256) as u8);
        }
        assert!(kbc.inner.lock().unwrap().kbd_fifo.len() <= FIFO_CAPACITY);
    }

    #[test]
    fn command_byte_write_disables_keyboard_clock() {
        let (kbc, _flag) = setup();
        kbc.write_command(0x60);
        kbc.write_data(0x10); // disable keyboard clock bit
        assert!(!kbc.inner.lock().unwrap().kbd_clock_enabled);
    }
}
