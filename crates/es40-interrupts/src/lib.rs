//! Interrupt Fabric and the cascaded 8259A PIC pair (spec.md §4.3).
//!
//! The source's two `CDMA8259` (sic, named after the DMA chip's cascade
//! wiring in the original, but the class is `CPIC`) instances are merged
//! here into a single [`PicPair`] holding both controllers, since their
//! cascade relationship (PIC 1's output feeds PIC 0's IRQ 2) is intrinsic
//! to the 8259A programming model spec.md §3/§4.3 describes and is awkward
//! to express as two independent objects without a third mediator.

use es40_error::{Error, Result};

/// The single CPU-visible interrupt line the PIC cascade drives (line 55
/// on this platform, per spec.md §4.3).
pub trait InterruptLine: Send + Sync {
    fn set_line(&self, asserted: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    /// Expecting ICW2 (base vector) on the next data-port write.
    ExpectIcw2,
    /// Expecting ICW3 (cascade wiring).
    ExpectIcw3,
    /// Expecting ICW4 (mode), only reached if ICW1 requested it.
    ExpectIcw4,
    /// Normal operation: data-port writes are OCW1 (mask).
    Std,
}

#[derive(Debug, Clone, Copy, Default)]
struct Controller {
    mask: u8,
    asserted: u8,
    edge_level: u8,
    base_vector: u8,
    cascade_word: u8,
    mode: u8,
    icw4_needed: bool,
    read_isr: bool,
}

impl Controller {
    fn begin_init(&mut self, icw1: u8) {
        self.edge_level = if icw1 & 0x08 != 0 { 0xFF } else { 0x00 };
        self.icw4_needed = icw1 & 0x01 != 0;
        self.asserted = 0;
    }

    fn lowest_bit(v: u8) -> Option<u8> {
        if v == 0 {
            None
        } else {
            Some(v.trailing_zeros() as u8)
        }
    }
}

/// Two cascaded 8259A-compatible controllers (index 0 = master wired to the
/// CPU, index 1 = slave cascaded through master IRQ 2), per spec.md §3/§4.3.
pub struct PicPair {
    ctrl: [Controller; 2],
    init_state: [InitState; 2],
    line: Box<dyn InterruptLine>,
}

const CASCADE_IRQ: u8 = 2;

impl PicPair {
    pub fn new(line: Box<dyn InterruptLine>) -> Self {
        let pair = PicPair {
            ctrl: [Controller::default(); 2],
            init_state: [InitState::Std, InitState::Std],
            line,
        };
        pair.line.set_line(false);
        pair
    }

    fn pending(c: &Controller) -> u8 {
        c.asserted & !c.mask
    }

    fn eval_line(&self) {
        self.line.set_line(Self::pending(&self.ctrl[0]) != 0);
    }

    /// Command-port write (offset 0). ICW1 if bit 4 is set; otherwise OCW2
    /// (EOI) or OCW3, per spec.md §4.3.
    pub fn write_cmd(&mut self, ctrl: usize, value: u8) -> Result<()> {
        self.check_ctrl(ctrl)?;
        if value & 0x10 != 0 {
            self.ctrl[ctrl].begin_init(value);
            self.init_state[ctrl] = InitState::ExpectIcw2;
            self.eval_line();
            return Ok(());
        }
        if self.init_state[ctrl] != InitState::Std {
            return Err(Error::illegal_state(
                "pic",
                "command-port write during initialization sequence",
            ));
        }
        if value & 0x18 == 0x00 {
            // OCW2: R SL EOI | level
            let eoi = value & 0x20 != 0;
            let specific = value & 0x40 != 0;
            if eoi {
                if specific {
                    let irq = value & 0x07;
                    self.ctrl[ctrl].asserted &= !(1 << irq);
                } else {
                    self.ctrl[ctrl].asserted = 0;
                }
                if ctrl == 1 && self.ctrl[1].asserted == 0 {
                    self.ctrl[0].asserted &= !(1 << CASCADE_IRQ);
                }
            }
        } else {
            // OCW3
            self.ctrl[ctrl].read_isr = value & 0x01 != 0;
        }
        self.eval_line();
        Ok(())
    }

    /// Data-port write (offset 1). During initialization this feeds the
    /// ICW2/ICW3/ICW4 sequence; afterwards it is OCW1 (IMR).
    pub fn write_data(&mut self, ctrl: usize, value: u8) -> Result<()> {
        self.check_ctrl(ctrl)?;
        match self.init_state[ctrl] {
            InitState::ExpectIcw2 => {
                self.ctrl[ctrl].base_vector = value & 0xF8;
                self.init_state[ctrl] = InitState::ExpectIcw3;
            }
            InitState::ExpectIcw3 => {
                self.ctrl[ctrl].cascade_word = value;
                self.init_state[ctrl] = if self.ctrl[ctrl].icw4_needed {
                    InitState::ExpectIcw4
                } else {
                    InitState::Std
                };
            }
            InitState::ExpectIcw4 => {
                self.ctrl[ctrl].mode = value;
                self.init_state[ctrl] = InitState::Std;
            }
            InitState::Std => {
                self.ctrl[ctrl].mask = value;
            }
        }
        self.eval_line();
        Ok(())
    }

    pub fn read_cmd(&self, ctrl: usize) -> Result<u8> {
        self.check_ctrl(ctrl)?;
        // IRR and ISR are merged into a single `asserted` latch in this
        // model (spec.md §3); both OCW3 read selections observe it.
        Ok(self.ctrl[ctrl].asserted)
    }

    pub fn read_data(&self, ctrl: usize) -> Result<u8> {
        self.check_ctrl(ctrl)?;
        Ok(self.ctrl[ctrl].mask)
    }

    fn check_ctrl(&self, ctrl: usize) -> Result<()> {
        if ctrl > 1 {
            Err(Error::invalid_argument("pic", "controller index out of range"))
        } else {
            Ok(())
        }
    }

    /// Assert `irq` on controller `ctrl`, per the five-step algorithm in
    /// spec.md §4.3.
    pub fn interrupt(&mut self, ctrl: usize, irq: u8) {
        debug_assert!(ctrl <= 1 && irq <= 7);
        let c = &mut self.ctrl[ctrl];
        if c.mask & (1 << irq) != 0 {
            return;
        }
        if c.asserted & (1 << irq) != 0 {
            return;
        }
        c.asserted |= 1 << irq;
        if ctrl == 1 {
            self.interrupt(0, CASCADE_IRQ);
        }
        self.eval_line();
    }

    /// Vector read during a PCI-IACK cycle (spec.md §4.3).
    pub fn iack(&self) -> u8 {
        let c0 = &self.ctrl[0];
        match Controller::lowest_bit(Self::pending(c0)) {
            None => c0.base_vector | 0x07,
            Some(CASCADE_IRQ) => {
                let c1 = &self.ctrl[1];
                match Controller::lowest_bit(Self::pending(c1)) {
                    Some(bit) => c1.base_vector + bit,
                    None => c1.base_vector | 0x07,
                }
            }
            Some(bit) => c0.base_vector + bit,
        }
    }

    pub fn line_asserted(&self) -> bool {
        Self::pending(&self.ctrl[0]) != 0
    }

    pub fn mask(&self, ctrl: usize) -> u8 {
        self.ctrl[ctrl].mask
    }

    pub fn asserted(&self, ctrl: usize) -> u8 {
        self.ctrl[ctrl].asserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TestLine(Arc<AtomicBool>);
    impl InterruptLine for TestLine {
        fn set_line(&self, asserted: bool) {
            self.0.store(asserted, Ordering::SeqCst);
        }
    }

    fn init_pair() -> (PicPair, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut pair = PicPair::new(Box::new(TestLine(flag.clone())));
        // ICW1 with ICW4 needed.
        pair.write_cmd(0, 0x11).unwrap();
        pair.write_data(0, 0x20).unwrap(); // ICW2: base 0x20
        pair.write_data(0, 0x04).unwrap(); // ICW3: slave on IRQ2
        pair.write_data(0, 0x01).unwrap(); // ICW4
        pair.write_cmd(1, 0x11).unwrap();
        pair.write_data(1, 0x28).unwrap(); // ICW2: base 0x28
        pair.write_data(1, 0x02).unwrap(); // ICW3: cascade identity 2
        pair.write_data(1, 0x01).unwrap(); // ICW4
        (pair, flag)
    }

    #[test]
    fn cascade_eoi_scenario() {
        // spec.md §8 scenario 1: PIC0 base 0x20, PIC1 base 0x28; IRQ 9 (IRQ1
        // on PIC1) asserts; IACK must read 0x29; EOI to both clears the
        // line.
        let (mut pair, flag) = init_pair();
        pair.interrupt(1, 1);
        assert!(flag.load(Ordering::SeqCst), "CPU line must be asserted");
        assert_eq!(pair.iack(), 0x29);

        pair.write_cmd(1, 0x20).unwrap(); // non-specific EOI on slave
        pair.write_cmd(0, 0x20).unwrap(); // non-specific EOI on master
        assert!(!flag.load(Ordering::SeqCst), "CPU line must fall");
    }

    #[test]
    fn imr_readback_matches_written_mask() {
        let (mut pair, _flag) = init_pair();
        pair.write_data(0, 0xAA).unwrap();
        assert_eq!(pair.read_data(0).unwrap(), 0xAA);
    }

    #[test]
    fn masked_irq_is_dropped() {
        let (mut pair, flag) = init_pair();
        pair.write_data(0, 0x01).unwrap(); // mask IRQ0
        pair.interrupt(0, 0);
        assert!(!flag.load(Ordering::SeqCst));
        assert_eq!(pair.asserted(0), 0);
    }

    #[test]
    fn double_assert_is_idempotent() {
        let (mut pair, _flag) = init_pair();
        pair.interrupt(0, 3);
        pair.interrupt(0, 3);
        assert_eq!(pair.asserted(0), 1 << 3);
    }

    #[test]
    fn specific_eoi_clears_only_named_bit() {
        let (mut pair, flag) = init_pair();
        pair.interrupt(0, 3);
        pair.interrupt(0, 5);
        pair.write_cmd(0, 0x60 | 3).unwrap(); // specific EOI for IRQ3
        assert_eq!(pair.asserted(0), 1 << 5);
        assert!(flag.load(Ordering::SeqCst));
        pair.write_cmd(0, 0x60 | 5).unwrap();
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn cascade_clears_primary_bit2_when_slave_empties() {
        let (mut pair, _flag) = init_pair();
        pair.interrupt(1, 4);
        assert_eq!(pair.asserted(0) & (1 << CASCADE_IRQ), 1 << CASCADE_IRQ);
        pair.write_cmd(1, 0x20).unwrap();
        assert_eq!(pair.asserted(0) & (1 << CASCADE_IRQ), 0);
    }
}
