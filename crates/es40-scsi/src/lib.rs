//! Symbios 53C810 SCSI SCRIPTS processor (spec.md §4.5), the hardest core
//! in the substrate: a tiny interpreted instruction set that drives DMA and
//! the SCSI phase state machine without CPU involvement, grounded on
//! `original_source/src/Sym53C810.h`/`.cpp`.

mod regs;
mod scripts;
mod target;

pub use scripts::Outcome;
pub use target::{DiskBackend, Phase, ScsiTarget};

use std::sync::{Arc, Mutex};

use es40_bus::{Bus, BusEndpoint};
use es40_interrupts::PicPair;
use es40_runtime::Semaphore;
use es40_snapshot::Savable;
use regs::*;

pub(crate) struct Inner {
    regs: Regs,
    target: Option<ScsiTarget>,
    target_id: u8,
    phase: Phase,
    cdb: Vec<u8>,
    executing: bool,
    wait_reselect: bool,
    select_timeout_counter: u32,
    dstat_stack: u8,
    sist0_stack: u8,
    sist1_stack: u8,
}

impl Inner {
    fn istat_sigp(&self) -> bool {
        self.regs.b(ISTAT) & ISTAT_SIGP != 0
    }

    fn clear_sigp(&mut self) {
        self.regs.set_b(ISTAT, self.regs.b(ISTAT) & !ISTAT_SIGP);
    }

    fn blocked(&self) -> bool {
        self.regs.b(ISTAT) & (ISTAT_DIP | ISTAT_SIP) != 0
    }

    fn set_interrupt_dstat(&mut self, bit: u8) {
        if self.blocked() {
            self.dstat_stack |= bit;
        } else {
            self.regs.set_b(DSTAT, self.regs.b(DSTAT) | bit);
        }
        self.eval_interrupts();
    }

    fn set_interrupt_sist0(&mut self, bit: u8) {
        if self.blocked() {
            self.sist0_stack |= bit;
        } else {
            self.regs.set_b(SIST0, self.regs.b(SIST0) | bit);
        }
        self.eval_interrupts();
    }

    fn set_interrupt_sist1(&mut self, bit: u8) {
        if self.blocked() {
            self.sist1_stack |= bit;
        } else {
            self.regs.set_b(SIST1, self.regs.b(SIST1) | bit);
        }
        self.eval_interrupts();
    }

    /// Recomputes `ISTAT.DIP`/`ISTAT.SIP` from the live status registers
    /// and their enables (spec.md §8's invariant), returning whether
    /// either is now set.
    fn recompute_istat(&mut self) -> bool {
        let dip = self.regs.b(DSTAT) & self.regs.b(DIEN) & DSTAT_RC != 0;
        // Fatal-bit masks for SIST0/SIST1 are not pinned down numerically
        // by spec.md ("FATAL_MASK_0"/"FATAL_MASK_1"); treated as "every
        // defined bit is fatal", recorded as a design decision.
        let sip = (self.regs.b(SIST0) & (0xff | self.regs.b(SIEN0)) != 0)
            || (self.regs.b(SIST1) & (0x07 | self.regs.b(SIEN1)) != 0);
        let mut istat = self.regs.b(ISTAT) & !(ISTAT_DIP | ISTAT_SIP);
        if dip {
            istat |= ISTAT_DIP;
        }
        if sip {
            istat |= ISTAT_SIP;
        }
        self.regs.set_b(ISTAT, istat);
        dip || sip
    }

    fn eval_interrupts(&mut self) {
        self.recompute_istat();
    }

    /// Read-and-clear semantics for `DSTAT`/`SIST0`/`SIST1`, plus shadow
    /// promotion once neither `DIP` nor `SIP` remains set (spec.md §4.5
    /// "Interrupt stacking").
    fn read_and_clear(&mut self, offset: usize) -> u8 {
        let val = self.regs.b(offset);
        let cleared = match offset {
            DSTAT => val & !DSTAT_RC,
            _ => 0,
        };
        self.regs.set_b(offset, cleared);
        if !self.recompute_istat() {
            self.regs.set_b(DSTAT, self.regs.b(DSTAT) | self.dstat_stack);
            self.regs.set_b(SIST0, self.regs.b(SIST0) | self.sist0_stack);
            self.regs.set_b(SIST1, self.regs.b(SIST1) | self.sist1_stack);
            self.dstat_stack = 0;
            self.sist0_stack = 0;
            self.sist1_stack = 0;
            self.eval_interrupts();
        }
        val
    }
}

pub struct Sym53C810 {
    inner: Mutex<Inner>,
    pic: Arc<Mutex<PicPair>>,
    irq: u8,
    /// Binary semaphore the SCRIPTS worker blocks on between instructions
    /// (spec.md §4.4/§5); `set()` on a `DSP` write wakes it rather than
    /// leaving it to busy-poll.
    semaphore: Semaphore,
}

impl Sym53C810 {
    pub fn new(pic: Arc<Mutex<PicPair>>, irq: u8) -> Self {
        Sym53C810 {
            inner: Mutex::new(Inner {
                regs: Regs::default(),
                target: None,
                target_id: 0,
                phase: Phase::Command,
                cdb: Vec::new(),
                executing: false,
                wait_reselect: false,
                select_timeout_counter: 0,
                dstat_stack: 0,
                sist0_stack: 0,
                sist1_stack: 0,
            }),
            pic,
            irq,
            semaphore: Semaphore::binary(),
        }
    }

    /// The semaphore a [`crate`]-external worker loop should block on
    /// between SCRIPTS steps (spec.md §5's "semaphore-driven" engine).
    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    pub fn register_disk(&self, target_id: u8, target: ScsiTarget) {
        let mut inner = self.inner.lock().unwrap();
        inner.target_id = target_id;
        inner.target = Some(target);
    }

    /// One SCRIPTS step, called by the device worker (spec.md §5). Runs
    /// with the device mutex held for the duration of a single
    /// instruction, released between instructions so CPU-side register
    /// reads are never starved for long.
    pub fn step(&self, bus: &Bus) -> Outcome {
        let mut inner = self.inner.lock().unwrap();
        let outcome = scripts::step(&mut inner, bus);
        drop(inner);
        self.raise_line_if_needed();
        outcome
    }

    fn raise_line_if_needed(&self) {
        let blocked = {
            let inner = self.inner.lock().unwrap();
            inner.blocked()
        };
        if blocked {
            self.pic.lock().unwrap().interrupt(0, self.irq);
        }
    }

    fn write_reg(&self, offset: usize, value: u8) {
        let mut inner = self.inner.lock().unwrap();
        match offset {
            ISTAT => {
                let had_srst = value & ISTAT_SRST != 0;
                inner.regs.set_b(ISTAT, value & !(ISTAT_DIP | ISTAT_SIP));
                if had_srst {
                    let target = inner.target.take();
                    let target_id = inner.target_id;
                    *inner = Inner {
                        regs: Regs::default(),
                        target,
                        target_id,
                        phase: Phase::Command,
                        cdb: Vec::new(),
                        executing: false,
                        wait_reselect: false,
                        select_timeout_counter: 0,
                        dstat_stack: 0,
                        sist0_stack: 0,
                        sist1_stack: 0,
                    };
                }
            }
            DSP => {
                // DSP is 4 bytes; callers always write it a byte at a time
                // through the bus dispatch, so the low byte write is what
                // starts execution (matching the source's `post_dsp_write`
                // hook, collapsed to "any DSP write while not single
                // stepping starts the engine").
                inner.regs.set_b(DSP, value);
                if !(inner.regs.b(DCNTL) & 0x10 != 0) {
                    inner.executing = true;
                    inner.wait_reselect = false;
                    let _ = self.semaphore.set();
                }
            }
            DSTAT | SIST0 | SIST1 => {
                // Read-only status registers; writes are ignored, matching
                // real hardware.
            }
            _ => inner.regs.set_b(offset, value),
        }
    }

    fn read_reg(&self, offset: usize) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        match offset {
            DSTAT | SIST0 | SIST1 => inner.read_and_clear(offset),
            _ => inner.regs.b(offset),
        }
    }
}

impl Savable for Sym53C810 {
    fn magic1(&self) -> [u8; 4] {
        *b"SYM0"
    }
    fn magic2(&self) -> [u8; 4] {
        *b"0MYS"
    }
    /// Covers the register file and SCRIPTS engine state; the attached
    /// `ScsiTarget`'s disk backend is restored separately by the system
    /// orchestrator from configuration, not as part of this section.
    fn save_state(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut buf = Vec::with_capacity(128 + 16);
        buf.extend_from_slice(&inner.regs.bytes);
        buf.push(inner.regs.carry as u8);
        buf.push(inner.phase.code());
        buf.push(inner.executing as u8);
        buf.push(inner.wait_reselect as u8);
        buf.extend_from_slice(&inner.select_timeout_counter.to_le_bytes());
        buf.push(inner.dstat_stack);
        buf.push(inner.sist0_stack);
        buf.push(inner.sist1_stack);
        buf.push(inner.target_id);
        buf
    }
    fn load_state(&self, blob: &[u8]) -> es40_error::Result<()> {
        if blob.len() != 128 + 12 {
            return Err(es40_error::Error::illegal_state("scsi", "bad snapshot length"));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.regs.bytes.copy_from_slice(&blob[0..128]);
        inner.regs.carry = blob[128] != 0;
        inner.phase = match blob[129] {
            0 => Phase::DataOut,
            1 => Phase::DataIn,
            2 => Phase::Command,
            3 => Phase::Status,
            6 => Phase::MessageOut,
            _ => Phase::MessageIn,
        };
        inner.executing = blob[130] != 0;
        inner.wait_reselect = blob[131] != 0;
        inner.select_timeout_counter = u32::from_le_bytes(blob[132..136].try_into().unwrap());
        inner.dstat_stack = blob[136];
        inner.sist0_stack = blob[137];
        inner.sist1_stack = blob[138];
        inner.target_id = blob[139];
        Ok(())
    }
}

impl BusEndpoint for Sym53C810 {
    fn read(&self, _range_id: u32, offset: u64, size: u8) -> u64 {
        let mut value: u64 = 0;
        for i in 0..size {
            value |= (self.read_reg(offset as usize + i as usize) as u64) << (8 * i);
        }
        value
    }

    fn write(&self, _range_id: u32, offset: u64, size: u8, value: u64) {
        for i in 0..size {
            self.write_reg(offset as usize + i as usize, ((value >> (8 * i)) & 0xff) as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs;
    use es40_bus::{memory::PhysicalMemory, Origin, Space};
    use es40_interrupts::InterruptLine;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestLine(Arc<AtomicBool>);
    impl InterruptLine for TestLine {
        fn set_line(&self, asserted: bool) {
            self.0.store(asserted, Ordering::SeqCst);
        }
    }

    fn setup() -> (Sym53C810, Bus, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut pair = PicPair::new(Box::new(TestLine(flag.clone())));
        pair.write_cmd(0, 0x11).unwrap();
        pair.write_data(0, 0x20).unwrap();
        pair.write_data(0, 0x04).unwrap();
        pair.write_data(0, 0x01).unwrap();
        let pic = Arc::new(Mutex::new(pair));
        let sym = Sym53C810::new(pic, 10);

        let mut bus = Bus::new();
        let ram = Arc::new(PhysicalMemory::new(0x1_0000_0000));
        bus.register_memory(ram, 1, 0, Space::Memory, Origin::Legacy, 0, 0x1_0000_0000)
            .unwrap();
        (sym, bus, flag)
    }

    fn write_instruction(bus: &Bus, addr: u64, word0: u32, word1: u32) {
        bus.write_mem(Space::Memory, addr, 4, word0 as u64);
        bus.write_mem(Space::Memory, addr + 4, 4, word1 as u64);
    }

    #[test]
    fn block_move_data_in_transfers_and_sets_sfbr() {
        let (sym, bus, _flag) = setup();
        let mut target = ScsiTarget::new(DiskBackend::memory(64), false, false);
        target.data_in = (0..16u8).collect();
        sym.register_disk(0, target);

        {
            let mut inner = sym.inner.lock().unwrap();
            inner.phase = Phase::DataIn;
            inner.executing = true;
        }

        // DCMD=0x01 (family 00, phase field = data-in = 1), DBC=0x000010.
        write_instruction(&bus, 0x1000, 0x0100_0010, 0x8000_0000);
        sym.inner.lock().unwrap().regs.set_dw(regs::DSP, 0x1000);

        let outcome = sym.step(&bus);
        assert_eq!(outcome, Outcome::Continue);
        for i in 0..16u64 {
            assert_eq!(bus.read_mem(Space::Memory, 0x8000_0000 + i, 1), i);
        }
        assert_eq!(sym.inner.lock().unwrap().regs.b(regs::SFBR), 0);
    }

    #[test]
    fn memory_move_copies_and_advances_dsp_by_12() {
        let (sym, bus, _flag) = setup();
        for i in 0..256u64 {
            bus.write_mem(Space::Memory, 0x0100_0000 + i, 1, (i % 256) as u64);
        }
        {
            let mut inner = sym.inner.lock().unwrap();
            inner.executing = true;
        }
        // DCMD=0xC0 (family 11, bit5 set => memory move), DBC=0x000100.
        bus.write_mem(Space::Memory, 0x2000, 4, 0xC000_0100u64);
        bus.write_mem(Space::Memory, 0x2004, 4, 0x0100_0000u64);
        bus.write_mem(Space::Memory, 0x2008, 4, 0x0200_0000u64);
        sym.inner.lock().unwrap().regs.set_dw(regs::DSP, 0x2000);

        sym.step(&bus);
        for i in 0..256u64 {
            assert_eq!(
                bus.read_mem(Space::Memory, 0x0200_0000 + i, 1),
                bus.read_mem(Space::Memory, 0x0100_0000 + i, 1)
            );
        }
        assert_eq!(sym.inner.lock().unwrap().regs.dw(regs::DSP), 0x2008 + 4);
    }

    #[test]
    fn interrupt_stacking_promotes_after_dstat_read_clear() {
        let (sym, _bus, flag) = setup();
        {
            let mut inner = sym.inner.lock().unwrap();
            inner.regs.set_b(regs::DIEN, 0x04);
            inner.set_interrupt_dstat(0x04); // DSTAT.SIR, unblocked -> live
            assert!(inner.blocked());
        }
        assert!(flag.load(Ordering::SeqCst));

        {
            let mut inner = sym.inner.lock().unwrap();
            inner.set_interrupt_sist0(regs::SIST0_MA); // DIP already set -> shadowed
            assert_eq!(inner.regs.b(regs::SIST0), 0);
        }

        let dstat = sym.read_reg(regs::DSTAT);
        assert_eq!(dstat & 0x04, 0x04);

        let inner = sym.inner.lock().unwrap();
        assert_eq!(inner.regs.b(regs::SIST0), regs::SIST0_MA);
        assert_ne!(inner.regs.b(regs::ISTAT) & regs::ISTAT_SIP, 0);
    }

    #[test]
    fn register_arithmetic_sets_carry_and_transfer_control_tests_it() {
        let (sym, bus, _flag) = setup();
        {
            let mut inner = sym.inner.lock().unwrap();
            inner.executing = true;
            inner.regs.bytes[0x20] = 0xff;
        }

        // I/O family (01), subtype 7 (regA = op(regA, data8)), operator 6
        // (add with carry out). DBC: reg_address=0x20, use_sfbr=0, data8=1.
        // 0xff + 1 overflows a u8, so this must set the carry flag.
        write_instruction(&bus, 0x4000, 0x7e20_0100, 0x0000_0000);
        sym.inner.lock().unwrap().regs.set_dw(regs::DSP, 0x4000);
        let outcome = sym.step(&bus);
        assert_eq!(outcome, Outcome::Continue);
        {
            let inner = sym.inner.lock().unwrap();
            assert_eq!(inner.regs.bytes[0x20], 0x00);
            assert!(inner.regs.carry);
        }

        // Transfer Control / Jump, carry_test set, jump_if set: should jump
        // because the carry flag left over from the previous instruction is
        // true.
        write_instruction(&bus, 0x4008, 0xa400_0000, 0x0000_9000);
        sym.inner.lock().unwrap().regs.set_dw(regs::DSP, 0x4008);
        let outcome = sym.step(&bus);
        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(sym.inner.lock().unwrap().regs.dw(regs::DSP), 0x0000_9000);
    }

    #[test]
    fn block_move_with_zero_count_raises_iid() {
        let (sym, bus, _flag) = setup();
        {
            let mut inner = sym.inner.lock().unwrap();
            inner.executing = true;
            inner.phase = Phase::DataIn;
        }
        write_instruction(&bus, 0x3000, 0x0100_0000, 0x8000_0000);
        sym.inner.lock().unwrap().regs.set_dw(regs::DSP, 0x3000);
        let outcome = sym.step(&bus);
        assert_eq!(outcome, Outcome::Halted);
        assert_eq!(sym.read_reg(regs::DSTAT) & regs::DSTAT_IID, regs::DSTAT_IID);
    }
}
