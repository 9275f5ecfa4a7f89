//! The Sym53C810 128-byte register file, grounded on the `R_*` offset table
//! in `original_source/src/Sym53C810.cpp`. Registers are addressed
//! byte-wise by SCRIPTS Load/Store and by the PCI BAR the chip exposes
//! them through; a handful have multi-byte views (`DSP`, `DBC`/`DCMD`,
//! `DSPS`, `TEMP`, `DSA`, `SCRATCHA`/`B`) used by the interpreter.

pub const SCNTL0: usize = 0x00;
pub const SCNTL1: usize = 0x01;
pub const SCNTL2: usize = 0x02;
pub const SCNTL3: usize = 0x03;
pub const SCID: usize = 0x04;
pub const SXFER: usize = 0x05;
pub const SDID: usize = 0x06;
pub const GPREG: usize = 0x07;
pub const SFBR: usize = 0x08;
pub const SOCL: usize = 0x09;
pub const SSID: usize = 0x0a;
pub const SBCL: usize = 0x0b;
pub const DSTAT: usize = 0x0c;
pub const SSTAT0: usize = 0x0d;
pub const SSTAT1: usize = 0x0e;
pub const SSTAT2: usize = 0x0f;
pub const DSA: usize = 0x10;
pub const ISTAT: usize = 0x14;
pub const CTEST0: usize = 0x18;
pub const CTEST1: usize = 0x19;
pub const CTEST2: usize = 0x1a;
pub const CTEST3: usize = 0x1b;
pub const TEMP: usize = 0x1c;
pub const DFIFO: usize = 0x20;
pub const CTEST4: usize = 0x21;
pub const CTEST5: usize = 0x22;
pub const DBC: usize = 0x24;
pub const DCMD: usize = 0x27;
pub const DNAD: usize = 0x28;
pub const DSP: usize = 0x2c;
pub const DSPS: usize = 0x30;
pub const SCRATCHA: usize = 0x34;
pub const DMODE: usize = 0x38;
pub const DIEN: usize = 0x39;
pub const SBR: usize = 0x3a;
pub const DCNTL: usize = 0x3b;
pub const ADDER: usize = 0x3c;
pub const SIEN0: usize = 0x40;
pub const SIEN1: usize = 0x41;
pub const SIST0: usize = 0x42;
pub const SIST1: usize = 0x43;
pub const MACNTL: usize = 0x46;
pub const GPCNTL: usize = 0x47;
pub const STIME0: usize = 0x48;
pub const STIME1: usize = 0x49;
pub const RESPID: usize = 0x4a;
pub const STEST0: usize = 0x4c;
pub const STEST1: usize = 0x4d;
pub const STEST2: usize = 0x4e;
pub const STEST3: usize = 0x4f;
pub const SBDL: usize = 0x58;
pub const SCRATCHB: usize = 0x5c;

pub const R_SBCL_PHASE: u8 = 0x07;

pub const ISTAT_ABRT: u8 = 0x80;
pub const ISTAT_SRST: u8 = 0x40;
pub const ISTAT_SIGP: u8 = 0x20;
pub const ISTAT_SEM: u8 = 0x10;
pub const ISTAT_CON: u8 = 0x08;
pub const ISTAT_INTF: u8 = 0x04;
pub const ISTAT_SIP: u8 = 0x02;
pub const ISTAT_DIP: u8 = 0x01;

pub const DSTAT_DFE: u8 = 0x80;
pub const DSTAT_ABRT: u8 = 0x10;
pub const DSTAT_SSI: u8 = 0x08;
pub const DSTAT_SIR: u8 = 0x04;
pub const DSTAT_IID: u8 = 0x01;
/// Bits that clear on read, per the source's `DSTAT_RC`.
pub const DSTAT_RC: u8 = 0x7d;

pub const SIST1_STO: u8 = 0x04;
pub const SIST0_MA: u8 = 0x80;

/// 128 raw register bytes plus the flat arithmetic carry flag the SCRIPTS
/// ALU exposes to Transfer Control predicates.
pub struct Regs {
    pub bytes: [u8; 128],
    pub carry: bool,
}

impl Default for Regs {
    fn default() -> Self {
        Regs { bytes: [0u8; 128], carry: false }
    }
}

impl Regs {
    pub fn b(&self, off: usize) -> u8 {
        self.bytes[off]
    }

    pub fn set_b(&mut self, off: usize, v: u8) {
        self.bytes[off] = v;
    }

    /// Guest-endian (little-endian) 32-bit view, so that `DCMD` (the
    /// high-addressed byte in the `DBC`/`DCMD` group) lands in bits
    /// `[31:24]` of the combined instruction word, matching spec.md's
    /// `DCMD[7:6]` family selector.
    pub fn dw(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap())
    }

    pub fn set_dw(&mut self, off: usize, v: u32) {
        self.bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
}
