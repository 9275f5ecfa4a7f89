//! CSR register file offsets and bit constants, grounded on
//! `original_source/src/DEC21143_tulipreg.hpp`'s `TULIP_CSR*` table.

pub const CSR0: u64 = 0x00;
pub const CSR1: u64 = 0x08;
pub const CSR2: u64 = 0x10;
pub const CSR3: u64 = 0x18;
pub const CSR4: u64 = 0x20;
pub const CSR5: u64 = 0x28;
pub const CSR6: u64 = 0x30;
pub const CSR7: u64 = 0x38;
pub const CSR8: u64 = 0x40;
pub const CSR9: u64 = 0x48;
pub const CSR10: u64 = 0x50;
pub const CSR11: u64 = 0x58;
pub const CSR12: u64 = 0x60;
pub const CSR13: u64 = 0x68;
pub const CSR14: u64 = 0x70;
pub const CSR15: u64 = 0x78;

/// CSR0 (bus mode).
pub const CSR0_SWR: u32 = 0x0000_0001;

/// CSR5 (status).
pub const CSR5_TI: u32 = 0x0000_0001;
pub const CSR5_RI: u32 = 0x0000_0040;
pub const CSR5_RU: u32 = 0x0000_0080;
pub const CSR5_RS: u32 = 0x0000_0100;
pub const CSR5_AIS: u32 = 0x0000_8000;
pub const CSR5_NIS: u32 = 0x0001_0000;

/// CSR6 (operating mode).
pub const CSR6_SR: u32 = 0x0000_0002; // start/stop receive
pub const CSR6_ST: u32 = 0x0000_2000; // start/stop transmit
pub const CSR6_PR: u32 = 0x0000_0040; // promiscuous
pub const CSR6_LOOPBACK_MASK: u32 = 0x0000_0c00;
pub const CSR6_LOOPBACK_SHIFT: u32 = 10;

/// CSR9 (bit-serial EEPROM/MII access).
pub const CSR9_SROM_DATA_OUT: u32 = 0x0000_0008;
pub const CSR9_SROM_DATA_IN: u32 = 0x0000_0004;
pub const CSR9_SROM_CLOCK: u32 = 0x0000_0002;
pub const CSR9_SROM_SELECT: u32 = 0x0000_0001;
pub const CSR9_MII_DATA_OUT: u32 = 0x0000_0004;
pub const CSR9_MII_DATA_IN: u32 = 0x0008_0000;
pub const CSR9_MII_CLOCK: u32 = 0x0001_0000;
pub const CSR9_MII_OE: u32 = 0x0002_0000;
