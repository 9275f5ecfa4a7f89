//! Little-endian byte-slice helpers.
//!
//! The guest (Alpha) is little-endian; the host may be either. Every
//! multi-byte bulk transfer goes through these helpers instead of a
//! per-call macro (spec.md §9 "Endianness").

pub fn le_read_u16(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

pub fn le_read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

pub fn le_read_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

pub fn le_write_u16(buf: &mut [u8], v: u16) {
    buf[..2].copy_from_slice(&v.to_le_bytes());
}

pub fn le_write_u32(buf: &mut [u8], v: u32) {
    buf[..4].copy_from_slice(&v.to_le_bytes());
}

pub fn le_write_u64(buf: &mut [u8], v: u64) {
    buf[..8].copy_from_slice(&v.to_le_bytes());
}

/// Read `size` bytes (1/2/4/8) from `buf` at offset 0, guest-endian (LE),
/// widened into a `u64`.
pub fn le_read_sized(buf: &[u8], size: u8) -> u64 {
    match size {
        1 => buf[0] as u64,
        2 => le_read_u16(buf) as u64,
        4 => le_read_u32(buf) as u64,
        8 => le_read_u64(buf),
        _ => panic!("unsupported access size {size}"),
    }
}

/// Write the low `size` bytes (1/2/4/8) of `value` into `buf`, guest-endian.
pub fn le_write_sized(buf: &mut [u8], size: u8, value: u64) {
    match size {
        1 => buf[0] = value as u8,
        2 => le_write_u16(buf, value as u16),
        4 => le_write_u32(buf, value as u32),
        8 => le_write_u64(buf, value),
        _ => panic!("unsupported access size {size}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut buf = [0u8; 8];
        le_write_sized(&mut buf, 8, 0x0102_0304_0506_0708);
        assert_eq!(buf, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(le_read_sized(&buf, 8), 0x0102_0304_0506_0708);

        le_write_sized(&mut buf, 4, 0xDEAD_BEEF);
        assert_eq!(le_read_sized(&buf, 4), 0xDEAD_BEEF);

        le_write_sized(&mut buf, 2, 0xBEEF);
        assert_eq!(le_read_sized(&buf, 2), 0xBEEF);

        le_write_sized(&mut buf, 1, 0xAB);
        assert_eq!(le_read_sized(&buf, 1), 0xAB);
    }
}
