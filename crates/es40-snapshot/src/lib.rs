//! Save/Restore: a per-component state blob with magic-delimited sections
//! (spec.md §3 "Lifecycles", §6 "Save-state file layout").
//!
//! Format, little-endian, streamed, for each registered component in
//! registration order: 4-byte `magic1`, 8-byte blob size, blob bytes,
//! 4-byte `magic2`. Grounded on the teacher's `aero_snapshot::SectionId`
//! convention of small stable identifiers with a human-readable name,
//! generalized here to a per-component four-byte magic pair instead of a
//! single numeric section id, since the source distinguishes sections by a
//! magic *pair* bracketing the blob rather than a leading id.

use es40_error::{Error, Result};
use std::io::{Read, Write};

/// A component that can serialize and restore its own state.
pub trait Savable {
    /// Four-byte magic written immediately before this component's blob.
    fn magic1(&self) -> [u8; 4];
    /// Four-byte magic written immediately after this component's blob.
    fn magic2(&self) -> [u8; 4];
    fn save_state(&self) -> Vec<u8>;
    /// Takes `&self`, not `&mut self`: every implementor keeps its mutable
    /// state behind an internal `Mutex` so it can be restored through the
    /// same shared reference other components hold for bus/worker wiring.
    fn load_state(&self, blob: &[u8]) -> Result<()>;
}

/// Write every component's section to `out`, in the order they appear in
/// `components`.
pub fn save_all(components: &[&dyn Savable], out: &mut impl Write) -> Result<()> {
    for c in components {
        let blob = c.save_state();
        out.write_all(&c.magic1())
            .and_then(|_| out.write_all(&(blob.len() as u64).to_le_bytes()))
            .and_then(|_| out.write_all(&blob))
            .and_then(|_| out.write_all(&c.magic2()))
            .map_err(|e| Error::runtime("snapshot", format!("write failed: {e}")))?;
    }
    Ok(())
}

/// Restore every component's section from `input`, in the same order they
/// were saved. Each component's `magic1`/`magic2` are validated against
/// what is actually read back.
pub fn restore_all(components: &[&dyn Savable], input: &mut impl Read) -> Result<()> {
    for c in components {
        let mut magic1 = [0u8; 4];
        input
            .read_exact(&mut magic1)
            .map_err(|e| Error::runtime("snapshot", format!("read failed: {e}")))?;
        if magic1 != c.magic1() {
            return Err(Error::illegal_state(
                "snapshot",
                "magic1 mismatch: save file is corrupt or from a different build",
            ));
        }
        let mut len_bytes = [0u8; 8];
        input
            .read_exact(&mut len_bytes)
            .map_err(|e| Error::runtime("snapshot", format!("read failed: {e}")))?;
        let len = u64::from_le_bytes(len_bytes) as usize;
        let mut blob = vec![0u8; len];
        input
            .read_exact(&mut blob)
            .map_err(|e| Error::runtime("snapshot", format!("read failed: {e}")))?;
        let mut magic2 = [0u8; 4];
        input
            .read_exact(&mut magic2)
            .map_err(|e| Error::runtime("snapshot", format!("read failed: {e}")))?;
        if magic2 != c.magic2() {
            return Err(Error::illegal_state(
                "snapshot",
                "magic2 mismatch: save file is corrupt or truncated",
            ));
        }
        c.load_state(&blob)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(std::sync::Mutex<u64>, [u8; 4], [u8; 4]);
    impl Savable for Counter {
        fn magic1(&self) -> [u8; 4] {
            self.1
        }
        fn magic2(&self) -> [u8; 4] {
            self.2
        }
        fn save_state(&self) -> Vec<u8> {
            self.0.lock().unwrap().to_le_bytes().to_vec()
        }
        fn load_state(&self, blob: &[u8]) -> Result<()> {
            *self.0.lock().unwrap() = u64::from_le_bytes(blob.try_into().unwrap());
            Ok(())
        }
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let a = Counter(42.into(), *b"CNT0", *b"0TNC");
        let b = Counter(7.into(), *b"CNT1", *b"1TNC");
        let mut buf1 = Vec::new();
        save_all(&[&a, &b], &mut buf1).unwrap();

        let a2 = Counter(0.into(), *b"CNT0", *b"0TNC");
        let b2 = Counter(0.into(), *b"CNT1", *b"1TNC");
        let mut cursor = std::io::Cursor::new(&buf1);
        restore_all(&[&a2, &b2], &mut cursor).unwrap();
        assert_eq!(*a2.0.lock().unwrap(), 42);
        assert_eq!(*b2.0.lock().unwrap(), 7);

        let mut buf2 = Vec::new();
        save_all(&[&a2, &b2], &mut buf2).unwrap();
        assert_eq!(buf1, buf2, "save -> restore -> save must be byte-identical");
    }

    #[test]
    fn magic_mismatch_is_detected() {
        let a = Counter(1.into(), *b"AAAA", *b"BBBB");
        let mut buf = Vec::new();
        save_all(&[&a], &mut buf).unwrap();

        let wrong = Counter(0.into(), *b"ZZZZ", *b"BBBB");
        let mut cursor = std::io::Cursor::new(&buf);
        let err = restore_all(&[&wrong], &mut cursor).unwrap_err();
        assert_eq!(err.kind, es40_error::Kind::IllegalState);
    }
}
