//! SCSI target model: CDB dispatch, sense data, and the disk backend the
//! command set reads and writes. Grounded on `original_source/src/Disk.cpp`
//! and `DiskDevice.cpp`'s `DoSCSIRequest` (both disk and CD-ROM targets
//! share this CDB dispatch there), condensed to the command subset
//! spec.md §4.5/§8.5 names.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use es40_error::{Error, Result};

/// Byte-addressable backing store for a SCSI disk, independent of the host
/// file/in-memory distinction (spec.md §1 "byte-addressable block
/// backend").
pub enum DiskBackend {
    File(File),
    Memory(Vec<u8>),
}

impl DiskBackend {
    pub fn open_file(path: &std::path::Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::configuration("scsi-disk", format!("opening {path:?}: {e}")))?;
        Ok(DiskBackend::File(file))
    }

    pub fn memory(size: usize) -> Self {
        DiskBackend::Memory(vec![0u8; size])
    }

    pub fn len(&self) -> Result<u64> {
        match self {
            DiskBackend::File(f) => f
                .metadata()
                .map(|m| m.len())
                .map_err(|e| Error::runtime("scsi-disk", e.to_string())),
            DiskBackend::Memory(v) => Ok(v.len() as u64),
        }
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            DiskBackend::File(f) => {
                f.seek(SeekFrom::Start(offset))
                    .map_err(|e| Error::runtime("scsi-disk", e.to_string()))?;
                f.read_exact(buf).map_err(|e| Error::runtime("scsi-disk", e.to_string()))
            }
            DiskBackend::Memory(v) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > v.len() {
                    return Err(Error::invalid_argument("scsi-disk", "read past end of image"));
                }
                buf.copy_from_slice(&v[start..end]);
                Ok(())
            }
        }
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            DiskBackend::File(f) => {
                f.seek(SeekFrom::Start(offset))
                    .map_err(|e| Error::runtime("scsi-disk", e.to_string()))?;
                f.write_all(data).map_err(|e| Error::runtime("scsi-disk", e.to_string()))
            }
            DiskBackend::Memory(v) => {
                let start = offset as usize;
                let end = start + data.len();
                if end > v.len() {
                    return Err(Error::invalid_argument("scsi-disk", "write past end of image"));
                }
                v[start..end].copy_from_slice(data);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DataOut,
    DataIn,
    Command,
    Status,
    MessageOut,
    MessageIn,
}

impl Phase {
    /// The `SBCL` phase-field encoding the source uses (spec.md §4.3 SBCL
    /// bits 2:0).
    pub fn code(self) -> u8 {
        match self {
            Phase::DataOut => 0,
            Phase::DataIn => 1,
            Phase::Command => 2,
            Phase::Status => 3,
            Phase::MessageOut => 6,
            Phase::MessageIn => 7,
        }
    }
}

/// What a target does with a completed command: the result phase to settle
/// into (status byte already buffered) plus any data the initiator should
/// pull in a data-in phase.
pub struct ScsiTarget {
    pub cdrom: bool,
    pub read_only: bool,
    pub block_size: u32,
    pub disk: DiskBackend,
    pub sense_key: u8,
    pub sense_code: u8,
    vendor: [u8; 8],
    product: [u8; 16],
    revision: [u8; 4],

    pub data_in: Vec<u8>,
    pub data_in_pos: usize,
    pub data_out_expected: usize,
    pub status: u8,
}

fn pad(s: &str, buf: &mut [u8]) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in &mut buf[n..] {
        *b = b' ';
    }
}

impl ScsiTarget {
    pub fn new(disk: DiskBackend, cdrom: bool, read_only: bool) -> Self {
        let mut vendor = [b' '; 8];
        let mut product = [b' '; 16];
        let mut revision = [b' '; 4];
        pad("ES40", &mut vendor);
        pad(if cdrom { "VIRTUAL CDROM" } else { "VIRTUAL DISK" }, &mut product);
        pad("1.0", &mut revision);
        ScsiTarget {
            cdrom,
            read_only,
            block_size: if cdrom { 2048 } else { 512 },
            disk,
            sense_key: 0,
            sense_code: 0,
            vendor,
            product,
            revision,
            data_in: Vec::new(),
            data_in_pos: 0,
            data_out_expected: 0,
            status: 0,
        }
    }

    fn block_count(&self) -> Result<u32> {
        Ok((self.disk.len()? / self.block_size as u64) as u32)
    }

    /// Dispatch one CDB, filling `data_in` with whatever bytes a following
    /// data-in phase should deliver and returning the status byte.
    pub fn execute(&mut self, cdb: &[u8]) -> Result<u8> {
        self.data_in.clear();
        self.data_in_pos = 0;
        self.data_out_expected = 0;
        match cdb[0] {
            0x00 => Ok(0x00), // TEST UNIT READY
            0x03 => {
                // REQUEST SENSE
                let mut buf = vec![0u8; 18];
                buf[0] = 0x70;
                buf[2] = self.sense_key;
                buf[12] = self.sense_code;
                self.data_in = buf;
                self.sense_key = 0;
                self.sense_code = 0;
                Ok(0x00)
            }
            0x12 => {
                // INQUIRY
                let len = cdb.get(4).copied().unwrap_or(0) as usize;
                let mut buf = vec![0u8; 0x24.max(len)];
                buf[0] = if self.cdrom { 0x05 } else { 0x00 };
                buf[1] = if self.cdrom { 0x80 } else { 0x00 };
                buf[2] = 0x02;
                buf[3] = 0x02;
                buf[4] = 0x20;
                buf[8..16].copy_from_slice(&self.vendor);
                buf[16..32].copy_from_slice(&self.product);
                buf[32..36].copy_from_slice(&self.revision);
                buf.truncate(len.max(0x24));
                self.data_in = buf;
                Ok(0x00)
            }
            0x25 => {
                // READ CAPACITY (10)
                let blocks = self.block_count()?;
                let last_lba = blocks.saturating_sub(1);
                let mut buf = vec![0u8; 8];
                buf[0..4].copy_from_slice(&last_lba.to_be_bytes());
                buf[4..8].copy_from_slice(&self.block_size.to_be_bytes());
                self.data_in = buf;
                Ok(0x00)
            }
            0x08 | 0x28 => self.do_read(cdb),
            0x0a | 0x2a => self.do_write(cdb),
            0x1a => {
                // MODE SENSE (6)
                let page = cdb[2] & 0x3f;
                self.data_in = self.mode_sense_page(page)?;
                Ok(0x00)
            }
            0x15 => {
                // MODE SELECT (6): stage the incoming parameter list; it
                // arrives through a following data-out phase and is parsed
                // by `receive_write_data`.
                self.data_out_expected = cdb.get(4).copied().unwrap_or(0) as usize;
                Ok(0x00)
            }
            0x1b => Ok(0x00), // START STOP UNIT
            _ => {
                self.sense_key = 0x05; // ILLEGAL REQUEST
                self.sense_code = 0x20; // invalid command operation code
                Ok(0x02) // CHECK CONDITION
            }
        }
    }

    fn mode_sense_page(&self, page: u8) -> Result<Vec<u8>> {
        // Header + an 8-byte block descriptor giving the current block
        // size, matching spec.md §8's "After MODE SELECT ... get_block_size"
        // invariant in reverse (report what is currently configured).
        let mut buf = vec![0u8; 4 + 8];
        buf[0] = (buf.len() - 1) as u8;
        buf[3] = 8; // block descriptor length
        let blocks = self.block_count()?;
        buf[4..8].copy_from_slice(&blocks.to_be_bytes());
        buf[9..12].copy_from_slice(&self.block_size.to_be_bytes()[1..]);
        if page != 0x3f && page != 0x00 {
            // Unsupported page: return just the header, as the source does
            // for pages it does not model.
        }
        Ok(buf)
    }

    fn lba_and_len(&self, cdb: &[u8]) -> (u64, u32) {
        if cdb[0] == 0x08 || cdb[0] == 0x0a {
            let lba = ((cdb[1] as u32 & 0x1f) << 16 | (cdb[2] as u32) << 8 | cdb[3] as u32) as u64;
            let len = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
            (lba, len)
        } else {
            let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64;
            let len = u16::from_be_bytes([cdb[7], cdb[8]]) as u32;
            (lba, len)
        }
    }

    fn do_read(&mut self, cdb: &[u8]) -> Result<u8> {
        let (lba, blocks) = self.lba_and_len(cdb);
        let mut buf = vec![0u8; blocks as usize * self.block_size as usize];
        self.disk.read_at(lba * self.block_size as u64, &mut buf)?;
        self.data_in = buf;
        Ok(0x00)
    }

    /// Stage an incoming write: the caller fills this via [`Self::receive_write_data`]
    /// once the data-out phase delivers the bytes.
    fn do_write(&mut self, cdb: &[u8]) -> Result<u8> {
        if self.read_only {
            self.sense_key = 0x07; // DATA PROTECT
            self.sense_code = 0x27; // write protected
            return Ok(0x02);
        }
        let (_lba, blocks) = self.lba_and_len(cdb);
        self.data_out_expected = blocks as usize * self.block_size as usize;
        Ok(0x00)
    }

    pub fn receive_write_data(&mut self, cdb: &[u8], data: &[u8]) -> Result<()> {
        if cdb[0] == 0x15 {
            return self.apply_mode_select(data);
        }
        let (lba, _) = self.lba_and_len(cdb);
        self.disk.write_at(lba * self.block_size as u64, data)
    }

    /// Parse a MODE SELECT (6) parameter list: a 4-byte mode parameter
    /// header followed by one 8-byte block descriptor, mirroring the
    /// layout `mode_sense_page` reports (a 24-bit block length at
    /// descriptor bytes 5..8, overall offset 9..12).
    fn apply_mode_select(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < 12 {
            return Err(Error::invalid_argument(
                "scsi-disk",
                "MODE SELECT parameter list too short",
            ));
        }
        let block_size = u32::from_be_bytes([0, data[9], data[10], data[11]]);
        if block_size > 0 {
            self.block_size = block_size;
        }
        Ok(())
    }

    /// The block length currently in effect, settable via MODE SELECT (6).
    pub fn get_block_size(&self) -> u32 {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inquiry_reports_disk_device_type() {
        let mut target = ScsiTarget::new(DiskBackend::memory(4096), false, false);
        let status = target.execute(&[0x12, 0x00, 0x00, 0x00, 0x24, 0x00]).unwrap();
        assert_eq!(status, 0x00);
        assert_eq!(target.data_in.len(), 0x24);
        assert_eq!(target.data_in[0], 0x00);
        assert_eq!(&target.data_in[8..16], b"ES40    ");
    }

    #[test]
    fn inquiry_reports_cdrom_device_type() {
        let mut target = ScsiTarget::new(DiskBackend::memory(4096), true, false);
        target.execute(&[0x12, 0x00, 0x00, 0x00, 0x24, 0x00]).unwrap();
        assert_eq!(target.data_in[0], 0x05);
    }

    #[test]
    fn read_capacity_reports_last_lba() {
        let mut target = ScsiTarget::new(DiskBackend::memory(512 * 10), false, false);
        target.execute(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let last_lba = u32::from_be_bytes(target.data_in[0..4].try_into().unwrap());
        assert_eq!(last_lba, 9);
    }

    #[test]
    fn read_returns_requested_block() {
        let mut disk = DiskBackend::memory(512 * 4);
        disk.write_at(512, &[0xaa; 512]).unwrap();
        let mut target = ScsiTarget::new(disk, false, false);
        // READ(10), LBA 1, 1 block.
        target.execute(&[0x28, 0, 0, 0, 0, 1, 0, 0, 1, 0]).unwrap();
        assert_eq!(target.data_in, vec![0xaa; 512]);
    }

    #[test]
    fn mode_select_sets_block_size() {
        let mut target = ScsiTarget::new(DiskBackend::memory(512 * 4), false, false);
        assert_eq!(target.get_block_size(), 512);

        // MODE SELECT(6), parameter list length 12.
        let status = target.execute(&[0x15, 0x00, 0x00, 0x00, 12, 0x00]).unwrap();
        assert_eq!(status, 0x00);
        assert_eq!(target.data_out_expected, 12);

        let mut param = vec![0u8; 12];
        param[9..12].copy_from_slice(&1024u32.to_be_bytes()[1..]);
        target.receive_write_data(&[0x15, 0x00, 0x00, 0x00, 12, 0x00], &param).unwrap();
        assert_eq!(target.get_block_size(), 1024);
    }

    #[test]
    fn write_protected_disk_reports_check_condition() {
        let mut target = ScsiTarget::new(DiskBackend::memory(512 * 4), false, true);
        let status = target.execute(&[0x0a, 0, 0, 0, 0, 1, 0, 0, 1, 0]).unwrap();
        assert_eq!(status, 0x02);
        assert_eq!(target.sense_key, 0x07);
    }
}
