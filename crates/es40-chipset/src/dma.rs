//! 8237 DMA controller pair, grounded on `original_source/src/DMA.cpp`.
//! Two cascaded controllers (0 and 1), four channels each, page registers,
//! and a `send_data` entry point devices use to push a completed transfer
//! into guest memory in one shot rather than modeling cycle-by-cycle DMA
//! (the source does the same: `do_dma` is a placeholder and real transfers
//! go through `send_data`).

use std::sync::Mutex;

use es40_bus::{Bus, BusEndpoint, Space};
use es40_snapshot::Savable;

#[derive(Debug, Clone, Copy, Default)]
struct DmaChannel {
    base: u16,
    current: u16,
    count: u16,
    pagebase: u16,
    mode: u8,
    a_lobyte: bool,
    c_lobyte: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Controller {
    command: u8,
    request: u8,
    mask: u8,
    status: u8,
}

struct Inner {
    channel: [DmaChannel; 8],
    controller: [Controller; 2],
}

/// Maps a DMA page-register offset to the channel it addresses (the
/// source's `channelmap`, `0xff` entries are unused/reserved offsets).
const CHANNEL_MAP: [Option<u8>; 15] = [
    Some(2),
    Some(3),
    Some(1),
    None,
    None,
    None,
    Some(0),
    None,
    Some(6),
    Some(7),
    Some(5),
    None,
    None,
    None,
    Some(4),
];

pub struct Dma {
    inner: Mutex<Inner>,
}

impl Default for Dma {
    fn default() -> Self {
        Self::new()
    }
}

impl Dma {
    pub fn new() -> Self {
        let mut channel = [DmaChannel::default(); 8];
        for ch in &mut channel {
            ch.a_lobyte = true;
            ch.c_lobyte = true;
        }
        Dma {
            inner: Mutex::new(Inner {
                channel,
                controller: [Controller { mask: 0xff, ..Default::default() }; 2],
            }),
        }
    }

    /// Read a channel/main register, `ctrl` selects controller 0 or 1.
    pub fn read_channel(&self, ctrl: usize, address: u64) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        let num = ((address as usize & 0x0e) >> 1) + ctrl * 4;
        if address & 1 != 0 {
            let lo = inner.channel[num].c_lobyte;
            let data = (inner.channel[num].count >> if lo { 8 } else { 0 }) as u8;
            inner.channel[num].c_lobyte = !lo;
            data
        } else {
            let lo = inner.channel[num].a_lobyte;
            let data = (inner.channel[num].current >> if lo { 8 } else { 0 }) as u8;
            inner.channel[num].a_lobyte = !lo;
            data
        }
    }

    pub fn write_channel(&self, ctrl: usize, address: u64, data: u8) {
        let mut inner = self.inner.lock().unwrap();
        let num = ((address as usize & 0x0e) >> 1) + ctrl * 4;
        if address & 1 != 0 {
            let ch = &mut inner.channel[num];
            ch.count = if ch.c_lobyte {
                (ch.count & 0xff00) | data as u16
            } else {
                (ch.count & 0xff) | ((data as u16) << 8)
            };
            ch.c_lobyte = !ch.c_lobyte;
        } else {
            let ch = &mut inner.channel[num];
            ch.base = if ch.a_lobyte {
                (ch.base & 0xff00) | data as u16
            } else {
                (ch.base & 0xff) | ((data as u16) << 8)
            };
            ch.a_lobyte = !ch.a_lobyte;
        }
    }

    pub fn write_main(&self, ctrl: usize, address: u64, data: u8) {
        let mut inner = self.inner.lock().unwrap();
        match address {
            0 => inner.controller[ctrl].command = data,
            1 => {
                let channel = (data & 0x03) as usize;
                let set = (data & 0x04) >> 2;
                inner.controller[ctrl].request =
                    (inner.controller[ctrl].request & !(1 << channel)) | set;
                inner.channel[ctrl * 4 + channel].current = 0;
            }
            2 => {
                let bit = data & 0x03;
                inner.controller[ctrl].mask =
                    (inner.controller[ctrl].mask & !(1 << bit)) | ((data & 0x04) >> 2);
            }
            3 => {
                let channel = (data & 0x03) as usize;
                inner.channel[ctrl * 4 + channel].mode = data;
            }
            4 => {
                for i in ctrl * 4..(ctrl + 1) * 4 {
                    inner.channel[i].a_lobyte = true;
                    inner.channel[i].c_lobyte = true;
                }
            }
            5 => {
                for i in ctrl * 4..(ctrl + 1) * 4 {
                    inner.channel[i].a_lobyte = true;
                    inner.channel[i].c_lobyte = true;
                }
                inner.controller[ctrl].mask = 0xff;
            }
            6 => inner.controller[ctrl].mask = 0x00,
            7 => inner.controller[ctrl].mask = data,
            _ => {}
        }
    }

    pub fn write_page_register(&self, high: bool, address: usize, data: u8) {
        let Some(channel) = CHANNEL_MAP.get(address).copied().flatten() else {
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        let ch = &mut inner.channel[channel as usize];
        ch.pagebase = if !high {
            (ch.pagebase & 0xff00) | data as u16
        } else {
            (ch.pagebase & 0xff) | ((data as u16) << 8)
        };
    }

    /// Push a completed transfer into guest memory, honoring the
    /// controller-disabled and channel-masked gates (`CDMA::send_data`).
    pub fn send_data(&self, bus: &Bus, channel: usize, data: &[u8]) {
        let ctrl = if channel < 4 { 0 } else { 1 };
        let mut inner = self.inner.lock().unwrap();
        if inner.controller[ctrl].command & 0x04 != 0 {
            return;
        }
        if inner.controller[ctrl].mask & (1 << (channel % 4)) != 0 {
            return;
        }
        let addr = ((inner.channel[channel].pagebase as u64) << 16)
            + inner.channel[channel].base as u64;
        for (i, byte) in data.iter().enumerate() {
            bus.write_mem(Space::Memory, addr + i as u64, 1, *byte as u64);
        }
        inner.controller[ctrl].status |= 1 << (channel % 4);
    }
}

impl Savable for Dma {
    fn magic1(&self) -> [u8; 4] {
        *b"DMA0"
    }
    fn magic2(&self) -> [u8; 4] {
        *b"0AMD"
    }
    fn save_state(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut buf = Vec::with_capacity(8 * 11 + 2 * 4);
        for ch in &inner.channel {
            buf.extend_from_slice(&ch.base.to_le_bytes());
            buf.extend_from_slice(&ch.current.to_le_bytes());
            buf.extend_from_slice(&ch.count.to_le_bytes());
            buf.extend_from_slice(&ch.pagebase.to_le_bytes());
            buf.push(ch.mode);
            buf.push(ch.a_lobyte as u8);
            buf.push(ch.c_lobyte as u8);
        }
        for c in &inner.controller {
            buf.push(c.command);
            buf.push(c.request);
            buf.push(c.mask);
            buf.push(c.status);
        }
        buf
    }
    fn load_state(&self, blob: &[u8]) -> es40_error::Result<()> {
        const CHANNEL_LEN: usize = 11;
        if blob.len() != 8 * CHANNEL_LEN + 2 * 4 {
            return Err(es40_error::Error::illegal_state("dma", "bad snapshot length"));
        }
        let mut inner = self.inner.lock().unwrap();
        for (i, ch) in inner.channel.iter_mut().enumerate() {
            let base = i * CHANNEL_LEN;
            ch.base = u16::from_le_bytes(blob[base..base + 2].try_into().unwrap());
            ch.current = u16::from_le_bytes(blob[base + 2..base + 4].try_into().unwrap());
            ch.count = u16::from_le_bytes(blob[base + 4..base + 6].try_into().unwrap());
            ch.pagebase = u16::from_le_bytes(blob[base + 6..base + 8].try_into().unwrap());
            ch.mode = blob[base + 8];
            ch.a_lobyte = blob[base + 9] != 0;
            ch.c_lobyte = blob[base + 10] != 0;
        }
        let controllers_base = 8 * CHANNEL_LEN;
        for (i, c) in inner.controller.iter_mut().enumerate() {
            let base = controllers_base + i * 4;
            c.command = blob[base];
            c.request = blob[base + 1];
            c.mask = blob[base + 2];
            c.status = blob[base + 3];
        }
        Ok(())
    }
}

/// Bus-facing view over one of the eight legacy DMA port windows (the
/// source's `LEGACY_IO` table); `range_id` distinguishes which window a
/// given registration covers.
pub struct DmaPort {
    dma: std::sync::Arc<Dma>,
    kind: DmaPortKind,
}

#[derive(Clone, Copy)]
pub enum DmaPortKind {
    Channel0,
    Channel1,
    Main0,
    Main1,
    PageLow,
    PageHigh,
}

impl DmaPort {
    pub fn new(dma: std::sync::Arc<Dma>, kind: DmaPortKind) -> Self {
        DmaPort { dma, kind }
    }
}

impl BusEndpoint for DmaPort {
    fn read(&self, _range_id: u32, offset: u64, _size: u8) -> u64 {
        match self.kind {
            DmaPortKind::Channel0 => self.dma.read_channel(0, offset) as u64,
            DmaPortKind::Channel1 => self.dma.read_channel(1, offset >> 1) as u64,
            DmaPortKind::Main0 | DmaPortKind::Main1 | DmaPortKind::PageLow | DmaPortKind::PageHigh => 0,
        }
    }

    fn write(&self, _range_id: u32, offset: u64, _size: u8, value: u64) {
        let data = value as u8;
        match self.kind {
            DmaPortKind::Channel0 => self.dma.write_channel(0, offset, data),
            DmaPortKind::Channel1 => self.dma.write_channel(1, offset >> 1, data),
            DmaPortKind::Main0 => self.dma.write_main(0, offset, data),
            DmaPortKind::Main1 => self.dma.write_main(1, offset, data),
            DmaPortKind::PageLow => self.dma.write_page_register(false, offset as usize, data),
            DmaPortKind::PageHigh => self.dma.write_page_register(true, offset as usize, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use es40_bus::Origin;
    use std::sync::Arc;

    #[test]
    fn channel_base_and_count_roundtrip() {
        let dma = Dma::new();
        dma.write_channel(0, 0, 0x34);
        dma.write_channel(0, 0, 0x12);
        assert_eq!(dma.inner.lock().unwrap().channel[0].base, 0x1234);
        dma.write_channel(0, 1, 0x78);
        dma.write_channel(0, 1, 0x56);
        assert_eq!(dma.inner.lock().unwrap().channel[0].count, 0x5678);
    }

    #[test]
    fn send_data_respects_mask() {
        let mut bus = Bus::new();
        let dma = Arc::new(Dma::new());
        let ram = Arc::new(es40_bus::memory::PhysicalMemory::new(0x10000));
        bus.register_memory(ram, 1, 0, Space::Memory, Origin::Legacy, 0, 0x10000)
            .unwrap();
        dma.write_main(0, 7, 0xfe); // unmask channel 0
        dma.write_channel(0, 0, 0x00);
        dma.write_channel(0, 0, 0x10); // base = 0x1000
        dma.send_data(&bus, 0, &[0xaa, 0xbb]);
        assert_eq!(bus.read_mem(Space::Memory, 0x1000, 1), 0xaa);
        assert_eq!(bus.read_mem(Space::Memory, 0x1001, 1), 0xbb);
    }
}
