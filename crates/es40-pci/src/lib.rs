//! PCI Framework: configuration-space emulation, BAR relocation, interrupt
//! routing (spec.md §4.2), grounded on `original_source/src/PCIDevice.h`'s
//! `CPCIDevice` (per-function `config_data[64]`/`config_mask[64]` DWORD
//! arrays, `register_bar`, `do_pci_interrupt`).

use std::sync::Arc;

use es40_bus::{Bus, BusEndpoint, ComponentId, Origin, Space};
use es40_error::{Error, Result};

pub const NUM_DWORDS: usize = 64;
pub const NUM_BARS: usize = 6;

/// Offset of the first byte of BAR `n` (0..6) in configuration space.
pub fn bar_offset(n: u8) -> u32 {
    0x10 + 4 * n as u32
}

fn bar_index_for_offset(offset: u32) -> Option<u8> {
    if (0x10..0x10 + 4 * NUM_BARS as u32).contains(&offset) {
        Some(((offset - 0x10) / 4) as u8)
    } else {
        None
    }
}

/// A decoded BAR: whether it targets I-O or memory space, its programmed
/// base, its fixed decode length, and whether it is currently enabled
/// (base nonzero is taken as "enabled" here, matching the source, which
/// has no separate enable bit on a BAR beyond a nonzero programmed base).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarDecode {
    pub is_io: bool,
    pub base: u32,
    pub length: u32,
}

impl BarDecode {
    pub fn enabled(&self) -> bool {
        self.base != 0
    }
}

/// One function's 256-byte configuration space, stored as 64 DWORDs with a
/// parallel write-mask array (spec.md §3 "PCI Function").
#[derive(Debug, Clone)]
pub struct PciConfigSpace {
    data: [u32; NUM_DWORDS],
    mask: [u32; NUM_DWORDS],
    template: [u32; NUM_DWORDS],
}

impl PciConfigSpace {
    pub fn new(data: [u32; NUM_DWORDS], mask: [u32; NUM_DWORDS]) -> Self {
        PciConfigSpace {
            data,
            mask,
            template: data,
        }
    }

    fn dword_index(offset: u32) -> usize {
        (offset / 4) as usize
    }

    pub fn read(&self, offset: u32, size: u8) -> u32 {
        let idx = Self::dword_index(offset & !0x3);
        let dword = self.data.get(idx).copied().unwrap_or(0);
        let shift = (offset & 0x3) * 8;
        let mask = match size {
            1 => 0xFFu32,
            2 => 0xFFFF,
            4 => 0xFFFF_FFFF,
            _ => return 0,
        };
        (dword >> shift) & mask
    }

    /// Apply a config-space write. Returns the BAR index if this write
    /// touched a BAR register (caller must then reprogram the bus fabric).
    pub fn write(&mut self, offset: u32, size: u8, value: u32) -> Option<u8> {
        let aligned = offset & !0x3;
        let idx = Self::dword_index(aligned);
        if idx >= NUM_DWORDS {
            return None;
        }
        let shift = (offset & 0x3) * 8;
        let byte_mask: u32 = match size {
            1 => 0xFFu32,
            2 => 0xFFFF,
            4 => 0xFFFF_FFFF,
            _ => return None,
        } << shift;

        let old = self.data[idx];
        let incoming = (value << shift) & byte_mask;
        let writable = self.mask[idx] & byte_mask;
        // new = (old & ~mask) | (data & mask), per spec.md §3.
        self.data[idx] = (old & !writable) | (incoming & writable);

        bar_index_for_offset(aligned)
    }

    pub fn reset(&mut self) {
        self.data = self.template;
    }

    pub fn bar(&self, n: u8) -> BarDecode {
        let data = self.data[Self::dword_index(bar_offset(n))];
        let mask = self.mask[Self::dword_index(bar_offset(n))];
        let is_io = data & 0x1 != 0;
        let base_mask = if is_io { !0x3u32 } else { !0xFu32 };
        let length = (!mask | 1).wrapping_add(1);
        BarDecode {
            is_io,
            base: data & base_mask,
            length,
        }
    }

    pub fn interrupt_line(&self) -> u8 {
        self.read(0x3C, 1) as u8
    }

    pub fn raw_dwords(&self) -> &[u32; NUM_DWORDS] {
        &self.data
    }
}

/// The chipset's interrupt-routing callback, invoked by `do_pci_interrupt`
/// (spec.md §4.2).
pub trait ChipsetInterrupt: Send + Sync {
    fn interrupt(&self, line: u8, asserted: bool);
}

/// Read the interrupt-line byte from `cfg` and route the asserted/deasserted
/// state to the chipset, per spec.md §4.2 `do_pci_interrupt`.
pub fn do_pci_interrupt(cfg: &PciConfigSpace, chipset: &dyn ChipsetInterrupt, asserted: bool) {
    chipset.interrupt(cfg.interrupt_line(), asserted);
}

/// Reprogram the bus fabric for BAR `n` of function `range_id_base + n`,
/// unregistering any previous range and registering the new one if the BAR
/// is enabled. `range_id` must be stable across calls for the same BAR
/// (callers typically use `function_index * NUM_BARS + bar_index`).
pub fn register_bar(
    bus: &mut Bus,
    component: ComponentId,
    range_id: u32,
    owner: Arc<dyn BusEndpoint>,
    bar: BarDecode,
) -> Result<()> {
    bus.unregister_memory(component, range_id);
    if !bar.enabled() {
        return Ok(());
    }
    let space = if bar.is_io { Space::Io } else { Space::Memory };
    bus.register_memory(
        owner,
        component,
        range_id,
        space,
        Origin::PciBar,
        bar.base as u64,
        bar.length as u64,
    )
}

/// Standard PCI device: up to eight functions, a bus/device number pair,
/// and per-function presence flags (spec.md §3 "PCI Device").
pub struct PciDevice {
    pub pci_bus: u8,
    pub pci_dev: u8,
    pub functions: Vec<Option<PciConfigSpace>>,
}

impl PciDevice {
    pub fn new(pci_bus: u8, pci_dev: u8) -> Self {
        PciDevice {
            pci_bus,
            pci_dev,
            functions: (0..8).map(|_| None).collect(),
        }
    }

    pub fn add_function(&mut self, func: usize, data: [u32; NUM_DWORDS], mask: [u32; NUM_DWORDS]) {
        self.functions[func] = Some(PciConfigSpace::new(data, mask));
    }

    pub fn function(&self, func: usize) -> Result<&PciConfigSpace> {
        self.functions
            .get(func)
            .and_then(|f| f.as_ref())
            .ok_or_else(|| Error::invalid_argument("pci", "no such function"))
    }

    pub fn function_mut(&mut self, func: usize) -> Result<&mut PciConfigSpace> {
        self.functions
            .get_mut(func)
            .and_then(|f| f.as_mut())
            .ok_or_else(|| Error::invalid_argument("pci", "no such function"))
    }

    pub fn reset(&mut self) {
        for f in self.functions.iter_mut().flatten() {
            f.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_space() -> PciConfigSpace {
        let mut data = [0u32; NUM_DWORDS];
        let mut mask = [0u32; NUM_DWORDS];
        // BAR0: I/O space, 0x100-byte decode window, base writable.
        data[bar_idx(0)] = 0x0000_0001;
        mask[bar_idx(0)] = 0xFFFF_FF01; // low bit (type) read-only, base writable
        PciConfigSpace::new(data, mask)
    }

    fn bar_idx(n: u8) -> usize {
        (bar_offset(n) / 4) as usize
    }

    #[test]
    fn bar_write_then_readback_matches_mask_formula() {
        let mut cfg = make_space();
        let bar_off = bar_offset(0);
        let idx = cfg.write(bar_off, 4, 0x4000_0001);
        assert_eq!(idx, Some(0));
        let readback = cfg.read(bar_off, 4);
        // expected = (data & mask) | (initial & ~mask)
        let expected = (0x4000_0001u32 & 0xFFFF_FF01) | (0x0000_0001 & !0xFFFF_FF01);
        assert_eq!(readback, expected);
    }

    #[test]
    fn bar_relocation_scenario() {
        // spec.md §8 scenario 2: write 0x04000001 to BAR0 (I/O space at
        // 0x4000, length 0x100 per mask 0xFFFFFF00).
        let mut data = [0u32; NUM_DWORDS];
        let mut mask = [0u32; NUM_DWORDS];
        data[4] = 0x0000_0001;
        mask[4] = 0xFFFF_FF00 | 0x01;
        let mut cfg = PciConfigSpace::new(data, mask);
        cfg.write(0x10, 4, 0x0400_0001);
        let bar = cfg.bar(0);
        assert!(bar.is_io);
        assert_eq!(bar.base, 0x4000);
        assert_eq!(bar.length, 0x100);

        let mut bus = Bus::new();
        struct Dummy;
        impl BusEndpoint for Dummy {
            fn read(&self, _r: u32, _o: u64, _s: u8) -> u64 {
                0
            }
            fn write(&self, _r: u32, _o: u64, _s: u8, _v: u64) {}
        }
        register_bar(&mut bus, 1, 0, Arc::new(Dummy), bar).unwrap();
        assert_eq!(bus.read_mem(Space::Io, 0x4000, 1), 0);
    }

    #[test]
    fn reset_restores_template() {
        let mut cfg = make_space();
        cfg.write(bar_offset(0), 4, 0xFFFF_FFFF);
        cfg.reset();
        assert_eq!(cfg.bar(0).base, 0);
    }

    #[test]
    fn interrupt_routing() {
        let mut data = [0u32; NUM_DWORDS];
        let mask = [0u32; NUM_DWORDS];
        data[0x3C / 4] = 11; // interrupt line byte = 11
        let cfg = PciConfigSpace::new(data, mask);

        struct Recorder(std::sync::Mutex<Vec<(u8, bool)>>);
        impl ChipsetInterrupt for Recorder {
            fn interrupt(&self, line: u8, asserted: bool) {
                self.0.lock().unwrap().push((line, asserted));
            }
        }
        let r = Recorder(std::sync::Mutex::new(Vec::new()));
        do_pci_interrupt(&cfg, &r, true);
        assert_eq!(r.0.lock().unwrap().as_slice(), &[(11, true)]);
    }
}
