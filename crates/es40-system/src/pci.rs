//! The single PCI configuration-space window (spec.md §4.2/§6), dispatching
//! by `(bus, dev, func)` to each device's [`PciConfigSpace`] and reprogramming
//! the bus fabric when a BAR write lands (`es40_pci::register_bar`).

use std::sync::{Arc, Mutex};

use es40_bus::{Bus, BusEndpoint, ComponentId};
use es40_pci::{register_bar, PciConfigSpace};

use crate::memory_map::decode_pci_config_offset;

/// One function's configuration space plus the BAR0 owner it should hand
/// to [`register_bar`] when the guest reprograms that BAR. Only BAR0 is
/// wired up: both devices this system carries (the SCSI HBA, the NIC) are
/// single-BAR, single-function devices.
struct Slot {
    dev: u8,
    func: u8,
    component: ComponentId,
    cfg: Mutex<PciConfigSpace>,
    bar0_owner: Arc<dyn BusEndpoint>,
}

pub struct PciConfigWindow {
    bus: Arc<Mutex<Bus>>,
    slots: Vec<Slot>,
}

impl PciConfigWindow {
    pub fn new(bus: Arc<Mutex<Bus>>) -> Self {
        PciConfigWindow { bus, slots: Vec::new() }
    }

    /// Register a single-function device's configuration space at
    /// `(dev, func=0)`, with `bar0_owner` as the endpoint `register_bar`
    /// installs whenever BAR0 is reprogrammed.
    pub fn add_function(
        &mut self,
        dev: u8,
        component: ComponentId,
        cfg: PciConfigSpace,
        bar0_owner: Arc<dyn BusEndpoint>,
    ) {
        self.slots.push(Slot {
            dev,
            func: 0,
            component,
            cfg: Mutex::new(cfg),
            bar0_owner,
        });
    }

    fn find(&self, dev: u8, func: u8) -> Option<&Slot> {
        self.slots.iter().find(|s| s.dev == dev && s.func == func)
    }
}

impl BusEndpoint for PciConfigWindow {
    fn read(&self, _range_id: u32, offset: u64, size: u8) -> u64 {
        let (_bus, dev, func, reg) = decode_pci_config_offset(offset);
        match self.find(dev, func) {
            Some(slot) => slot.cfg.lock().unwrap().read(reg, size) as u64,
            None => 0xFFFF_FFFF,
        }
    }

    fn write(&self, _range_id: u32, offset: u64, size: u8, value: u64) {
        let (_bus, dev, func, reg) = decode_pci_config_offset(offset);
        let Some(slot) = self.find(dev, func) else {
            return;
        };
        let bar_written = {
            let mut cfg = slot.cfg.lock().unwrap();
            cfg.write(reg, size, value as u32)
        };
        // spec.md §5 "Ordering": BAR reprogramming takes effect before any
        // subsequent fabric dispatch, so the bus is updated synchronously
        // here rather than queued for the main loop to apply later.
        if let Some(0) = bar_written {
            let bar = slot.cfg.lock().unwrap().bar(0);
            let mut bus = self.bus.lock().unwrap();
            if let Err(err) = register_bar(&mut bus, slot.component, 0, slot.bar0_owner.clone(), bar)
            {
                tracing::error!(error = %err, dev = slot.dev, "BAR0 reprogram failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use es40_bus::Space;
    use es40_pci::NUM_DWORDS;

    struct Dummy;
    impl BusEndpoint for Dummy {
        fn read(&self, _r: u32, _o: u64, _s: u8) -> u64 {
            0x42
        }
        fn write(&self, _r: u32, _o: u64, _s: u8, _v: u64) {}
    }

    #[test]
    fn bar0_write_relocates_device_on_bus() {
        let bus = Arc::new(Mutex::new(Bus::new()));
        let mut window = PciConfigWindow::new(bus.clone());

        let mut data = [0u32; NUM_DWORDS];
        let mut mask = [0u32; NUM_DWORDS];
        data[4] = 0x0000_0001; // BAR0: I/O space
        mask[4] = 0xFFFF_FF00 | 0x01;
        window.add_function(1, 10, PciConfigSpace::new(data, mask), Arc::new(Dummy));

        let offset = (1u64 << 11) | 0x10; // dev=1, func=0, reg=0x10 (BAR0)
        window.write(0, offset, 4, 0x4000_0001);

        assert_eq!(bus.lock().unwrap().read_mem(Space::Io, 0x4000, 1), 0x42);
    }

    #[test]
    fn unpopulated_function_reads_as_all_ones() {
        let bus = Arc::new(Mutex::new(Bus::new()));
        let window = PciConfigWindow::new(bus);
        let offset = (7u64 << 11) | 0x00;
        assert_eq!(window.read(0, offset, 4), 0xFFFF_FFFF);
    }
}
