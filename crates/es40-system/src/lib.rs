//! Top-level machine wiring (spec.md §9 "Putting it together"): constructs
//! the bus fabric, the PIC pair, every chipset/SCSI/NIC device, the single
//! PCI configuration window, and spawns the per-device worker threads.
//! Mirrors the teacher's top-level `Machine` assembling its device
//! singletons into one owned value instead of globals, generalized here to
//! this substrate's device set (spec.md §9's "typed chipset slots instead
//! of global singletons" guidance).

pub mod cpu;
pub mod memory_map;
pub mod pci;
pub mod workers;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use es40_bus::memory::PhysicalMemory;
use es40_bus::{Bus, ComponentId, Origin, Space};
use es40_chipset::dma::{Dma, DmaPort, DmaPortKind};
use es40_chipset::dpr::Dpr;
use es40_chipset::flash::Flash;
use es40_chipset::kbc::Kbc;
use es40_chipset::lpt::Lpt;
use es40_chipset::pit::Pit;
use es40_chipset::rtc::Rtc;
use es40_chipset::tcp_backend::TcpSerialBackend;
use es40_chipset::uart::{NullBackend, SerialBackend, Uart};
use es40_chipset::{PicPort, SpeakerControl};
use es40_config::Config;
use es40_error::{Error, Result};
use es40_interrupts::PicPair;
use es40_nic::{LoopbackBackend, Tulip21143};
use es40_pci::{PciConfigSpace, NUM_DWORDS};
use es40_runtime::{check_state, WorkerHandle};
use es40_scsi::{DiskBackend, ScsiTarget, Sym53C810};
use es40_snapshot::{restore_all, save_all, Savable};

use crate::cpu::{CpuInterruptPin, CpuStub};
use crate::memory_map::*;
use crate::pci::PciConfigWindow;
use crate::workers::{HeartbeatWorker, NicWorker, PitWorker, RtcWorker, ScsiWorker, UartRxWorker};

const COMP_RAM: ComponentId = 1;
const COMP_PIC_MASTER: ComponentId = 2;
const COMP_PIC_SLAVE: ComponentId = 3;
const COMP_PIT: ComponentId = 4;
const COMP_SPEAKER: ComponentId = 5;
const COMP_RTC: ComponentId = 6;
const COMP_KBC: ComponentId = 7;
const COMP_UART0: ComponentId = 8;
const COMP_UART1: ComponentId = 9;
const COMP_LPT: ComponentId = 10;
const COMP_DMA_CHANNEL0: ComponentId = 11;
const COMP_DMA_CHANNEL1: ComponentId = 12;
const COMP_DMA_MAIN0: ComponentId = 13;
const COMP_DMA_MAIN1: ComponentId = 14;
const COMP_DMA_PAGE_LOW: ComponentId = 15;
const COMP_DMA_PAGE_HIGH: ComponentId = 16;
const COMP_FLASH: ComponentId = 17;
const COMP_DPR: ComponentId = 18;
const COMP_SCSI: ComponentId = 19;
const COMP_NIC: ComponentId = 20;
const COMP_PCI_CONFIG: ComponentId = 21;

const SCSI_PCI_DEV: u8 = 1;
const NIC_PCI_DEV: u8 = 2;

enum SerialWiring {
    Null,
    Tcp(Arc<TcpSerialBackend>),
}

/// A 128-byte I/O BAR with only the base bits writable, the idiomatic
/// shape for both devices this system carries (spec.md §4.2/§4.6/§4.7).
fn io_bar_template(vendor: u16, device: u16, class: u8, subclass: u8) -> ([u32; NUM_DWORDS], [u32; NUM_DWORDS]) {
    let mut data = [0u32; NUM_DWORDS];
    let mut mask = [0u32; NUM_DWORDS];
    data[0] = vendor as u32 | ((device as u32) << 16);
    mask[1] = 0x0000_0007; // command: I/O space, memory space, bus master enable
    data[2] = ((subclass as u32) << 16) | ((class as u32) << 24);
    data[4] = 0x0000_0001; // BAR0: I/O space
    mask[4] = 0xFFFF_FF81; // base bits 7-31 writable, 128-byte decode window
    mask[15] = 0x0000_00FF; // interrupt_line byte writable
    (data, mask)
}

/// A running machine: every device, the bus that routes to them, and the
/// worker threads driving their periodic/polled work (spec.md §5).
pub struct System {
    bus: Arc<Mutex<Bus>>,
    cpus: Vec<CpuInterruptPin>,

    pit: Arc<Pit>,
    rtc: Arc<Rtc>,
    dma: Arc<Dma>,
    kbc: Arc<Kbc>,
    uart0: Arc<Uart>,
    uart1: Arc<Uart>,
    lpt: Arc<Lpt>,
    flash: Arc<Flash>,
    dpr: Arc<Dpr>,
    scsi: Arc<Sym53C810>,
    nic: Arc<Tulip21143>,

    workers: Vec<WorkerHandle>,
}

impl System {
    pub fn new(config: &Config) -> Result<System> {
        let mut bus = Bus::new();

        let ram = Arc::new(PhysicalMemory::new(RAM_SIZE));
        bus.register_memory(ram, COMP_RAM, 0, Space::Memory, Origin::Legacy, 0, RAM_SIZE)?;

        let cpu_count = config.cpu_count()?;
        let cpus: Vec<CpuInterruptPin> = (0..cpu_count).map(|_| CpuInterruptPin::new()).collect();
        // Only CPU 0 fields PIC interrupts (see `cpu::CpuInterruptPin`).
        let pic = Arc::new(Mutex::new(PicPair::new(Box::new(cpus[0].clone()))));

        bus.register_memory(
            Arc::new(PicPort::new(pic.clone(), 0)),
            COMP_PIC_MASTER,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_PIC_MASTER,
            2,
        )?;
        bus.register_memory(
            Arc::new(PicPort::new(pic.clone(), 1)),
            COMP_PIC_SLAVE,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_PIC_SLAVE,
            2,
        )?;

        let pit = Arc::new(Pit::new(pic.clone()));
        bus.register_memory(
            pit.clone(),
            COMP_PIT,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_PIT,
            4,
        )?;

        let speaker = Arc::new(SpeakerControl::new(pit.clone()));
        bus.register_memory(
            speaker,
            COMP_SPEAKER,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_SPEAKER_CONTROL,
            1,
        )?;

        let rtc = Arc::new(Rtc::new(pic.clone()));
        bus.register_memory(
            rtc.clone(),
            COMP_RTC,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_RTC,
            2,
        )?;

        let kbc = Arc::new(Kbc::new(pic.clone()));
        bus.register_memory(
            kbc.clone(),
            COMP_KBC,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_KBC,
            2,
        )?;

        let (uart0_backend, uart0_wiring) = Self::serial_backend(config, 0)?;
        let uart0 = Arc::new(Uart::new(uart0_backend, pic.clone(), 4));
        bus.register_memory(
            uart0.clone(),
            COMP_UART0,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_UART0,
            8,
        )?;

        let (uart1_backend, uart1_wiring) = Self::serial_backend(config, 1)?;
        let uart1 = Arc::new(Uart::new(uart1_backend, pic.clone(), 3));
        bus.register_memory(
            uart1.clone(),
            COMP_UART1,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_UART1,
            8,
        )?;

        let lpt = Arc::new(Lpt::new(pic.clone()));
        bus.register_memory(
            lpt.clone(),
            COMP_LPT,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_LPT,
            3,
        )?;

        let dma = Arc::new(Dma::new());
        bus.register_memory(
            Arc::new(DmaPort::new(dma.clone(), DmaPortKind::Channel0)),
            COMP_DMA_CHANNEL0,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_DMA0_CHANNEL,
            8,
        )?;
        bus.register_memory(
            Arc::new(DmaPort::new(dma.clone(), DmaPortKind::Channel1)),
            COMP_DMA_CHANNEL1,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_DMA1_CHANNEL,
            8,
        )?;
        bus.register_memory(
            Arc::new(DmaPort::new(dma.clone(), DmaPortKind::Main0)),
            COMP_DMA_MAIN0,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_DMA0_MAIN,
            8,
        )?;
        bus.register_memory(
            Arc::new(DmaPort::new(dma.clone(), DmaPortKind::Main1)),
            COMP_DMA_MAIN1,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_DMA1_MAIN,
            8,
        )?;
        bus.register_memory(
            Arc::new(DmaPort::new(dma.clone(), DmaPortKind::PageLow)),
            COMP_DMA_PAGE_LOW,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_DMA_PAGE_LOW,
            15,
        )?;
        bus.register_memory(
            Arc::new(DmaPort::new(dma.clone(), DmaPortKind::PageHigh)),
            COMP_DMA_PAGE_HIGH,
            0,
            Space::Io,
            Origin::Legacy,
            LEGACY_IO_BASE + OFF_DMA_PAGE_HIGH,
            15,
        )?;

        let flash = Arc::new(Flash::new());
        if let Some(path) = &config.rom.flash {
            let image = std::fs::read(path).map_err(|e| {
                Error::configuration("system", format!("cannot read {}: {e}", path.display()))
            })?;
            flash.load_image(&image);
        }
        bus.register_memory(
            flash.clone(),
            COMP_FLASH,
            0,
            Space::Memory,
            Origin::Legacy,
            FLASH_BASE,
            FLASH_WINDOW_LEN,
        )?;

        let dpr = Arc::new(Dpr::new());
        bus.register_memory(
            dpr.clone(),
            COMP_DPR,
            0,
            Space::Memory,
            Origin::Legacy,
            DPR_BASE,
            DPR_WINDOW_LEN,
        )?;

        let scsi = Arc::new(Sym53C810::new(pic.clone(), 9));
        for (&target_id, disk_cfg) in &config.disk {
            let backend = match &disk_cfg.image {
                Some(path) => DiskBackend::open_file(path)?,
                None => {
                    let size = disk_cfg
                        .size
                        .as_deref()
                        .map(es40_config::parse_size)
                        .transpose()?
                        .ok_or_else(|| {
                            Error::configuration("system", "disk entry needs either image or size")
                        })?;
                    DiskBackend::memory(size as usize)
                }
            };
            let target = ScsiTarget::new(backend, disk_cfg.cdrom, disk_cfg.read_only);
            scsi.register_disk(target_id as u8, target);
        }

        let mac = config
            .nic
            .mac
            .as_deref()
            .map(es40_config::parse_mac)
            .transpose()?
            .unwrap_or([0x08, 0x00, 0x2b, 0xa1, 0xb2, 0xc3]);
        if config.nic.adapter.is_some() {
            tracing::warn!("nic.adapter is configured but host network passthrough is out of scope; using loopback");
        }
        let nic = Arc::new(Tulip21143::new(pic.clone(), 10, mac, Box::new(LoopbackBackend::new())));

        let bus = Arc::new(Mutex::new(bus));

        let mut pci_window = PciConfigWindow::new(bus.clone());
        let (scsi_data, scsi_mask) = io_bar_template(0x1000, 0x0001, 0x01, 0x00);
        pci_window.add_function(SCSI_PCI_DEV, COMP_SCSI, PciConfigSpace::new(scsi_data, scsi_mask), scsi.clone());
        let (nic_data, nic_mask) = io_bar_template(0x1011, 0x0019, 0x02, 0x00);
        pci_window.add_function(NIC_PCI_DEV, COMP_NIC, PciConfigSpace::new(nic_data, nic_mask), nic.clone());
        bus.lock().unwrap().register_memory(
            Arc::new(pci_window),
            COMP_PCI_CONFIG,
            0,
            Space::Memory,
            Origin::Legacy,
            PCI_CONFIG_BASE,
            PCI_CONFIG_WINDOW_LEN,
        )?;

        let mut workers = Vec::new();
        workers.push(WorkerHandle::start(PitWorker(pit.clone())));
        workers.push(WorkerHandle::start(RtcWorker(rtc.clone())));
        workers.push(WorkerHandle::start(ScsiWorker { scsi: scsi.clone(), bus: bus.clone() }));
        workers.push(WorkerHandle::start(NicWorker { nic: nic.clone(), bus: bus.clone() }));
        workers.push(WorkerHandle::start(HeartbeatWorker { label: "kbc" }));
        workers.push(WorkerHandle::start(HeartbeatWorker { label: "dpr" }));
        match uart0_wiring {
            SerialWiring::Tcp(backend) => workers.push(WorkerHandle::start(UartRxWorker {
                uart: uart0.clone(),
                backend,
                label: "uart0",
            })),
            SerialWiring::Null => workers.push(WorkerHandle::start(HeartbeatWorker { label: "uart0" })),
        }
        match uart1_wiring {
            SerialWiring::Tcp(backend) => workers.push(WorkerHandle::start(UartRxWorker {
                uart: uart1.clone(),
                backend,
                label: "uart1",
            })),
            SerialWiring::Null => workers.push(WorkerHandle::start(HeartbeatWorker { label: "uart1" })),
        }
        for id in 0..cpu_count {
            workers.push(WorkerHandle::start(CpuStub::new(id)));
        }

        Ok(System {
            bus,
            cpus,
            pit,
            rtc,
            dma,
            kbc,
            uart0,
            uart1,
            lpt,
            flash,
            dpr,
            scsi,
            nic,
            workers,
        })
    }

    fn serial_backend(config: &Config, port: u32) -> Result<(Arc<dyn SerialBackend>, SerialWiring)> {
        let Some(serial_cfg) = config.serial.get(&port) else {
            return Ok((Arc::new(NullBackend), SerialWiring::Null));
        };
        match (serial_cfg.address.as_deref(), serial_cfg.port) {
            (Some(addr), Some(tcp_port)) => {
                let socket: SocketAddr = format!("{addr}:{tcp_port}").parse().map_err(|e| {
                    Error::configuration("system", format!("invalid serial.{port} address: {e}"))
                })?;
                let backend = Arc::new(TcpSerialBackend::bind(socket).map_err(|e| {
                    Error::configuration("system", format!("cannot bind serial.{port}: {e}"))
                })?);
                Ok((backend.clone(), SerialWiring::Tcp(backend)))
            }
            _ => Ok((Arc::new(NullBackend), SerialWiring::Null)),
        }
    }

    /// Check every worker thread is still alive (spec.md §4.4/§7 "Thread
    /// death"); propagates the first dead worker found as an error.
    pub fn check_state(&self) -> Result<()> {
        let refs: Vec<&WorkerHandle> = self.workers.iter().collect();
        check_state(&refs)
    }

    /// Stop every worker thread, joining each one.
    pub fn stop(&mut self) {
        for worker in &mut self.workers {
            worker.stop(None);
        }
    }

    /// The fixed registration order every save/restore round trips through.
    fn savables(&self) -> Vec<&dyn Savable> {
        vec![
            self.pit.as_ref(),
            self.rtc.as_ref(),
            self.dma.as_ref(),
            self.kbc.as_ref(),
            self.uart0.as_ref(),
            self.uart1.as_ref(),
            self.lpt.as_ref(),
            self.flash.as_ref(),
            self.dpr.as_ref(),
            self.scsi.as_ref(),
            self.nic.as_ref(),
        ]
    }

    pub fn save(&self, out: &mut impl std::io::Write) -> Result<()> {
        save_all(&self.savables(), out)
    }

    pub fn restore(&self, input: &mut impl std::io::Read) -> Result<()> {
        restore_all(&self.savables(), input)
    }

    /// Number of emulated CPUs configured at construction.
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config::from_toml_str("").unwrap()
    }

    #[test]
    fn boots_with_default_config_and_all_workers_alive() {
        let mut system = System::new(&minimal_config()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(system.check_state().is_ok());
        system.stop();
    }

    #[test]
    fn memory_mapped_devices_are_reachable_through_the_bus() {
        let mut system = System::new(&minimal_config()).unwrap();
        {
            let bus = system.bus.lock().unwrap();
            // PIT channel 0 read-back after the default 0xFFFF reload (mode 3).
            let _ = bus.read_mem(Space::Io, LEGACY_IO_BASE + OFF_PIT, 1);
        }
        system.stop();
    }

    #[test]
    fn save_restore_round_trips_after_register_writes() {
        let mut system = System::new(&minimal_config()).unwrap();
        system.lpt.write_port(0, 0x42);

        let mut buf = Vec::new();
        system.save(&mut buf).unwrap();

        let mut other = System::new(&minimal_config()).unwrap();
        let mut cursor = std::io::Cursor::new(&buf);
        other.restore(&mut cursor).unwrap();
        assert_eq!(other.lpt.read_port(0), 0x42);

        system.stop();
        other.stop();
    }

    #[test]
    fn disk_backed_by_memory_registers_on_scsi_controller() {
        let toml = r#"
            [disk.0]
            size = "1M"
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        let mut system = System::new(&config).unwrap();
        system.stop();
    }

    #[test]
    fn nic_defaults_to_the_built_in_mac_without_a_configured_adapter() {
        let mut system = System::new(&minimal_config()).unwrap();
        let blob = system.nic.save_state();
        assert_eq!(&blob[64..70], &[0x08, 0x00, 0x2b, 0xa1, 0xb2, 0xc3]);
        system.stop();
    }
}
