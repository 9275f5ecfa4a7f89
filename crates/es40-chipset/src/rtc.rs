//! MC146818 real-time clock / TOY clock, ports 0x70-0x73, grounded on
//! `original_source/src/AliM1543C.cpp`'s `toy_read`/`toy_write`/
//! `toy_handle_periodic_interrupt`/`toy_update_irqf`.
//!
//! 256 bytes of `stored_data` hold the clock registers (0x00-0x09 are the
//! BCD/binary time-of-year fields, 0x0A-0x0D are control registers A-D)
//! plus NVRAM; a second 128-byte bank is addressed through ports 2/3 the
//! same way ports 0/1 address the first.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use es40_bus::BusEndpoint;
use es40_interrupts::PicPair;
use es40_snapshot::Savable;

const REG_A: usize = 0x0a;
const REG_B: usize = 0x0b;
const REG_C: usize = 0x0c;
const REG_D: usize = 0x0d;

const UIP: u8 = 0x80;
const SET: u8 = 0x80;
const PIE: u8 = 0x40;
const AIE: u8 = 0x20;
const UIE: u8 = 0x10;
const DM_BINARY: u8 = 0x04;
const H24: u8 = 0x02;
const IRQF: u8 = 0x80;
const PF: u8 = 0x40;
const UF: u8 = 0x10;
const VRT: u8 = 0x80;

struct Inner {
    stored_data: [u8; 256],
    access_ports: [u8; 4],
}

pub struct Rtc {
    inner: Mutex<Inner>,
    pic: Arc<Mutex<PicPair>>,
}

fn to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// Seconds since the epoch, used only to derive a wall-clock breakdown;
/// there is no dependency on a calendar crate since the source only ever
/// needs UTC struct-tm fields (the `time` crate would be the idiomatic
/// choice for anything richer, but days-since-epoch arithmetic is enough
/// here and keeps this crate's dependency footprint aligned with the
/// rest of the chipset).
fn civil_from_unix(secs: u64) -> (u32, u8, u8, u8, u8, u8, u8) {
    let days = secs / 86400;
    let rem = secs % 86400;
    let (hour, min, sec) = ((rem / 3600) as u8, ((rem / 60) % 60) as u8, (rem % 60) as u8);
    let wday = ((days + 4) % 7) as u8; // 1970-01-01 was a Thursday.
    let mut z = days as i64 + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    z -= era * 146097;
    let doe = z as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
    let year = if month <= 2 { y + 1 } else { y };
    (year as u32, month, day, hour, min, sec, wday)
}

impl Rtc {
    pub fn new(pic: Arc<Mutex<PicPair>>) -> Self {
        Rtc {
            inner: Mutex::new(Inner {
                stored_data: [0u8; 256],
                access_ports: [0u8; 4],
            }),
            pic,
        }
    }

    pub fn read_port(&self, port: u8) -> u8 {
        self.inner.lock().unwrap().access_ports[port as usize]
    }

    pub fn write_port(&self, port: u8, data: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.access_ports[port as usize] = data;
        match port {
            0 => {
                if (data & 0x7f) < 14 {
                    self.latch_time(&mut inner);
                }
                let idx = (data & 0x7f) as usize;
                inner.access_ports[1] = inner.stored_data[idx];
                if idx == REG_C {
                    inner.stored_data[REG_C] = 0;
                }
            }
            1 => {
                let idx = (inner.access_ports[0] & 0x7f) as usize;
                if idx == REG_B && data & 0x40 != 0 {
                    inner.stored_data[REG_C] = 0xf0;
                }
                inner.stored_data[idx] = data;
            }
            2 => {
                let idx = 0x80 + (data & 0x7f) as usize;
                inner.access_ports[3] = inner.stored_data[idx];
            }
            3 => {
                let idx = 0x80 + (inner.access_ports[2] & 0x7f) as usize;
                inner.stored_data[idx] = data;
            }
            _ => unreachable!(),
        }
        self.update_irqf(&mut inner);
    }

    fn latch_time(&self, inner: &mut Inner) {
        inner.stored_data[REG_D] = VRT;
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let (year, month, day, hour, min, sec, wday) = civil_from_unix(secs);
        let binary = inner.stored_data[REG_B] & DM_BINARY != 0;
        let h24 = inner.stored_data[REG_B] & H24 != 0;
        let hour_field = if h24 {
            hour
        } else {
            let h12 = hour % 12;
            (if hour / 12 != 0 { 0x80 } else { 0 }) | h12
        };
        if binary {
            inner.stored_data[0] = sec;
            inner.stored_data[2] = min;
            inner.stored_data[4] = hour_field;
            inner.stored_data[6] = wday + 1;
            inner.stored_data[7] = day;
            inner.stored_data[8] = month;
            inner.stored_data[9] = (year % 100) as u8;
        } else {
            inner.stored_data[0] = to_bcd(sec);
            inner.stored_data[2] = to_bcd(min);
            inner.stored_data[4] = if h24 {
                to_bcd(hour)
            } else {
                (hour_field & 0x80) | to_bcd(hour_field & 0x7f)
            };
            inner.stored_data[6] = wday + 1;
            inner.stored_data[7] = to_bcd(day);
            inner.stored_data[8] = to_bcd(month);
            inner.stored_data[9] = to_bcd((year % 100) as u8);
        }
    }

    /// Called on every PIT tick that elapses a periodic-interrupt period;
    /// sets register C's PF bit. The exact rate-to-period mapping (table
    /// on page 14 of the MC146818 datasheet) is approximated by firing
    /// once per `periodic_tick` call when a nonzero rate is programmed,
    /// since this crate has no sub-millisecond wall clock to measure the
    /// source's `clock()`-based `timedelta` against (an Open Question
    /// resolved in DESIGN.md).
    pub fn periodic_tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        let rate = inner.stored_data[REG_A] & 0x0f;
        if rate != 0 {
            inner.stored_data[REG_C] |= PF;
        }
        self.update_irqf(&mut inner);
    }

    fn update_irqf(&self, inner: &mut Inner) {
        let b = inner.stored_data[REG_B];
        let c = inner.stored_data[REG_C];
        let fire = (b & PIE != 0 && c & PF != 0)
            || (b & UIE != 0 && c & UF != 0)
            || (b & AIE != 0 && c & 0x20 != 0);
        if fire {
            inner.stored_data[REG_C] |= IRQF;
            self.pic.lock().unwrap().interrupt(0, 8);
        } else {
            inner.stored_data[REG_C] &= !IRQF;
        }
    }

    /// Direct NVRAM access, e.g. for seeding byte 0x17 from configuration
    /// at boot (spec.md §6).
    pub fn set_nvram_byte(&self, index: u8, value: u8) {
        self.inner.lock().unwrap().stored_data[index as usize] = value;
    }

    pub fn register_b_set(&self) -> bool {
        self.inner.lock().unwrap().stored_data[REG_B] & SET != 0
    }

    pub fn register_a_uip(&self) -> bool {
        self.inner.lock().unwrap().stored_data[REG_A] & UIP != 0
    }
}

impl Savable for Rtc {
    fn magic1(&self) -> [u8; 4] {
        *b"RTC0"
    }
    fn magic2(&self) -> [u8; 4] {
        *b"0CTR"
    }
    fn save_state(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut buf = Vec::with_capacity(256 + 4);
        buf.extend_from_slice(&inner.stored_data);
        buf.extend_from_slice(&inner.access_ports);
        buf
    }
    fn load_state(&self, blob: &[u8]) -> es40_error::Result<()> {
        if blob.len() != 260 {
            return Err(es40_error::Error::illegal_state("rtc", "bad snapshot length"));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.stored_data.copy_from_slice(&blob[..256]);
        inner.access_ports.copy_from_slice(&blob[256..260]);
        Ok(())
    }
}

impl BusEndpoint for Rtc {
    fn read(&self, _range_id: u32, offset: u64, _size: u8) -> u64 {
        self.read_port(offset as u8) as u64
    }

    fn write(&self, _range_id: u32, offset: u64, _size: u8, value: u64) {
        self.write_port(offset as u8, value as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use es40_interrupts::InterruptLine;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestLine(Arc<AtomicBool>);
    impl InterruptLine for TestLine {
        fn set_line(&self, asserted: bool) {
            self.0.store(asserted, Ordering::SeqCst);
        }
    }

    fn setup() -> Rtc {
        let flag = Arc::new(AtomicBool::new(false));
        let mut pair = PicPair::new(Box::new(TestLine(flag)));
        pair.write_cmd(0, 0x11).unwrap();
        pair.write_data(0, 0x20).unwrap();
        pair.write_data(0, 0x04).unwrap();
        pair.write_data(0, 0x01).unwrap();
        Rtc::new(Arc::new(Mutex::new(pair)))
    }

    #[test]
    fn register_b_roundtrips() {
        let rtc = setup();
        rtc.write_port(0, REG_B as u8);
        rtc.write_port(1, PIE | DM_BINARY | H24);
        rtc.write_port(0, REG_B as u8);
        assert_eq!(rtc.read_port(1), PIE | DM_BINARY | H24);
    }

    #[test]
    fn periodic_interrupt_sets_irqf_when_enabled() {
        let rtc = setup();
        rtc.write_port(0, REG_A as u8);
        rtc.write_port(1, 0x26); // nonzero rate
        rtc.write_port(0, REG_B as u8);
        rtc.write_port(1, PIE);
        rtc.periodic_tick();
        rtc.write_port(0, REG_C as u8);
        assert_eq!(rtc.read_port(1) & IRQF, IRQF);
    }

    #[test]
    fn reading_register_c_clears_it() {
        let rtc = setup();
        rtc.write_port(0, REG_A as u8);
        rtc.write_port(1, 0x26);
        rtc.write_port(0, REG_B as u8);
        rtc.write_port(1, PIE);
        rtc.periodic_tick();
        rtc.write_port(0, REG_C as u8);
        let _ = rtc.read_port(1);
        rtc.write_port(0, REG_C as u8);
        assert_eq!(rtc.read_port(1), 0);
    }
}
