//! Nested name/value configuration tree, consumed once at machine `init`.
//!
//! The source reads an INI-like text file through a hand-rolled
//! `CConfigurator`. We keep the "nested name-value tree" shape from
//! spec.md §6 but parse it from TOML via `serde`, since no crate in the
//! sampled teacher slice hand-rolls a config parser and `serde` is the
//! idiomatic choice used throughout the wider pack for exactly this kind
//! of settings tree.

use es40_error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// `serial.N.*` block.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SerialPortConfig {
    pub port: Option<u16>,
    pub address: Option<String>,
    pub action: Option<String>,
}

/// `nic.*` block.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NicConfig {
    pub adapter: Option<String>,
    pub mac: Option<String>,
    #[serde(default)]
    pub queue: Option<u32>,
    #[serde(default)]
    pub crc: bool,
}

/// `disk.*` block. `size` is a size-with-unit-suffix string (K/M/G), parsed
/// by [`parse_size`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DiskConfig {
    pub size: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub cdrom: bool,
    pub image: Option<PathBuf>,
}

/// `rom.*` block.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RomConfig {
    pub flash: Option<PathBuf>,
    pub dpr: Option<PathBuf>,
}

/// `keyboard.*` block.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KeyboardConfig {
    #[serde(default)]
    pub use_mapping: bool,
    pub map: Option<PathBuf>,
}

/// `lpt.*` block.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LptConfig {
    pub outfile: Option<PathBuf>,
}

/// `mouse.*` block.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MouseConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// `cpus.*` block — ambient, not named by the distilled spec but required
/// to size the CPU-thread pool (spec.md §1: "one to four Alpha CPUs").
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CpusConfig {
    #[serde(default = "default_cpu_count")]
    pub count: u32,
}

fn default_cpu_count() -> u32 {
    1
}

/// `log.*` block — ambient.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LogConfig {
    pub level: Option<String>,
}

/// Top-level recognized configuration tree (spec.md §6).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub vga_console: bool,
    #[serde(default)]
    pub mouse: MouseConfig,
    #[serde(default)]
    pub lpt: LptConfig,
    #[serde(default)]
    pub serial: std::collections::BTreeMap<u32, SerialPortConfig>,
    #[serde(default)]
    pub nic: NicConfig,
    #[serde(default)]
    pub disk: std::collections::BTreeMap<u32, DiskConfig>,
    #[serde(default)]
    pub rom: RomConfig,
    #[serde(default)]
    pub keyboard: KeyboardConfig,
    #[serde(default)]
    pub private_colormap: bool,
    #[serde(default)]
    pub cpus: CpusConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Parse a configuration tree from TOML text. Any malformed document is
    /// a `Configuration` error, per spec.md §7 ("Configuration mistakes at
    /// init abort the emulator with a clear message").
    pub fn from_toml_str(text: &str) -> Result<Config> {
        toml::from_str(text)
            .map_err(|e| Error::configuration("config", format!("invalid configuration: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration("config", format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn cpu_count(&self) -> Result<u32> {
        let n = self.cpus.count;
        if !(1..=4).contains(&n) {
            return Err(Error::configuration(
                "config",
                format!("cpus.count must be 1-4, got {n}"),
            ));
        }
        Ok(n)
    }
}

/// Parse a size-with-unit-suffix string (`disk.size`) into a byte count.
/// Accepts a bare integer or an integer suffixed with `K`, `M`, or `G`
/// (case-insensitive), matching spec.md §6.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::configuration("config", "empty size"));
    }
    let (digits, mult) = match s.chars().last().unwrap().to_ascii_uppercase() {
        'K' => (&s[..s.len() - 1], 1024u64),
        'M' => (&s[..s.len() - 1], 1024 * 1024),
        'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::configuration("config", format!("invalid size: {s}")))?;
    n.checked_mul(mult)
        .ok_or_else(|| Error::configuration("config", format!("size overflow: {s}")))
}

/// Parse a `xx-xx-xx-xx-xx-xx` MAC address string (`nic.mac`).
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 6 {
        return Err(Error::configuration(
            "config",
            format!("invalid MAC address: {s}"),
        ));
    }
    let mut mac = [0u8; 6];
    for (i, p) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(p, 16)
            .map_err(|_| Error::configuration("config", format!("invalid MAC address: {s}")))?;
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_tree() {
        let cfg = Config::from_toml_str(
            r#"
            vga_console = true

            [mouse]
            enabled = true

            [nic]
            adapter = "eth0"
            mac = "08-00-2b-a1-b2-c3"
            queue = 256
            crc = true

            [disk.0]
            size = "4G"
            read_only = false
            "#,
        )
        .unwrap();
        assert!(cfg.vga_console);
        assert!(cfg.mouse.enabled);
        assert_eq!(cfg.nic.adapter.as_deref(), Some("eth0"));
        assert_eq!(cfg.disk[&0].size.as_deref(), Some("4G"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Config::from_toml_str("not valid toml [[[").is_err());
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("08-00-2b-a1-b2-c3").unwrap(),
            [0x08, 0x00, 0x2b, 0xa1, 0xb2, 0xc3]
        );
        assert!(parse_mac("bad").is_err());
    }

    #[test]
    fn cpu_count_bounds() {
        let mut cfg = Config::default();
        cfg.cpus.count = 0;
        assert!(cfg.cpu_count().is_err());
        cfg.cpus.count = 5;
        assert!(cfg.cpu_count().is_err());
        cfg.cpus.count = 4;
        assert_eq!(cfg.cpu_count().unwrap(), 4);
    }
}
