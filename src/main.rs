//! `es40` command-line entry point: load a configuration file, boot a
//! [`System`], and run its watchdog loop until a worker dies, a save/restore
//! request completes, or the process receives a shutdown signal.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use es40_config::Config;
use es40_error::Result;
use es40_system::System;

/// Boots the ES40 interconnect substrate from a TOML configuration file.
#[derive(Debug, Parser)]
#[command(name = "es40", version, about)]
struct Args {
    /// Path to the TOML configuration tree (spec.md §6).
    #[arg(long, default_value = "es40.toml")]
    config: PathBuf,

    /// Restore from this save-state file immediately after boot instead of
    /// starting cold.
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Save state to this file and exit once the machine has booted, instead
    /// of running the watchdog loop. Mainly useful for smoke-testing a
    /// configuration.
    #[arg(long)]
    save_and_exit: Option<PathBuf>,

    /// How often to poll `check_state` for a dead worker thread, in
    /// milliseconds.
    #[arg(long, default_value_t = 100)]
    watchdog_interval_ms: u64,
}

fn init_tracing(config: &Config) {
    let filter = config
        .log
        .level
        .clone()
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(tracing_subscriber::EnvFilter::from_default_env);
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run(args: Args) -> Result<()> {
    let config = Config::from_file(&args.config)?;
    init_tracing(&config);

    tracing::info!(config = %args.config.display(), cpus = config.cpu_count()?, "booting machine");
    let mut system = System::new(&config)?;

    if let Some(path) = &args.restore {
        let mut file = std::fs::File::open(path).map_err(|e| {
            es40_error::Error::configuration("es40", format!("cannot open {}: {e}", path.display()))
        })?;
        system.restore(&mut file)?;
        tracing::info!(path = %path.display(), "restored save state");
    }

    if let Some(path) = &args.save_and_exit {
        let mut file = std::fs::File::create(path).map_err(|e| {
            es40_error::Error::configuration("es40", format!("cannot create {}: {e}", path.display()))
        })?;
        system.save(&mut file)?;
        tracing::info!(path = %path.display(), "saved state, exiting");
        system.stop();
        return Ok(());
    }

    let watchdog_interval = Duration::from_millis(args.watchdog_interval_ms);
    let result = loop {
        std::thread::sleep(watchdog_interval);
        if let Err(e) = system.check_state() {
            break Err(e);
        }
    };

    system.stop();
    result
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        if e.is_graceful() {
            eprintln!("{e}");
            std::process::exit(0);
        }
        eprintln!("es40: {e}");
        std::process::exit(1);
    }
}
