//! Device Runtime and Concurrency Contract (spec.md §4.4/§5), grounded on
//! `original_source/src/SystemComponent.h`'s `start_threads`/`stop_threads`/
//! `check_state` lifecycle and `CSemaphore`.

pub mod semaphore;

pub use semaphore::Semaphore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use es40_error::{Error, Result};

/// One bounded unit of work performed by a device worker's loop iteration
/// (spec.md §4.4: "one polling pass, one SCRIPTS instruction batch, one
/// Rx/Tx scan").
pub trait DeviceWorker: Send + 'static {
    /// Human-readable component tag, used in panic/error diagnostics
    /// (the source's `devid_string`).
    fn name(&self) -> &'static str;

    /// Perform one bounded unit of work. Returning `Err` marks the worker
    /// dead; the main loop's `check_state` then aborts with a diagnostic
    /// (spec.md §7 "Thread death").
    fn work_unit(&mut self) -> Result<()>;

    /// How long to sleep/wait when there is no semaphore to block on.
    /// Devices driven purely by a semaphore (e.g. the SCRIPTS engine)
    /// override this to `Duration::ZERO` and rely on `semaphore` instead.
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    /// An optional semaphore the worker blocks on between work units
    /// instead of (or in addition to) sleeping, per spec.md §5.
    fn semaphore(&self) -> Option<&Semaphore> {
        None
    }
}

/// Owns a worker's thread, its cooperative stop flag, and its dead-flag
/// (spec.md §4.4 "A watchdog operation `check_state`").
pub struct WorkerHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    dead: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Start `worker`'s loop on a new OS thread.
    pub fn start<W: DeviceWorker>(mut worker: W) -> Self {
        let name = worker.name();
        let stop = Arc::new(AtomicBool::new(false));
        let dead = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let dead2 = dead.clone();

        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !stop2.load(Ordering::Acquire) {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        worker.work_unit()
                    }));
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::error!(worker = name, error = %e, "device worker returned an error");
                            dead2.store(true, Ordering::Release);
                            break;
                        }
                        Err(_) => {
                            tracing::error!(worker = name, "device worker panicked");
                            dead2.store(true, Ordering::Release);
                            break;
                        }
                    }
                    if stop2.load(Ordering::Acquire) {
                        break;
                    }
                    match worker.semaphore() {
                        Some(sem) => {
                            let _ = sem.wait_timeout(worker.poll_interval());
                        }
                        None => std::thread::sleep(worker.poll_interval()),
                    }
                }
            })
            .expect("failed to spawn device worker thread");

        WorkerHandle {
            name,
            stop,
            dead,
            join: Some(join),
        }
    }

    /// Cooperatively stop the worker: set the stop flag, signal any
    /// semaphore it may be parked on, then join (spec.md §5 "Semaphore").
    pub fn stop(&mut self, wake: Option<&Semaphore>) {
        self.stop.store(true, Ordering::Release);
        if let Some(sem) = wake {
            let _ = sem.set();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The main-loop watchdog: aborts with a clear diagnostic if any tracked
/// worker has died (spec.md §4.4/§7 "Thread death").
pub fn check_state(workers: &[&WorkerHandle]) -> Result<()> {
    for w in workers {
        if w.is_dead() {
            return Err(Error::thread(
                "runtime",
                format!("device worker '{}' has died", w.name()),
            ));
        }
    }
    Ok(())
}
