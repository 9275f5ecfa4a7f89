//! CPU thread placeholder (spec.md §1 excludes the Alpha decoder/execution
//! core from this substrate's scope). One [`CpuStub`] per configured CPU
//! (1-4, spec.md §1) still runs its own [`es40_runtime::DeviceWorker`]
//! thread, honoring the "one thread per emulated CPU" concurrency model
//! (spec.md §5) even though its work unit does nothing but idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use es40_error::Result;
use es40_interrupts::InterruptLine;
use es40_runtime::DeviceWorker;

/// The single wire from the master PIC's INTR output to CPU 0 (spec.md §8's
/// `line_55_asserted` invariant names one line, so only CPU 0 is wired to
/// it; CPUs 1-3 run but never observe PIC interrupts, matching a real
/// ES40 where only the primary processor fields I-O interrupts).
#[derive(Clone, Default)]
pub struct CpuInterruptPin(Arc<AtomicBool>);

impl CpuInterruptPin {
    pub fn new() -> Self {
        CpuInterruptPin(Arc::new(AtomicBool::new(false)))
    }

    pub fn asserted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl InterruptLine for CpuInterruptPin {
    fn set_line(&self, asserted: bool) {
        self.0.store(asserted, Ordering::Release);
    }
}

pub struct CpuStub {
    id: u32,
}

impl CpuStub {
    pub fn new(id: u32) -> Self {
        CpuStub { id }
    }
}

impl DeviceWorker for CpuStub {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn work_unit(&mut self) -> Result<()> {
        let _ = self.id;
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(10)
    }
}
