//! Scheduling Test Utilities
//!
//! Shared helpers for integration tests that drive the scheduling core
//! with real host threads: a bootable test system, a guest-thread spawner
//! and a condition poller for cross-thread assertions.
//!
//! ## Test Philosophy
//!
//! - **Real blocking**: blocking syscalls park real host threads; these
//!   tests observe actual suspension and wake-up, not simulated state.
//! - **Deterministic setup**: threads are pinned to distinct cores so
//!   every test scenario is reproducible without interrupt plumbing.
//! - **Clean teardown**: tests wake everything they park and join every
//!   host thread they spawn.

use guest_hal::{NullInterruptSink, SimGuestMemory, SimHandleTable};
use hle_kernel::{ExecutionMode, Kernel, RunState};
use kernel_types::ThreadId;
use std::sync::Arc;

/// A booted kernel plus the simulated collaborators behind it.
pub struct TestSystem {
    pub kernel: Arc<Kernel>,
    pub memory: Arc<SimGuestMemory>,
    pub handles: Arc<SimHandleTable>,
}

/// Boots a parallel-mode kernel with 4 KiB of guest memory mapped at
/// 0x1000.
pub fn boot() -> TestSystem {
    boot_with(ExecutionMode::Parallel)
}

/// Boots a kernel in the given execution mode.
pub fn boot_with(mode: ExecutionMode) -> TestSystem {
    let memory = Arc::new(SimGuestMemory::new());
    memory.map_region(0x1000, 0x1000);
    let handles = Arc::new(SimHandleTable::new());
    let kernel = Kernel::new(
        mode,
        Arc::clone(&memory) as _,
        Arc::clone(&handles) as _,
        Arc::new(NullInterruptSink),
    );
    TestSystem {
        kernel,
        memory,
        handles,
    }
}

impl TestSystem {
    /// Creates and starts a guest thread pinned to one core.
    pub fn started_thread(&self, name: &str, priority: u32, core: usize) -> ThreadId {
        let id = self
            .kernel
            .create_thread(name, priority, core, 0)
            .expect("create_thread failed");
        self.kernel.start_thread(id).expect("start_thread failed");
        id
    }

    /// True once the thread is parked in a wait protocol.
    pub fn is_paused(&self, thread: ThreadId) -> bool {
        self.kernel
            .thread_info(thread)
            .map(|info| info.run_state == RunState::Paused)
            .unwrap_or(false)
    }
}

/// Runs guest code on its own host thread: parks until the thread is
/// switched in, then executes `body`. The join handle carries the body's
/// result back to the test.
pub fn spawn_guest<T, F>(
    kernel: &Arc<Kernel>,
    thread: ThreadId,
    body: F,
) -> std::thread::JoinHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&Kernel) -> T + Send + 'static,
{
    let kernel = Arc::clone(kernel);
    std::thread::spawn(move || {
        kernel
            .begin_execution(thread)
            .expect("begin_execution failed");
        body(&kernel)
    })
}

/// Polls `condition` for up to `timeout_ms`, returning whether it held.
pub fn eventually<F>(timeout_ms: u64, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    condition()
}
