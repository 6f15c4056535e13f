//! Host execution interrupt contract.
//!
//! When the scheduler decides a core running guest code must context-switch,
//! it cannot reach into the JIT; it asks the CPU collaborator to interrupt
//! that core's host thread, which then re-enters the kernel and performs
//! the switch itself.

use kernel_types::CoreId;

/// Receives asynchronous interrupt requests for virtual cores.
pub trait InterruptSink: Send + Sync {
    /// Requests that the host thread currently executing guest code on
    /// `core` break out and call back into the kernel.
    fn request_interrupt(&self, core: CoreId);
}

/// Discards interrupt requests. For embedders that drive every core
/// synchronously (single-host-thread mode) and for tests that assert on
/// scheduler state only.
pub struct NullInterruptSink;

impl InterruptSink for NullInterruptSink {
    fn request_interrupt(&self, _core: CoreId) {}
}

/// Records interrupt requests for test assertions.
#[derive(Default)]
pub struct RecordingInterruptSink {
    requests: parking_lot::Mutex<Vec<CoreId>>,
}

impl RecordingInterruptSink {
    /// Creates an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the interrupts requested so far
    pub fn requests(&self) -> Vec<CoreId> {
        self.requests.lock().clone()
    }
}

impl InterruptSink for RecordingInterruptSink {
    fn request_interrupt(&self, core: CoreId) {
        self.requests.lock().push(core);
    }
}
