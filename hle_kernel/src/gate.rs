//! Per-thread execution gates.
//!
//! Each guest thread is backed by a host thread. The scheduler never
//! descheduled a host thread by force; it closes the thread's gate and the
//! host thread parks itself on it at the bottom of the context switch.
//! Opening the gate is what "resuming a guest thread" physically means.

use rsevents::{Awaitable, EventState, ManualResetEvent};
use std::sync::atomic::{AtomicBool, Ordering};

/// Blocking gate between a host thread and its guest thread's runnable
/// state.
///
/// Manual-reset semantics: `signal` leaves the gate open until an explicit
/// `reset`, so a wake that lands before the wait does is never lost. Once
/// `mark_exiting` has been called the gate can no longer hold its thread:
/// every subsequent `wait` returns immediately, letting a terminating host
/// thread unwind out of the scheduler without ever parking again.
pub struct ExecutionGate {
    event: ManualResetEvent,
    exiting: AtomicBool,
}

impl ExecutionGate {
    /// Creates a closed gate
    pub fn new() -> Self {
        Self {
            event: ManualResetEvent::new(EventState::Unset),
            exiting: AtomicBool::new(false),
        }
    }

    /// Parks the calling host thread until the gate is opened.
    pub fn wait(&self) {
        if self.exiting.load(Ordering::Acquire) {
            return;
        }
        self.event.wait();
    }

    /// Opens the gate, releasing a parked host thread (or letting the next
    /// `wait` pass straight through).
    pub fn signal(&self) {
        self.event.set();
    }

    /// Closes the gate so the next `wait` parks.
    pub fn reset(&self) {
        self.event.reset();
    }

    /// Marks the backing thread as exiting and permanently opens the gate.
    pub fn mark_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
        self.event.set();
    }

    /// True once `mark_exiting` has been called
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }
}

impl Default for ExecutionGate {
    fn default() -> Self {
        Self::new()
    }
}
