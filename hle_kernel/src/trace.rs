//! Scheduling event trace.
//!
//! Optional in-memory record of scheduling decisions, in the spirit of an
//! audit log: tests and debug tooling enable it to assert on *why* the
//! scheduler did what it did, not just on the end state. Off by default;
//! recording is a no-op unless enabled.

use kernel_types::{CoreId, ThreadId};
use serde::{Deserialize, Serialize};

/// A single scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingEvent {
    /// A thread was picked (or the core was left idle) during selection
    ThreadSelected {
        core: CoreId,
        thread: Option<ThreadId>,
    },
    /// A context switch took effect on a core
    ContextSwitched {
        core: CoreId,
        from: Option<ThreadId>,
        to: Option<ThreadId>,
    },
    /// The periodic preemption pass rotated a priority band
    PriorityRotated { core: CoreId, priority: u32 },
    /// A thread was migrated to another core by load balancing
    ThreadMigrated {
        thread: ThreadId,
        to: Option<CoreId>,
    },
    /// A registered timeout fired and woke its thread
    TimeoutFired { thread: ThreadId },
}

/// Bounded event buffer. Oldest events are dropped once full so a
/// long-running session cannot grow without bound.
#[derive(Debug, Default)]
pub struct EventTrace {
    events: std::collections::VecDeque<SchedulingEvent>,
}

const TRACE_CAPACITY: usize = 4096;

impl EventTrace {
    /// Creates an empty trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event, evicting the oldest if at capacity
    pub fn record(&mut self, event: SchedulingEvent) {
        if self.events.len() == TRACE_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Drains and returns all recorded events
    pub fn take(&mut self) -> Vec<SchedulingEvent> {
        self.events.drain(..).collect()
    }
}
