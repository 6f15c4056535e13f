//! Handle resolution contract.
//!
//! Handle tables (and the capability checks behind them) belong to the
//! process-management collaborator. The scheduling core only ever needs to
//! turn a guest thread handle into a thread identifier.

use kernel_types::{Handle, ThreadId};

/// Resolves guest handles to thread identifiers.
pub trait HandleResolver: Send + Sync {
    /// Resolves a thread handle, or `None` if the handle is dead or does
    /// not name a thread. The listeners flag is ignored by resolution.
    fn resolve_thread_handle(&self, handle: Handle) -> Option<ThreadId>;
}

/// Flat handle table for tests.
#[derive(Default)]
pub struct SimHandleTable {
    entries: parking_lot::Mutex<std::collections::HashMap<u32, ThreadId>>,
}

impl SimHandleTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handle` to `thread`
    pub fn insert(&self, handle: Handle, thread: ThreadId) {
        self.entries
            .lock()
            .insert(handle.without_listeners().as_raw(), thread);
    }

    /// Removes a binding
    pub fn remove(&self, handle: Handle) {
        self.entries.lock().remove(&handle.without_listeners().as_raw());
    }
}

impl HandleResolver for SimHandleTable {
    fn resolve_thread_handle(&self, handle: Handle) -> Option<ThreadId> {
        self.entries
            .lock()
            .get(&handle.without_listeners().as_raw())
            .copied()
    }
}
