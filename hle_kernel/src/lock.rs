//! The global scheduling lock ("critical section").
//!
//! One recursive lock guards every piece of scheduler state. Recursion is
//! tracked with an explicit owner + depth pair rather than a guard type
//! because releases are not lexically scoped: the outermost release runs
//! thread selection, drops the lock, and only then performs the physical
//! context switch — possibly parking the very host thread that released.

use parking_lot::{Condvar, Mutex};
use std::thread::ThreadId as HostThreadId;

#[derive(Debug)]
struct LockState {
    owner: Option<HostThreadId>,
    depth: u32,
}

/// Recursive mutex keyed by host thread.
///
/// Reentries always occur on the host thread that already holds the lock
/// (the guest thread identity may differ between reentries; that does not
/// matter here), so host-thread ownership is the correct recursion key.
pub(crate) struct CriticalSection {
    state: Mutex<LockState>,
    released: Condvar,
}

impl CriticalSection {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                depth: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Acquires the lock, or bumps the recursion depth on reentry.
    pub fn enter(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    /// Unwinds one level of recursion.
    ///
    /// Returns `false` while inner levels remain. Returns `true` when this
    /// call took the depth to its outermost level — the lock is *still
    /// held* at that point; the caller must run its pre-release work and
    /// then call [`release`](Self::release).
    pub fn begin_release(&self) -> bool {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        assert_eq!(state.owner, Some(me), "critical section released by non-owner");
        if state.depth > 1 {
            state.depth -= 1;
            return false;
        }
        true
    }

    /// Fully releases the lock after `begin_release` returned `true`.
    pub fn release(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        assert_eq!(state.owner, Some(me), "critical section released by non-owner");
        state.owner = None;
        state.depth = 0;
        drop(state);
        self.released.notify_one();
    }
}
