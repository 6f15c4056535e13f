//! Wake-after-deadline management.
//!
//! One background worker sleeps until the earliest registered deadline (or
//! until a registration changes the picture) and hands expired targets to
//! the wake callback, which re-enters the kernel and resolves the wait
//! with a timeout result. Outstanding entries are few, so registration and
//! cancellation are plain O(n) scans under a dedicated lock — never the
//! scheduling lock.

use kernel_types::{Duration, Instant, ThreadId};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct TimeoutEntry {
    target: ThreadId,
    deadline: Instant,
}

struct TimeoutShared {
    entries: Mutex<Vec<TimeoutEntry>>,
    signal: Condvar,
    shutdown: AtomicBool,
    epoch: std::time::Instant,
}

impl TimeoutShared {
    fn now(&self) -> Instant {
        Instant::from_nanos(self.epoch.elapsed().as_nanos() as u64)
    }
}

/// Background timer for wait deadlines.
pub(crate) struct TimeoutManager {
    shared: Arc<TimeoutShared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl TimeoutManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimeoutShared {
                entries: Mutex::new(Vec::new()),
                signal: Condvar::new(),
                shutdown: AtomicBool::new(false),
                epoch: std::time::Instant::now(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker loop. `wake` is invoked outside all timer locks
    /// for every expired target.
    pub fn start<F>(&self, wake: F)
    where
        F: Fn(ThreadId) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("kern.timeout".into())
            .spawn(move || worker_loop(&shared, wake))
            .expect("failed to spawn timeout worker");
        *self.worker.lock() = Some(handle);
    }

    /// Schedules `target` to be woken `after` from now.
    pub fn register(&self, target: ThreadId, after: Duration) {
        let deadline = self.shared.now() + after;
        self.shared.entries.lock().push(TimeoutEntry { target, deadline });
        self.shared.signal.notify_one();
    }

    /// Removes any entry for `target`. Safe to call whether or not an
    /// entry exists or has already fired; wake paths call this
    /// unconditionally.
    pub fn cancel(&self, target: ThreadId) {
        self.shared.entries.lock().retain(|e| e.target != target);
    }
}

fn worker_loop<F>(shared: &TimeoutShared, wake: F)
where
    F: Fn(ThreadId),
{
    let mut entries = shared.entries.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let now = shared.now();

        let mut expired = Vec::new();
        entries.retain(|entry| {
            if entry.deadline <= now {
                expired.push(*entry);
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            // fire in deadline order, outside the entry lock
            expired.sort_by_key(|e| e.deadline);
            drop(entries);
            for entry in expired {
                wake(entry.target);
            }
            entries = shared.entries.lock();
            continue;
        }

        match entries.iter().map(|e| e.deadline).min() {
            None => {
                shared.signal.wait(&mut entries);
            }
            Some(earliest) => {
                let remaining = earliest.duration_since(now).to_std();
                let _ = shared.signal.wait_for(&mut entries, remaining);
            }
        }
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.signal.notify_one();
        if let Some(handle) = self.worker.lock().take() {
            // the worker itself can hold the last kernel reference; a
            // self-join would never return
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_expired_targets_fire_in_deadline_order() {
        let manager = TimeoutManager::new();
        let fired = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        manager.start(move |t| sink.lock().unwrap().push(t));

        manager.register(ThreadId::from_raw(2), Duration::from_millis(30));
        manager.register(ThreadId::from_raw(1), Duration::from_millis(10));

        std::thread::sleep(std::time::Duration::from_millis(120));
        assert_eq!(
            *fired.lock().unwrap(),
            vec![ThreadId::from_raw(1), ThreadId::from_raw(2)]
        );
    }

    #[test]
    fn test_cancel_is_idempotent_and_prevents_firing() {
        let manager = TimeoutManager::new();
        let fired = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        manager.start(move |t| sink.lock().unwrap().push(t));

        let target = ThreadId::from_raw(7);
        manager.register(target, Duration::from_millis(20));
        manager.cancel(target);
        manager.cancel(target);
        // cancelling a never-registered target is also fine
        manager.cancel(ThreadId::from_raw(99));

        std::thread::sleep(std::time::Duration::from_millis(80));
        assert!(fired.lock().unwrap().is_empty());
    }
}
