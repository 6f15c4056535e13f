//! Multi-object wait/signal coordination.
//!
//! The ordering contract that makes this correct: the already-signaled
//! check, waiter registration and the transition to Paused all happen
//! under the scheduling lock, and the host thread only parks after that
//! lock is released. A signal arriving between check and park finds the
//! thread registered and wakes it; the wake-before-park race is absorbed
//! by the gate's manual-reset semantics.

use crate::thread::RunState;
use crate::trace::SchedulingEvent;
use crate::{Kernel, KernelState};
use kernel_types::{KernelError, KernelResult, ObjectId, ThreadId, Timeout};
use log::trace;

/// Most wait objects a single call may pass.
pub const MAX_WAIT_OBJECTS: usize = 64;

/// A waitable kernel object: a signaled flag plus its registered waiters.
///
/// Thread exit objects are built on this; the syscall layer builds events
/// and other waitables on top through the create/signal/reset surface.
pub(crate) struct SyncObject {
    pub name: String,
    pub signaled: bool,
    pub waiters: Vec<ThreadId>,
}

impl KernelState {
    pub(crate) fn create_object(&mut self, name: String) -> ObjectId {
        self.next_object_id += 1;
        let id = ObjectId::from_raw(self.next_object_id);
        self.objects.insert(
            id,
            SyncObject {
                name,
                signaled: false,
                waiters: Vec::new(),
            },
        );
        id
    }

    /// Marks an object signaled and wakes every paused sync-waiter
    /// registered on it. Selection happens later, on lock release.
    pub(crate) fn signal_object_locked(&mut self, object: ObjectId) {
        let waiters = {
            let obj = self.objects.get_mut(&object).expect("unknown sync object");
            obj.signaled = true;
            obj.waiters.clone()
        };
        for waiter in waiters {
            let t = self.thread(waiter);
            if t.run_state == RunState::Paused && t.waiting_sync {
                self.thread_mut(waiter).signaled_object = Some(object);
                self.wake_thread(waiter, None);
            }
        }
    }
}

impl Kernel {
    /// Creates a fresh unsignaled waitable object.
    pub fn create_sync_object(&self, name: &str) -> ObjectId {
        self.enter();
        let id = {
            let mut st = self.state.lock();
            st.create_object(name.to_string())
        };
        self.leave(None);
        id
    }

    /// Signals an object, waking all its current waiters.
    pub fn signal_object(&self, object: ObjectId) -> KernelResult<()> {
        self.enter();
        let result = {
            let mut st = self.state.lock();
            if st.objects.contains_key(&object) {
                st.signal_object_locked(object);
                Ok(())
            } else {
                Err(KernelError::InvalidHandle)
            }
        };
        self.leave(None);
        result
    }

    /// Clears an object's signaled flag.
    pub fn reset_sync_object(&self, object: ObjectId) -> KernelResult<()> {
        self.enter();
        let result = {
            let mut st = self.state.lock();
            match st.objects.get_mut(&object) {
                Some(obj) => {
                    obj.signaled = false;
                    Ok(())
                }
                None => Err(KernelError::InvalidHandle),
            }
        };
        self.leave(None);
        result
    }

    /// Blocks the caller until one of `objects` signals, a timeout
    /// elapses, the wait is cancelled, or the thread is asked to
    /// terminate. On success returns the index of the signaled object.
    ///
    /// An object that is already signaled completes the wait immediately;
    /// the caller never enters the paused state. A `Poll` timeout reports
    /// `Timeout` without blocking (checked after the signaled scan, so a
    /// ready object still wins).
    pub fn wait_synchronization(
        &self,
        caller: ThreadId,
        objects: &[ObjectId],
        timeout: Timeout,
    ) -> KernelResult<usize> {
        if objects.len() > MAX_WAIT_OBJECTS {
            return Err(KernelError::CountOutOfRange);
        }

        self.enter();
        let early: Option<KernelResult<usize>> = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller)
                || objects.iter().any(|o| !st.objects.contains_key(o))
            {
                Some(Err(KernelError::InvalidHandle))
            } else if st.thread(caller).termination_requested {
                Some(Err(KernelError::ThreadTerminating))
            } else if let Some(index) = objects.iter().position(|o| st.objects[o].signaled) {
                Some(Ok(index))
            } else if timeout.is_poll() {
                Some(Err(KernelError::Timeout))
            } else if st.thread(caller).cancel_pending {
                st.thread_mut(caller).cancel_pending = false;
                Some(Err(KernelError::Cancelled))
            } else {
                for object in objects {
                    st.objects
                        .get_mut(object)
                        .expect("validated above")
                        .waiters
                        .push(caller);
                }
                let t = st.thread_mut(caller);
                t.wait_objects = objects.to_vec();
                t.waiting_sync = true;
                t.signaled_object = None;
                t.sync_result = None;
                st.set_requested_state(caller, RunState::Paused);
                if let Timeout::After(after) = timeout {
                    self.timeouts.register(caller, after);
                }
                None
            }
        };
        if let Some(result) = early {
            self.leave(None);
            return result;
        }

        // genuine suspension point
        self.leave(Some(caller));

        self.enter();
        self.timeouts.cancel(caller);
        let result = {
            let mut st = self.state.lock();
            let registered = std::mem::take(&mut st.thread_mut(caller).wait_objects);
            for object in &registered {
                if let Some(obj) = st.objects.get_mut(object) {
                    obj.waiters.retain(|&t| t != caller);
                }
            }
            st.thread_mut(caller).waiting_sync = false;
            match st.thread_mut(caller).signaled_object.take() {
                Some(signaled) => match registered.iter().position(|&o| o == signaled) {
                    Some(index) => Ok(index),
                    None => Err(KernelError::InvalidState),
                },
                None => {
                    let error = st
                        .thread_mut(caller)
                        .sync_result
                        .take()
                        .unwrap_or(KernelError::InvalidState);
                    Err(error)
                }
            }
        };
        self.leave(Some(caller));
        if let Err(err) = &result {
            trace!("wait_synchronization for {caller} ended with {err}");
        }
        result
    }

    /// Cancels a thread's in-progress or upcoming synchronization wait.
    pub fn cancel_synchronization(&self, target: ThreadId) -> KernelResult<()> {
        self.enter();
        let result = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&target) {
                Err(KernelError::InvalidHandle)
            } else {
                let (paused, in_sync_wait, in_list_wait) = {
                    let t = st.thread(target);
                    (
                        t.run_state == RunState::Paused,
                        t.waiting_sync,
                        t.condvar_address.is_some()
                            || t.arbiter_address.is_some()
                            || t.mutex_owner.is_some(),
                    )
                };
                if paused && in_sync_wait {
                    st.thread_mut(target).signaled_object = None;
                    st.wake_thread(target, Some(KernelError::Cancelled));
                } else if paused && in_list_wait {
                    st.abort_wait(target, KernelError::Cancelled);
                } else {
                    // not blocked yet: the flag is consumed at the next
                    // blocking attempt
                    st.thread_mut(target).cancel_pending = true;
                }
                Ok(())
            }
        };
        self.leave(None);
        result
    }

    /// Wake-on-timeout entry, invoked by the timeout worker.
    pub(crate) fn on_wait_timeout(&self, target: ThreadId) {
        self.enter();
        {
            let mut st = self.state.lock();
            if st.threads.contains_key(&target) && st.thread(target).run_state == RunState::Paused
            {
                st.record_event(SchedulingEvent::TimeoutFired { thread: target });
                st.abort_wait(target, KernelError::Timeout);
                trace!("timeout woke {target}");
            }
        }
        self.leave(None);
    }
}
