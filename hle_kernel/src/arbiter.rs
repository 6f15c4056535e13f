//! Address arbitration: guest user-space mutexes, condition variables and
//! futex-style address waits.
//!
//! Every store to a guest word goes through an exclusive-monitor retry
//! loop: take the monitor, read, attempt the conditional store, start over
//! if guest code raced us. The loop touches only guest memory — never
//! scheduler state — so contention on a word can delay the arbitrating
//! core but cannot corrupt scheduling.

use crate::thread::RunState;
use crate::{Kernel, KernelState};
use guest_hal::{GuestMemory, MemoryError};
use kernel_types::{
    CoreId, Handle, KernelError, KernelResult, ThreadId, Timeout, HANDLE_HAS_LISTENERS,
};
use log::trace;
use serde::{Deserialize, Serialize};

/// Condition evaluated by a `wait_for_address` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArbitrationType {
    /// Block if the word is less than the expected value
    WaitIfLessThan,
    /// Block if less than, atomically decrementing the word first
    DecrementAndWaitIfLessThan,
    /// Block if the word equals the expected value
    WaitIfEqual,
}

/// Word update performed by a `signal_to_address` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    /// Wake without touching the word
    Signal,
    /// Require the word to equal the expected value and increment it
    IncrementAndSignalIfEqual,
    /// Require equality, then increment, decrement or keep the word based
    /// on how many waiters the wake count covers
    ModifyByWaitingCountAndSignalIfEqual,
}

enum MonitorWrite {
    /// The conditional store landed; `old` is the value it replaced
    Done { old: u32 },
    /// The closure declined to write; `value` is what it saw
    Skipped { value: u32 },
}

/// Load-linked/store-conditional loop over a guest word.
fn monitored_update<F>(
    memory: &dyn GuestMemory,
    core: CoreId,
    addr: u64,
    mut f: F,
) -> Result<MonitorWrite, MemoryError>
where
    F: FnMut(u32) -> Option<u32>,
{
    loop {
        memory.set_exclusive(core, addr);
        let value = memory.read_word(addr)?;
        match f(value) {
            None => {
                memory.clear_exclusive(core);
                return Ok(MonitorWrite::Skipped { value });
            }
            Some(next) => {
                if memory.write_word_conditional(core, addr, next) {
                    return Ok(MonitorWrite::Done { old: value });
                }
                // monitor lost: reread and retry
            }
        }
    }
}

fn monitor_core(st: &KernelState, caller: ThreadId) -> CoreId {
    let t = st.thread(caller);
    t.current_core.unwrap_or(t.preferred_core)
}

fn check_word_address(memory: &dyn GuestMemory, addr: u64) -> KernelResult<()> {
    if addr % 4 != 0 {
        return Err(KernelError::InvalidAddress);
    }
    if !memory.is_mapped(addr) {
        return Err(KernelError::NoAccessPerm);
    }
    Ok(())
}

impl KernelState {
    /// Releases the guest mutex at `addr` held by `owner`: picks the new
    /// owner, writes the word, and wakes the winner. Shared by
    /// `arbitrate_unlock` and the atomic unlock half of a condvar wait.
    fn unlock_guest_mutex(
        &mut self,
        memory: &dyn GuestMemory,
        owner: ThreadId,
        addr: u64,
    ) -> KernelResult<()> {
        let (new_owner, count) = self.relinquish_mutex(owner, addr);
        let new_value = match new_owner {
            None => 0,
            Some(winner) => {
                let handle = self.thread(winner).mutex_wait_handle;
                if count >= 2 {
                    handle.with_listeners()
                } else {
                    handle.as_raw()
                }
            }
        };
        let core = monitor_core(self, owner);
        match monitored_update(memory, core, addr, |_| Some(new_value)) {
            Err(err) => Err(err.into()),
            Ok(_) => {
                if let Some(winner) = new_owner {
                    self.thread_mut(winner).mutex_address = 0;
                    self.wake_thread(winner, None);
                }
                Ok(())
            }
        }
    }

    /// Lets a condvar wake-up contend for its recorded mutex. The waiter
    /// either grabs an unowned mutex and wakes, or re-queues as a mutex
    /// waiter and stays paused until the owner unlocks.
    fn contend_for_mutex(
        &mut self,
        memory: &dyn GuestMemory,
        resolver: &dyn guest_hal::HandleResolver,
        core: CoreId,
        waiter: ThreadId,
    ) {
        let addr = self.thread(waiter).mutex_address;
        let handle = self.thread(waiter).mutex_wait_handle;
        let grab = monitored_update(memory, core, addr, |value| {
            if value == 0 {
                Some(handle.as_raw())
            } else if value & HANDLE_HAS_LISTENERS == 0 {
                Some(value | HANDLE_HAS_LISTENERS)
            } else {
                None
            }
        });
        match grab {
            Err(err) => self.wake_thread(waiter, Some(err.into())),
            Ok(MonitorWrite::Done { old: 0 }) => {
                // the mutex was free; the waiter owns it now
                self.thread_mut(waiter).mutex_address = 0;
                self.wake_thread(waiter, None);
            }
            Ok(MonitorWrite::Done { old }) | Ok(MonitorWrite::Skipped { value: old }) => {
                let owner_handle = Handle::from_raw(old).without_listeners();
                match resolver.resolve_thread_handle(owner_handle) {
                    Some(owner) if self.threads.contains_key(&owner) => {
                        self.add_mutex_waiter(owner, waiter);
                    }
                    _ => self.wake_thread(waiter, Some(KernelError::InvalidHandle)),
                }
            }
        }
    }
}

impl Kernel {
    /// Guest-side mutex lock fell through to the kernel: block the caller
    /// until the owner hands the mutex over.
    ///
    /// Succeeds without blocking when the word no longer encodes
    /// `owner_handle | HAS_LISTENERS` — the owner got there first and the
    /// guest retry loop will re-examine the word.
    pub fn arbitrate_lock(
        &self,
        caller: ThreadId,
        owner_handle: Handle,
        mutex_addr: u64,
        requester_handle: Handle,
    ) -> KernelResult<()> {
        check_word_address(self.memory.as_ref(), mutex_addr)?;

        self.enter();
        let early: Option<KernelResult<()>> = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                Some(Err(KernelError::InvalidHandle))
            } else if st.thread(caller).termination_requested {
                Some(Err(KernelError::ThreadTerminating))
            } else {
                match self.memory.read_word(mutex_addr) {
                    Err(err) => Some(Err(err.into())),
                    Ok(value) if value != owner_handle.with_listeners() => Some(Ok(())),
                    Ok(_) => match self.handles.resolve_thread_handle(owner_handle) {
                        Some(owner) if st.threads.contains_key(&owner) => {
                            {
                                let t = st.thread_mut(caller);
                                t.mutex_address = mutex_addr;
                                t.mutex_wait_handle = requester_handle;
                                t.sync_result = None;
                            }
                            st.add_mutex_waiter(owner, caller);
                            st.set_requested_state(caller, RunState::Paused);
                            None
                        }
                        _ => Some(Err(KernelError::InvalidHandle)),
                    },
                }
            }
        };
        if let Some(result) = early {
            self.leave(None);
            return result;
        }

        // blocks until the unlock path hands us the mutex
        self.leave(Some(caller));

        self.enter();
        let result = {
            let mut st = self.state.lock();
            match st.thread_mut(caller).sync_result.take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        };
        self.leave(Some(caller));
        result
    }

    /// Releases the guest mutex at `mutex_addr` on behalf of the caller,
    /// handing it to the most urgent waiter.
    pub fn arbitrate_unlock(&self, caller: ThreadId, mutex_addr: u64) -> KernelResult<()> {
        check_word_address(self.memory.as_ref(), mutex_addr)?;

        self.enter();
        let result = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                Err(KernelError::InvalidHandle)
            } else {
                st.unlock_guest_mutex(self.memory.as_ref(), caller, mutex_addr)
            }
        };
        self.leave(Some(caller));
        result
    }

    /// Atomically unlocks `mutex_addr` and parks the caller on the
    /// process-wide condition variable keyed by `condvar_addr`.
    pub fn wait_process_wide_key_atomic(
        &self,
        caller: ThreadId,
        mutex_addr: u64,
        condvar_addr: u64,
        requester_handle: Handle,
        timeout: Timeout,
    ) -> KernelResult<()> {
        check_word_address(self.memory.as_ref(), mutex_addr)?;

        self.enter();
        let early: Option<KernelResult<()>> = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                Some(Err(KernelError::InvalidHandle))
            } else if st.thread(caller).termination_requested {
                Some(Err(KernelError::ThreadTerminating))
            } else if st.thread(caller).cancel_pending {
                st.thread_mut(caller).cancel_pending = false;
                Some(Err(KernelError::Cancelled))
            } else if let Err(err) = st.unlock_guest_mutex(self.memory.as_ref(), caller, mutex_addr)
            {
                Some(Err(err))
            } else if timeout.is_poll() {
                Some(Err(KernelError::Timeout))
            } else {
                {
                    let t = st.thread_mut(caller);
                    t.condvar_address = Some(condvar_addr);
                    t.mutex_address = mutex_addr;
                    t.mutex_wait_handle = requester_handle;
                    t.sync_result = None;
                }
                let priority = st.thread(caller).dynamic_priority;
                let position = st.urgency_insert_position(&st.condvar_waiters, priority);
                st.condvar_waiters.insert(position, caller);
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

        self.leave(Some(caller));

        self.enter();
        self.timeouts.cancel(caller);
        let result = {
            let mut st = self.state.lock();
            if st.thread(caller).condvar_address.is_some() {
                st.condvar_waiters.retain(|&t| t != caller);
                st.thread_mut(caller).condvar_address = None;
            }
            match st.thread_mut(caller).sync_result.take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        };
        self.leave(Some(caller));
        if let Err(err) = &result {
            trace!("condvar wait for {caller} ended with {err}");
        }
        result
    }

    /// Wakes up to `count` waiters of the condition variable at
    /// `condvar_addr` (count <= 0 wakes all), most urgent first. Every
    /// woken waiter re-contends for its recorded mutex before it is
    /// allowed to run.
    pub fn signal_process_wide_key(
        &self,
        caller: ThreadId,
        condvar_addr: u64,
        count: i32,
    ) -> KernelResult<()> {
        self.enter();
        let result = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                Err(KernelError::InvalidHandle)
            } else {
                // the global list is urgency-sorted; filtering preserves order
                let matching: Vec<ThreadId> = st
                    .condvar_waiters
                    .iter()
                    .copied()
                    .filter(|&t| st.thread(t).condvar_address == Some(condvar_addr))
                    .collect();
                let wake = if count <= 0 {
                    matching.len()
                } else {
                    matching.len().min(count as usize)
                };
                let core = monitor_core(&st, caller);
                for &waiter in &matching[..wake] {
                    st.condvar_waiters.retain(|&t| t != waiter);
                    st.thread_mut(waiter).condvar_address = None;
                    st.contend_for_mutex(
                        self.memory.as_ref(),
                        self.handles.as_ref(),
                        core,
                        waiter,
                    );
                }
                Ok(())
            }
        };
        self.leave(Some(caller));
        result
    }

    /// Blocks the caller on `addr` if the word passes the arbitration
    /// condition; otherwise reports `InvalidState`.
    pub fn wait_for_address(
        &self,
        caller: ThreadId,
        addr: u64,
        arbitration: ArbitrationType,
        value: i32,
        timeout: Timeout,
    ) -> KernelResult<()> {
        check_word_address(self.memory.as_ref(), addr)?;

        self.enter();
        let early: Option<KernelResult<()>> = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                Some(Err(KernelError::InvalidHandle))
            } else if st.thread(caller).termination_requested {
                Some(Err(KernelError::ThreadTerminating))
            } else if st.thread(caller).cancel_pending {
                st.thread_mut(caller).cancel_pending = false;
                Some(Err(KernelError::Cancelled))
            } else {
                let core = monitor_core(&st, caller);
                let condition = match arbitration {
                    ArbitrationType::WaitIfEqual => self
                        .memory
                        .read_word(addr)
                        .map(|word| word as i32 == value)
                        .map_err(KernelError::from),
                    ArbitrationType::WaitIfLessThan => self
                        .memory
                        .read_word(addr)
                        .map(|word| (word as i32) < value)
                        .map_err(KernelError::from),
                    ArbitrationType::DecrementAndWaitIfLessThan => {
                        match monitored_update(self.memory.as_ref(), core, addr, |word| {
                            if (word as i32) < value {
                                Some((word as i32).wrapping_sub(1) as u32)
                            } else {
                                None
                            }
                        }) {
                            Err(err) => Err(err.into()),
                            Ok(MonitorWrite::Done { .. }) => Ok(true),
                            Ok(MonitorWrite::Skipped { .. }) => Ok(false),
                        }
                    }
                };
                match condition {
                    Err(err) => Some(Err(err)),
                    Ok(false) => Some(Err(KernelError::InvalidState)),
                    Ok(true) if timeout.is_poll() => Some(Err(KernelError::Timeout)),
                    Ok(true) => {
                        {
                            let t = st.thread_mut(caller);
                            t.arbiter_address = Some(addr);
                            t.sync_result = None;
                        }
                        let priority = st.thread(caller).dynamic_priority;
                        let position = st.urgency_insert_position(&st.arbiter_waiters, priority);
                        st.arbiter_waiters.insert(position, caller);
                        st.set_requested_state(caller, RunState::Paused);
                        if let Timeout::After(after) = timeout {
                            self.timeouts.register(caller, after);
                        }
                        None
                    }
                }
            }
        };
        if let Some(result) = early {
            self.leave(None);
            return result;
        }

        self.leave(Some(caller));

        self.enter();
        self.timeouts.cancel(caller);
        let result = {
            let mut st = self.state.lock();
            if st.thread(caller).arbiter_address.is_some() {
                st.arbiter_waiters.retain(|&t| t != caller);
                st.thread_mut(caller).arbiter_address = None;
            }
            match st.thread_mut(caller).sync_result.take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        };
        self.leave(Some(caller));
        result
    }

    /// Wakes up to `count` threads waiting on `addr` (count <= 0 wakes
    /// all), optionally updating the word first.
    pub fn signal_to_address(
        &self,
        caller: ThreadId,
        addr: u64,
        signal: SignalType,
        value: i32,
        count: i32,
    ) -> KernelResult<()> {
        check_word_address(self.memory.as_ref(), addr)?;

        self.enter();
        let result = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                Err(KernelError::InvalidHandle)
            } else {
                let waiting: Vec<ThreadId> = st
                    .arbiter_waiters
                    .iter()
                    .copied()
                    .filter(|&t| st.thread(t).arbiter_address == Some(addr))
                    .collect();
                let wake = if count <= 0 {
                    waiting.len()
                } else {
                    waiting.len().min(count as usize)
                };
                let core = monitor_core(&st, caller);

                let update: KernelResult<()> = match signal {
                    SignalType::Signal => Ok(()),
                    SignalType::IncrementAndSignalIfEqual => {
                        match monitored_update(self.memory.as_ref(), core, addr, |word| {
                            if word as i32 == value {
                                Some(value.wrapping_add(1) as u32)
                            } else {
                                None
                            }
                        }) {
                            Err(err) => Err(err.into()),
                            Ok(MonitorWrite::Done { .. }) => Ok(()),
                            Ok(MonitorWrite::Skipped { .. }) => Err(KernelError::InvalidState),
                        }
                    }
                    SignalType::ModifyByWaitingCountAndSignalIfEqual => {
                        let waiting_count = waiting.len() as i32;
                        let delta = if waiting_count > 0 && (waiting_count <= count || count <= 0)
                        {
                            -1
                        } else if waiting_count == 0 {
                            1
                        } else {
                            0
                        };
                        let mut matched = false;
                        match monitored_update(self.memory.as_ref(), core, addr, |word| {
                            if word as i32 == value {
                                matched = true;
                                if delta != 0 {
                                    Some(value.wrapping_add(delta) as u32)
                                } else {
                                    None
                                }
                            } else {
                                matched = false;
                                None
                            }
                        }) {
                            Err(err) => Err(err.into()),
                            Ok(MonitorWrite::Done { .. }) => Ok(()),
                            Ok(MonitorWrite::Skipped { .. }) => {
                                if matched {
                                    Ok(())
                                } else {
                                    Err(KernelError::InvalidState)
                                }
                            }
                        }
                    }
                };

                match update {
                    Err(err) => Err(err),
                    Ok(()) => {
                        for &waiter in &waiting[..wake] {
                            st.arbiter_waiters.retain(|&t| t != waiter);
                            st.thread_mut(waiter).arbiter_address = None;
                            st.wake_thread(waiter, None);
                        }
                        Ok(())
                    }
                }
            }
        };
        self.leave(Some(caller));
        result
    }
}
