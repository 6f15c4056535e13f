//! # HLE Kernel Scheduling Core
//!
//! High-level emulation of the guest OS kernel's scheduler and
//! synchronization primitives. Guest instructions run on host threads; this
//! crate reproduces the concurrency semantics the guest kernel would give
//! them — 4-core priority scheduling, priority-inheriting mutexes,
//! condition variables, address arbitration and timeouts — so guest
//! software observes kernel-compatible ordering and fairness.
//!
//! ## Design
//!
//! - **One lock, one owner**: every piece of scheduler state is mutated
//!   under the recursive scheduling lock. Logically the scheduler is
//!   single-threaded; host parallelism resumes only after the lock is
//!   released and gates are opened.
//! - **Switch on release**: the outermost lock release is the single point
//!   where selection runs and context switches take effect. Everything
//!   else is queue bookkeeping.
//! - **No ambient state**: all state hangs off the [`Kernel`] value;
//!   collaborators (guest memory, handle tables, interrupt delivery) are
//!   trait objects passed at construction.
//! - **Inspectable**: thread snapshots and an optional scheduling event
//!   trace expose decisions to tests and debug tooling.

pub mod arbiter;
pub mod gate;
pub mod queues;
pub mod thread;
pub mod trace;
pub mod wait;

mod lock;
mod scheduler;
mod timeout;

pub use arbiter::{ArbitrationType, SignalType};
pub use thread::{ForcePause, RunState};
pub use trace::SchedulingEvent;
pub use wait::MAX_WAIT_OBJECTS;

use guest_hal::{GuestMemory, HandleResolver, InterruptSink};
use kernel_types::{
    CoreId, KernelError, KernelResult, ObjectId, ThreadId, CORE_COUNT, PRIORITY_COUNT,
};
use lock::CriticalSection;
use parking_lot::{Condvar, Mutex};
use scheduler::CoreContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thread::Thread;
use timeout::TimeoutManager;
use wait::SyncObject;

/// How guest threads map onto host threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One host thread may run per virtual core, in true parallel
    Parallel,
    /// A single host thread executes all cores, time-sliced
    TimeSliced,
}

/// Requested activity for `set_thread_activity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadActivity {
    Runnable,
    Paused,
}

/// Host-side preemption cadence for the round-robin bands.
const PREEMPTION_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

/// Read-only snapshot of one thread's scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub base_priority: u32,
    pub dynamic_priority: u32,
    pub affinity_mask: u64,
    pub preferred_core: usize,
    pub current_core: Option<usize>,
    pub run_state: RunState,
}

/// All mutable scheduler state, guarded by the scheduling lock.
pub(crate) struct KernelState {
    pub(crate) threads: HashMap<ThreadId, Thread>,
    next_thread_id: u64,
    pub(crate) queues: queues::SchedulingQueues,
    pub(crate) cores: [CoreContext; CORE_COUNT],
    pub(crate) reselection_needed: bool,
    /// Condvar waiters across all keys, urgency-sorted
    pub(crate) condvar_waiters: Vec<ThreadId>,
    /// Address-arbiter waiters across all addresses, urgency-sorted
    pub(crate) arbiter_waiters: Vec<ThreadId>,
    pub(crate) objects: HashMap<ObjectId, SyncObject>,
    pub(crate) next_object_id: u64,
    /// The one thread whose gate is open in time-sliced mode
    pub(crate) active_thread: Option<ThreadId>,
    pub(crate) last_switch_core: usize,
    /// Logical switch counter backing `last_scheduled_tick`
    pub(crate) tick: u64,
    pub(crate) trace: Option<trace::EventTrace>,
}

impl KernelState {
    pub(crate) fn new() -> Self {
        Self {
            threads: HashMap::new(),
            next_thread_id: 0,
            queues: queues::SchedulingQueues::new(),
            cores: Default::default(),
            reselection_needed: false,
            condvar_waiters: Vec::new(),
            arbiter_waiters: Vec::new(),
            objects: HashMap::new(),
            next_object_id: 0,
            active_thread: None,
            last_switch_core: 0,
            tick: 0,
            trace: None,
        }
    }

    pub(crate) fn insert_thread(
        &mut self,
        name: String,
        priority: u32,
        preferred_core: CoreId,
        affinity_mask: u64,
    ) -> ThreadId {
        self.next_thread_id += 1;
        let id = ThreadId::from_raw(self.next_thread_id);
        let exit_object = self.create_object(format!("{name}.exit"));
        let thread = Thread::new(id, name, priority, preferred_core, affinity_mask, exit_object);
        self.threads.insert(id, thread);
        id
    }

    pub(crate) fn record_event(&mut self, event: SchedulingEvent) {
        if let Some(trace) = self.trace.as_mut() {
            trace.record(event);
        }
    }
}

/// The scheduling/synchronization core.
///
/// Construct with [`Kernel::new`]; every syscall-layer operation is a
/// method taking the calling guest thread explicitly. Host threads backing
/// guest threads enter through [`Kernel::begin_execution`].
pub struct Kernel {
    pub(crate) mode: ExecutionMode,
    cs: CriticalSection,
    pub(crate) state: Mutex<KernelState>,
    pub(crate) memory: Arc<dyn GuestMemory>,
    pub(crate) handles: Arc<dyn HandleResolver>,
    pub(crate) interrupts: Arc<dyn InterruptSink>,
    pub(crate) timeouts: TimeoutManager,
    ticker_stop: Arc<(Mutex<bool>, Condvar)>,
    ticker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Kernel {
    /// Builds a kernel and starts its background workers (the timeout
    /// waiter, and in parallel mode the 10 ms preemption ticker).
    pub fn new(
        mode: ExecutionMode,
        memory: Arc<dyn GuestMemory>,
        handles: Arc<dyn HandleResolver>,
        interrupts: Arc<dyn InterruptSink>,
    ) -> Arc<Self> {
        let kernel = Arc::new(Self {
            mode,
            cs: CriticalSection::new(),
            state: Mutex::new(KernelState::new()),
            memory,
            handles,
            interrupts,
            timeouts: TimeoutManager::new(),
            ticker_stop: Arc::new((Mutex::new(false), Condvar::new())),
            ticker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&kernel);
        kernel.timeouts.start(move |target| {
            if let Some(kernel) = weak.upgrade() {
                kernel.on_wait_timeout(target);
            }
        });
        if mode == ExecutionMode::Parallel {
            spawn_preemption_ticker(&kernel);
        }
        kernel
    }

    /// Acquires the scheduling lock (recursively).
    pub(crate) fn enter(&self) {
        self.cs.enter();
    }

    /// Releases one level of the scheduling lock. At the outermost level
    /// this runs thread selection while still holding the lock, releases
    /// it, and then performs the context switches the selection implied —
    /// the only point where scheduling changes become guest-visible.
    pub(crate) fn leave(&self, caller: Option<ThreadId>) {
        if !self.cs.begin_release() {
            return;
        }
        {
            let mut st = self.state.lock();
            st.select_threads();
        }
        self.cs.release();
        self.switch_after_release(caller);
    }

    // ---- thread control ------------------------------------------------

    /// Creates a guest thread in its initial (not yet started) state.
    pub fn create_thread(
        &self,
        name: &str,
        priority: u32,
        preferred_core: usize,
        affinity_mask: u64,
    ) -> KernelResult<ThreadId> {
        if priority >= PRIORITY_COUNT as u32 {
            return Err(KernelError::InvalidState);
        }
        if preferred_core >= CORE_COUNT {
            return Err(KernelError::InvalidMaskValue);
        }
        let mask = if affinity_mask == 0 {
            CoreId(preferred_core).mask_bit()
        } else {
            affinity_mask
        };
        if mask & !0b1111 != 0 || mask & CoreId(preferred_core).mask_bit() == 0 {
            return Err(KernelError::InvalidMaskValue);
        }

        self.enter();
        let id = {
            let mut st = self.state.lock();
            st.insert_thread(name.to_string(), priority, CoreId(preferred_core), mask)
        };
        self.leave(None);
        log::debug!("created thread {id} ({name}) priority {priority}");
        Ok(id)
    }

    /// Starts a created thread, making it schedulable.
    pub fn start_thread(&self, target: ThreadId) -> KernelResult<()> {
        self.enter();
        let result = {
            let mut st = self.state.lock();
            match st.threads.get(&target) {
                None => Err(KernelError::InvalidHandle),
                Some(t) if t.run_state != RunState::None => Err(KernelError::InvalidState),
                Some(_) => {
                    st.set_requested_state(target, RunState::Running);
                    st.set_force_pause(target, ForcePause::KERNEL_INIT, false);
                    Ok(())
                }
            }
        };
        self.leave(None);
        result
    }

    /// Terminates the calling thread. Its exit object signals, any threads
    /// stuck on its guest mutexes are woken with an error, and its gate is
    /// marked exiting so the backing host thread can unwind.
    pub fn exit_thread(&self, caller: ThreadId) -> KernelResult<()> {
        self.enter();
        let result = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                Err(KernelError::InvalidHandle)
            } else {
                let waiters = std::mem::take(&mut st.thread_mut(caller).mutex_waiters);
                for waiter in waiters {
                    st.thread_mut(waiter).mutex_owner = None;
                    st.wake_thread(waiter, Some(KernelError::InvalidState));
                }
                let exit_object = st.thread(caller).exit_object;
                st.set_requested_state(caller, RunState::TerminationPending);
                st.signal_object_locked(exit_object);
                st.thread(caller).gate.mark_exiting();
                Ok(())
            }
        };
        self.timeouts.cancel(caller);
        self.leave(Some(caller));
        result
    }

    /// Reclaims a terminated (or never started) thread's control block.
    pub fn destroy_thread(&self, target: ThreadId) -> KernelResult<()> {
        self.enter();
        let result = {
            let mut st = self.state.lock();
            let reclaimable = match st.threads.get(&target) {
                None => None,
                Some(t) => Some(matches!(
                    t.run_state,
                    RunState::TerminationPending | RunState::None
                )),
            };
            let on_core = st.cores.iter().any(|core| {
                core.current_thread == Some(target) || core.selected_thread == Some(target)
            });
            match reclaimable {
                None => Err(KernelError::InvalidHandle),
                Some(false) => Err(KernelError::InvalidState),
                Some(true) if on_core => Err(KernelError::InvalidState),
                Some(true) => {
                    st.dequeue_thread(target);
                    st.condvar_waiters.retain(|&t| t != target);
                    st.arbiter_waiters.retain(|&t| t != target);
                    let thread = st.threads.remove(&target).expect("checked above");
                    st.objects.remove(&thread.exit_object);
                    Ok(())
                }
            }
        };
        self.timeouts.cancel(target);
        self.leave(None);
        result
    }

    /// Asks a thread to terminate: pending waits abort with
    /// `ThreadTerminating` and subsequent wait attempts are refused.
    pub fn request_termination(&self, target: ThreadId) -> KernelResult<()> {
        self.enter();
        let result = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&target) {
                Err(KernelError::InvalidHandle)
            } else {
                st.thread_mut(target).termination_requested = true;
                let t = st.thread(target);
                if t.run_state == RunState::Paused {
                    if t.waiting_sync {
                        st.thread_mut(target).signaled_object = None;
                        st.wake_thread(target, Some(KernelError::ThreadTerminating));
                    } else {
                        st.abort_wait(target, KernelError::ThreadTerminating);
                    }
                }
                Ok(st
                    .cores
                    .iter()
                    .position(|core| core.current_thread == Some(target)))
            }
        };
        let interrupt = match &result {
            Ok(core) => *core,
            Err(_) => None,
        };
        if let Some(core) = interrupt {
            self.interrupts.request_interrupt(CoreId(core));
        }
        self.leave(None);
        result.map(|_| ())
    }

    /// Sleeps the caller. Non-negative durations sleep; the special
    /// values 0, -1 and -2 are the yield family (plain rotation, rotation
    /// with load balancing, full core surrender), matching the guest ABI.
    pub fn sleep_thread(&self, caller: ThreadId, nanos: i64) -> KernelResult<()> {
        match nanos {
            0 => return self.yield_thread(caller),
            -1 => return self.yield_with_load_balancing(caller),
            -2 => return self.yield_to_any_thread(caller),
            _ => {}
        }

        self.enter();
        let early = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                Some(Err(KernelError::InvalidHandle))
            } else if st.thread(caller).termination_requested {
                Some(Err(KernelError::ThreadTerminating))
            } else {
                st.thread_mut(caller).sync_result = None;
                st.set_requested_state(caller, RunState::Paused);
                if nanos > 0 {
                    self.timeouts
                        .register(caller, kernel_types::Duration::from_nanos(nanos as u64));
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
        {
            let mut st = self.state.lock();
            // the usual wake path reports Timeout; a sleep that ran its
            // course is a success
            st.thread_mut(caller).sync_result.take();
        }
        self.leave(Some(caller));
        Ok(())
    }

    /// Changes a thread's base priority; the effective priority reflows
    /// through the inheritance graph.
    pub fn set_thread_priority(&self, target: ThreadId, priority: u32) -> KernelResult<()> {
        if priority >= PRIORITY_COUNT as u32 {
            return Err(KernelError::InvalidState);
        }
        self.enter();
        let result = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&target) {
                Err(KernelError::InvalidHandle)
            } else {
                st.thread_mut(target).base_priority = priority;
                st.recompute_inherited_priority(target);
                Ok(())
            }
        };
        self.leave(None);
        result
    }

    /// Changes a thread's preferred core and affinity mask.
    pub fn set_thread_core_mask(
        &self,
        target: ThreadId,
        preferred_core: usize,
        affinity_mask: u64,
    ) -> KernelResult<()> {
        if preferred_core >= CORE_COUNT
            || affinity_mask == 0
            || affinity_mask & !0b1111 != 0
            || affinity_mask & CoreId(preferred_core).mask_bit() == 0
        {
            return Err(KernelError::InvalidMaskValue);
        }
        self.enter();
        let result = {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&target) {
                Err(KernelError::InvalidHandle)
            } else {
                let was = st.thread(target).is_schedulable();
                if was {
                    st.dequeue_thread(target);
                }
                {
                    let t = st.thread_mut(target);
                    t.preferred_core = CoreId(preferred_core);
                    t.affinity_mask = affinity_mask;
                    if let Some(core) = t.current_core {
                        if affinity_mask & core.mask_bit() == 0 {
                            t.current_core = Some(CoreId(preferred_core));
                        }
                    }
                }
                if was {
                    st.enqueue_thread(target);
                }
                Ok(())
            }
        };
        self.leave(None);
        result
    }

    /// Externally pauses or resumes a thread via its force-pause bit,
    /// leaving the thread's own requested state untouched.
    pub fn set_thread_activity(
        &self,
        target: ThreadId,
        activity: ThreadActivity,
    ) -> KernelResult<()> {
        self.enter();
        let result = {
            let mut st = self.state.lock();
            match st.threads.get(&target) {
                None => Err(KernelError::InvalidHandle),
                Some(t) if t.run_state == RunState::None => Err(KernelError::InvalidState),
                Some(t) if t.run_state == RunState::TerminationPending => {
                    Err(KernelError::InvalidState)
                }
                Some(_) => {
                    st.set_force_pause(
                        target,
                        ForcePause::THREAD,
                        activity == ThreadActivity::Paused,
                    );
                    Ok(st
                        .cores
                        .iter()
                        .position(|core| core.current_thread == Some(target)))
                }
            }
        };
        let interrupt = match (&result, activity) {
            (Ok(core), ThreadActivity::Paused) => *core,
            _ => None,
        };
        if let Some(core) = interrupt {
            self.interrupts.request_interrupt(CoreId(core));
        }
        self.leave(None);
        result.map(|_| ())
    }

    // ---- inspection ----------------------------------------------------

    /// The thread currently executing on a core.
    pub fn current_thread(&self, core: usize) -> Option<ThreadId> {
        self.state.lock().cores.get(core)?.current_thread
    }

    /// The thread selection last picked for a core.
    pub fn selected_thread(&self, core: usize) -> Option<ThreadId> {
        self.state.lock().cores.get(core)?.selected_thread
    }

    /// Snapshot of a thread's scheduling state.
    pub fn thread_info(&self, id: ThreadId) -> Option<ThreadInfo> {
        let st = self.state.lock();
        let t = st.threads.get(&id)?;
        Some(ThreadInfo {
            id: t.id,
            name: t.name.clone(),
            base_priority: t.base_priority,
            dynamic_priority: t.dynamic_priority,
            affinity_mask: t.affinity_mask,
            preferred_core: t.preferred_core.0,
            current_core: t.current_core.map(|c| c.0),
            run_state: t.run_state,
        })
    }

    /// The waitable object that signals when a thread terminates.
    pub fn thread_exit_object(&self, id: ThreadId) -> KernelResult<ObjectId> {
        self.state
            .lock()
            .threads
            .get(&id)
            .map(|t| t.exit_object)
            .ok_or(KernelError::InvalidHandle)
    }

    /// Starts recording scheduling events.
    pub fn enable_tracing(&self) {
        self.state.lock().trace = Some(trace::EventTrace::new());
    }

    /// Drains the recorded scheduling events.
    pub fn take_trace(&self) -> Vec<SchedulingEvent> {
        match self.state.lock().trace.as_mut() {
            Some(trace) => trace.take(),
            None => Vec::new(),
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        {
            let (flag, signal) = &*self.ticker_stop;
            *flag.lock() = true;
            signal.notify_all();
        }
        if let Some(handle) = self.ticker.lock().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn spawn_preemption_ticker(kernel: &Arc<Kernel>) {
    let weak = Arc::downgrade(kernel);
    let stop = Arc::clone(&kernel.ticker_stop);
    let handle = std::thread::Builder::new()
        .name("kern.preempt".into())
        .spawn(move || {
            let (flag, signal) = &*stop;
            let mut stopped = flag.lock();
            while !*stopped {
                let timed_out = signal.wait_for(&mut stopped, PREEMPTION_INTERVAL).timed_out();
                if *stopped {
                    break;
                }
                if timed_out {
                    drop(stopped);
                    match weak.upgrade() {
                        Some(kernel) => kernel.on_preemption_tick(),
                        None => return,
                    }
                    stopped = flag.lock();
                }
            }
        })
        .expect("failed to spawn preemption ticker");
    *kernel.ticker.lock() = Some(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use guest_hal::{NullInterruptSink, RecordingInterruptSink, SimGuestMemory, SimHandleTable};
    use kernel_types::Timeout;

    fn test_kernel() -> Arc<Kernel> {
        Kernel::new(
            ExecutionMode::Parallel,
            Arc::new(SimGuestMemory::new()),
            Arc::new(SimHandleTable::new()),
            Arc::new(NullInterruptSink),
        )
    }

    fn test_kernel_with_memory() -> (Arc<Kernel>, Arc<SimGuestMemory>) {
        let memory = Arc::new(SimGuestMemory::new());
        memory.map_region(0x1000, 0x1000);
        let kernel = Kernel::new(
            ExecutionMode::Parallel,
            Arc::clone(&memory) as Arc<dyn guest_hal::GuestMemory>,
            Arc::new(SimHandleTable::new()),
            Arc::new(NullInterruptSink),
        );
        (kernel, memory)
    }

    #[test]
    fn test_started_thread_becomes_current_on_its_core() {
        let kernel = test_kernel();
        let t = kernel.create_thread("worker", 44, 2, 0).unwrap();
        assert_eq!(kernel.current_thread(2), None);

        kernel.start_thread(t).unwrap();
        assert_eq!(kernel.current_thread(2), Some(t));
        let info = kernel.thread_info(t).unwrap();
        assert_eq!(info.run_state, RunState::Running);
        assert_eq!(info.current_core, Some(2));
    }

    #[test]
    fn test_create_thread_validates_arguments() {
        let kernel = test_kernel();
        assert_eq!(
            kernel.create_thread("bad", 64, 0, 0),
            Err(KernelError::InvalidState)
        );
        assert_eq!(
            kernel.create_thread("bad", 10, 7, 0),
            Err(KernelError::InvalidMaskValue)
        );
        // preferred core outside the mask
        assert_eq!(
            kernel.create_thread("bad", 10, 0, 0b0010),
            Err(KernelError::InvalidMaskValue)
        );
        // mask naming a nonexistent core
        assert_eq!(
            kernel.create_thread("bad", 10, 0, 0b1_0001),
            Err(KernelError::InvalidMaskValue)
        );
    }

    #[test]
    fn test_start_twice_is_invalid_state() {
        let kernel = test_kernel();
        let t = kernel.create_thread("worker", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();
        assert_eq!(kernel.start_thread(t), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_signal_before_wait_returns_without_pausing() {
        let kernel = test_kernel();
        let t = kernel.create_thread("waiter", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();

        let object = kernel.create_sync_object("event");
        kernel.signal_object(object).unwrap();

        let other = kernel.create_sync_object("other");
        let index = kernel
            .wait_synchronization(t, &[other, object], Timeout::Never)
            .unwrap();
        assert_eq!(index, 1);
        // the caller never left the running state
        assert_eq!(kernel.thread_info(t).unwrap().run_state, RunState::Running);
    }

    #[test]
    fn test_zero_timeout_wait_polls() {
        let kernel = test_kernel();
        let t = kernel.create_thread("waiter", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();

        let object = kernel.create_sync_object("event");
        assert_eq!(
            kernel.wait_synchronization(t, &[object], Timeout::Poll),
            Err(KernelError::Timeout)
        );
        assert_eq!(kernel.thread_info(t).unwrap().run_state, RunState::Running);
    }

    #[test]
    fn test_wait_rejects_oversized_object_list() {
        let kernel = test_kernel();
        let t = kernel.create_thread("waiter", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();

        let objects: Vec<_> = (0..MAX_WAIT_OBJECTS + 1)
            .map(|i| kernel.create_sync_object(&format!("o{i}")))
            .collect();
        assert_eq!(
            kernel.wait_synchronization(t, &objects, Timeout::Never),
            Err(KernelError::CountOutOfRange)
        );
    }

    #[test]
    fn test_set_thread_activity_pause_and_resume() {
        let kernel = test_kernel();
        let t = kernel.create_thread("worker", 30, 1, 0).unwrap();
        kernel.start_thread(t).unwrap();
        assert_eq!(kernel.current_thread(1), Some(t));

        kernel.set_thread_activity(t, ThreadActivity::Paused).unwrap();
        let info = kernel.thread_info(t).unwrap();
        // requested state survives the external pause
        assert_eq!(info.run_state, RunState::Running);
        assert_eq!(kernel.selected_thread(1), None);

        kernel.set_thread_activity(t, ThreadActivity::Runnable).unwrap();
        assert_eq!(kernel.selected_thread(1), Some(t));
    }

    #[test]
    fn test_pausing_running_thread_requests_interrupt() {
        let interrupts = Arc::new(RecordingInterruptSink::new());
        let kernel = Kernel::new(
            ExecutionMode::Parallel,
            Arc::new(SimGuestMemory::new()),
            Arc::new(SimHandleTable::new()),
            Arc::clone(&interrupts) as Arc<dyn InterruptSink>,
        );
        let t = kernel.create_thread("worker", 30, 3, 0).unwrap();
        kernel.start_thread(t).unwrap();

        kernel.set_thread_activity(t, ThreadActivity::Paused).unwrap();
        assert!(interrupts.requests().contains(&CoreId(3)));
    }

    #[test]
    fn test_priority_change_is_visible_and_validated() {
        let kernel = test_kernel();
        let t = kernel.create_thread("worker", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();

        kernel.set_thread_priority(t, 12).unwrap();
        let info = kernel.thread_info(t).unwrap();
        assert_eq!(info.base_priority, 12);
        assert_eq!(info.dynamic_priority, 12);
        assert_eq!(
            kernel.set_thread_priority(t, 64),
            Err(KernelError::InvalidState)
        );
    }

    #[test]
    fn test_core_mask_change_moves_thread() {
        let kernel = test_kernel();
        let t = kernel.create_thread("worker", 30, 0, 0b0001).unwrap();
        kernel.start_thread(t).unwrap();
        assert_eq!(kernel.current_thread(0), Some(t));

        // current core 0 is no longer allowed; thread moves to core 2
        kernel.set_thread_core_mask(t, 2, 0b0100).unwrap();
        let info = kernel.thread_info(t).unwrap();
        assert_eq!(info.current_core, Some(2));
        assert_eq!(kernel.selected_thread(2), Some(t));

        assert_eq!(
            kernel.set_thread_core_mask(t, 2, 0b0010),
            Err(KernelError::InvalidMaskValue)
        );
    }

    #[test]
    fn test_wait_for_address_condition_mismatch() {
        let (kernel, memory) = test_kernel_with_memory();
        let t = kernel.create_thread("worker", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();
        memory.write_word(0x1000, 9);

        assert_eq!(
            kernel.wait_for_address(t, 0x1000, ArbitrationType::WaitIfEqual, 7, Timeout::Never),
            Err(KernelError::InvalidState)
        );
        assert_eq!(
            kernel.wait_for_address(
                t,
                0x1000,
                ArbitrationType::WaitIfLessThan,
                5,
                Timeout::Never
            ),
            Err(KernelError::InvalidState)
        );
    }

    #[test]
    fn test_wait_for_address_zero_timeout_never_blocks() {
        let (kernel, memory) = test_kernel_with_memory();
        let t = kernel.create_thread("worker", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();
        memory.write_word(0x1000, 7);

        // condition holds, but a poll wait reports Timeout immediately
        assert_eq!(
            kernel.wait_for_address(t, 0x1000, ArbitrationType::WaitIfEqual, 7, Timeout::Poll),
            Err(KernelError::Timeout)
        );
        assert_eq!(kernel.thread_info(t).unwrap().run_state, RunState::Running);
    }

    #[test]
    fn test_wait_for_address_validates_address() {
        let (kernel, _memory) = test_kernel_with_memory();
        let t = kernel.create_thread("worker", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();

        assert_eq!(
            kernel.wait_for_address(t, 0x1002, ArbitrationType::WaitIfEqual, 0, Timeout::Never),
            Err(KernelError::InvalidAddress)
        );
        assert_eq!(
            kernel.wait_for_address(t, 0x9000, ArbitrationType::WaitIfEqual, 0, Timeout::Never),
            Err(KernelError::NoAccessPerm)
        );
    }

    #[test]
    fn test_signal_modify_increments_when_no_waiters() {
        let (kernel, memory) = test_kernel_with_memory();
        let t = kernel.create_thread("worker", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();
        memory.write_word(0x1000, 3);

        kernel
            .signal_to_address(
                t,
                0x1000,
                SignalType::ModifyByWaitingCountAndSignalIfEqual,
                3,
                2,
            )
            .unwrap();
        assert_eq!(memory.word(0x1000), 4);
    }

    #[test]
    fn test_signal_increment_requires_expected_value() {
        let (kernel, memory) = test_kernel_with_memory();
        let t = kernel.create_thread("worker", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();
        memory.write_word(0x1000, 5);

        assert_eq!(
            kernel.signal_to_address(t, 0x1000, SignalType::IncrementAndSignalIfEqual, 4, 1),
            Err(KernelError::InvalidState)
        );
        assert_eq!(memory.word(0x1000), 5);

        kernel
            .signal_to_address(t, 0x1000, SignalType::IncrementAndSignalIfEqual, 5, 1)
            .unwrap();
        assert_eq!(memory.word(0x1000), 6);
    }

    #[test]
    fn test_exit_thread_signals_exit_object() {
        let kernel = test_kernel();
        let t = kernel.create_thread("worker", 30, 0, 0).unwrap();
        let joiner = kernel.create_thread("joiner", 31, 1, 0).unwrap();
        kernel.start_thread(t).unwrap();
        kernel.start_thread(joiner).unwrap();

        kernel.exit_thread(t).unwrap();
        assert_eq!(
            kernel.thread_info(t).unwrap().run_state,
            RunState::TerminationPending
        );

        // the exit object is already signaled, so a join succeeds at once
        let exit = kernel.thread_exit_object(t).unwrap();
        assert_eq!(
            kernel.wait_synchronization(joiner, &[exit], Timeout::Never),
            Ok(0)
        );

        kernel.destroy_thread(t).unwrap();
        assert_eq!(kernel.thread_info(t), None);
        assert_eq!(
            kernel.thread_exit_object(t),
            Err(KernelError::InvalidHandle)
        );
    }

    #[test]
    fn test_termination_request_refuses_new_waits() {
        let kernel = test_kernel();
        let t = kernel.create_thread("worker", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();
        kernel.request_termination(t).unwrap();

        let object = kernel.create_sync_object("event");
        assert_eq!(
            kernel.wait_synchronization(t, &[object], Timeout::Never),
            Err(KernelError::ThreadTerminating)
        );
    }

    #[test]
    fn test_trace_records_selection_and_switch() {
        let kernel = test_kernel();
        kernel.enable_tracing();
        let t = kernel.create_thread("worker", 30, 0, 0).unwrap();
        kernel.start_thread(t).unwrap();

        let events = kernel.take_trace();
        assert!(events.contains(&SchedulingEvent::ThreadSelected {
            core: CoreId(0),
            thread: Some(t)
        }));
        assert!(events.contains(&SchedulingEvent::ContextSwitched {
            core: CoreId(0),
            from: None,
            to: Some(t)
        }));
    }
}
