//! Per-core selection, load balancing and context switches.
//!
//! Selection is pure bookkeeping: it decides, under the scheduling lock,
//! which thread each core *should* run and flags the cores whose decision
//! changed. The physical switch happens strictly after the lock is
//! released, from [`Kernel::switch_after_release`], and is the only place
//! a host thread ever parks.

use crate::trace::SchedulingEvent;
use crate::{ExecutionMode, Kernel, KernelState};
use kernel_types::{
    CoreId, KernelError, KernelResult, ThreadId, CORE_COUNT, LOWEST_MIGRATABLE_PRIORITY,
};

/// Scheduling state of one virtual core.
#[derive(Debug, Default)]
pub(crate) struct CoreContext {
    pub current_thread: Option<ThreadId>,
    pub selected_thread: Option<ThreadId>,
    pub switch_pending: bool,
}

impl KernelState {
    fn select_thread_for_core(&mut self, core: usize, thread: Option<ThreadId>) {
        if self.cores[core].selected_thread == thread {
            return;
        }
        self.cores[core].selected_thread = thread;
        self.cores[core].switch_pending = true;
        self.record_event(SchedulingEvent::ThreadSelected {
            core: CoreId(core),
            thread,
        });
    }

    /// Moves a thread's assignment to `core`, refreshing its assigned and
    /// eligible queue membership.
    pub(crate) fn transfer_to_core(&mut self, thread: ThreadId, core: Option<CoreId>) {
        if self.thread(thread).current_core == core {
            return;
        }
        self.dequeue_thread(thread);
        self.thread_mut(thread).current_core = core;
        self.enqueue_thread(thread);
        self.record_event(SchedulingEvent::ThreadMigrated { thread, to: core });
    }

    /// Recomputes every core's selected thread from the queues, then fills
    /// idle cores from other cores' eligible candidates.
    pub(crate) fn select_threads(&mut self) {
        if !self.reselection_needed {
            return;
        }

        for core in 0..CORE_COUNT {
            let head = self.queues.first_assigned(core);
            self.select_thread_for_core(core, head);
        }

        for core in 0..CORE_COUNT {
            if self.cores[core].selected_thread.is_some() {
                continue;
            }

            // Scan this idle core's eligible candidates in priority order.
            // A candidate that is not its source core's selected thread
            // migrates directly; candidates that are selected elsewhere
            // are remembered for the swap pass.
            let mut source_cores: Vec<usize> = Vec::new();
            let mut migrated = false;
            for (priority, candidate) in self.queues.eligible_in_order(core) {
                if priority < LOWEST_MIGRATABLE_PRIORITY {
                    continue;
                }
                let source = self.thread(candidate).current_core;
                let selected_on_source = match source {
                    Some(c) => self.cores[c.0].selected_thread == Some(candidate),
                    None => false,
                };
                if !selected_on_source {
                    self.transfer_to_core(candidate, Some(CoreId(core)));
                    self.select_thread_for_core(core, Some(candidate));
                    migrated = true;
                    break;
                }
                if let Some(c) = source {
                    if !source_cores.contains(&c.0) {
                        source_cores.push(c.0);
                    }
                }
            }
            if migrated {
                continue;
            }

            // Every candidate is running elsewhere: steal the first source
            // core whose queue holds a second-ranked thread, promoting that
            // thread locally so the source core is not starved.
            for source in source_cores {
                if let Some(second) = self.queues.second_assigned(source) {
                    if let Some(first) = self.cores[source].selected_thread {
                        self.select_thread_for_core(source, Some(second));
                        self.transfer_to_core(first, Some(CoreId(core)));
                        self.select_thread_for_core(core, Some(first));
                    }
                    break;
                }
            }
        }

        self.reselection_needed = false;
    }

    /// Round-robin rotation for one (core, priority) band, plus the
    /// eligible-elsewhere migration restricted to that band.
    pub(crate) fn rotate_priority(&mut self, core: usize, priority: u32) {
        self.queues.rotate_assigned(core, priority);
        self.record_event(SchedulingEvent::PriorityRotated {
            core: CoreId(core),
            priority,
        });

        for candidate in self.queues.eligible_at(core, priority) {
            let source = self.thread(candidate).current_core;
            let selected_on_source = match source {
                Some(c) => self.cores[c.0].selected_thread == Some(candidate),
                None => false,
            };
            if !selected_on_source {
                self.transfer_to_core(candidate, Some(CoreId(core)));
                break;
            }
        }
        self.reselection_needed = true;
    }

    /// Commits one core's pending switch. `signal_incoming` is false in
    /// time-sliced mode, where the round-robin scan decides which single
    /// gate opens.
    pub(crate) fn switch_core(&mut self, core: usize, signal_incoming: bool) {
        let outgoing = self.cores[core].current_thread;
        let incoming = self.cores[core].selected_thread;
        self.cores[core].switch_pending = false;
        if outgoing == incoming {
            return;
        }
        self.record_event(SchedulingEvent::ContextSwitched {
            core: CoreId(core),
            from: outgoing,
            to: incoming,
        });
        if let Some(out) = outgoing {
            self.thread(out).gate.reset();
        }
        self.cores[core].current_thread = incoming;
        if let Some(inc) = incoming {
            self.tick += 1;
            let tick = self.tick;
            let t = self.thread_mut(inc);
            t.last_scheduled_tick = tick;
            t.current_core = Some(CoreId(core));
            if signal_incoming {
                t.gate.signal();
            }
        }
    }

    fn yield_rotate(&mut self, caller: ThreadId) -> Option<CoreId> {
        let t = self.thread(caller);
        if !t.is_schedulable() {
            return None;
        }
        let core = t.current_core?;
        let priority = t.dynamic_priority;
        self.queues.remove_assigned(core.0, priority, caller);
        self.queues.push_assigned(core.0, priority, caller, false);
        self.reselection_needed = true;
        Some(core)
    }
}

impl Kernel {
    /// Parks the calling host thread until its guest thread is switched in
    /// for the first time (or again, after an interrupt-driven switch).
    pub fn begin_execution(&self, thread: ThreadId) -> KernelResult<()> {
        let gate = {
            let st = self.state.lock();
            match st.threads.get(&thread) {
                Some(t) => t.gate.clone(),
                None => return Err(KernelError::InvalidHandle),
            }
        };
        gate.wait();
        Ok(())
    }

    /// Entry point for the CPU collaborator after it honors a requested
    /// interrupt: performs the switch pending for the interrupted thread's
    /// core, parking the caller if it was descheduled.
    pub fn handle_interrupt(&self, caller: ThreadId) {
        self.enter();
        self.leave(Some(caller));
    }

    /// Runs one 10 ms preemption pass: rotates the round-robin band of
    /// every core and lets the next selection pick up the new heads.
    pub fn on_preemption_tick(&self) {
        self.enter();
        {
            let mut st = self.state.lock();
            st.rotate_priority(0, 59);
            st.rotate_priority(1, 59);
            st.rotate_priority(2, 59);
            st.rotate_priority(3, 63);
        }
        self.leave(None);
    }

    /// Moves the caller to the back of its priority band.
    pub fn yield_thread(&self, caller: ThreadId) -> KernelResult<()> {
        self.enter();
        {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                drop(st);
                self.leave(None);
                return Err(KernelError::InvalidHandle);
            }
            st.yield_rotate(caller);
        }
        self.leave(Some(caller));
        Ok(())
    }

    /// Rotates like [`yield_thread`](Self::yield_thread), then pulls one
    /// eligible-elsewhere thread onto the caller's core: any more urgent
    /// candidate, or an equal-priority candidate that was scheduled longer
    /// ago than the caller.
    pub fn yield_with_load_balancing(&self, caller: ThreadId) -> KernelResult<()> {
        self.enter();
        {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                drop(st);
                self.leave(None);
                return Err(KernelError::InvalidHandle);
            }
            if let Some(core) = st.yield_rotate(caller) {
                let my_priority = st.thread(caller).dynamic_priority;
                let my_tick = st.thread(caller).last_scheduled_tick;
                let mut pulled = None;
                for (priority, candidate) in st.queues.eligible_in_order(core.0) {
                    if priority > my_priority {
                        break;
                    }
                    if priority < LOWEST_MIGRATABLE_PRIORITY {
                        continue;
                    }
                    let candidate_tick = st.thread(candidate).last_scheduled_tick;
                    if priority < my_priority || candidate_tick < my_tick {
                        pulled = Some(candidate);
                        break;
                    }
                }
                if let Some(candidate) = pulled {
                    st.transfer_to_core(candidate, Some(core));
                }
            }
        }
        self.leave(Some(caller));
        Ok(())
    }

    /// Gives up the caller's core assignment entirely. If that leaves the
    /// core without assigned threads, the best migratable candidate is
    /// pulled in; with no candidate the caller takes its core back.
    pub fn yield_to_any_thread(&self, caller: ThreadId) -> KernelResult<()> {
        self.enter();
        {
            let mut st = self.state.lock();
            if !st.threads.contains_key(&caller) {
                drop(st);
                self.leave(None);
                return Err(KernelError::InvalidHandle);
            }
            let former = st.thread(caller).current_core;
            if st.thread(caller).is_schedulable() {
                st.transfer_to_core(caller, None);
                if let Some(core) = former {
                    if st.queues.first_assigned(core.0).is_none() {
                        let candidate = st
                            .queues
                            .eligible_in_order(core.0)
                            .into_iter()
                            .find(|&(p, t)| t != caller && p >= LOWEST_MIGRATABLE_PRIORITY)
                            .map(|(_, t)| t);
                        match candidate {
                            Some(t) => st.transfer_to_core(t, Some(core)),
                            None => st.transfer_to_core(caller, Some(core)),
                        }
                    }
                }
                st.reselection_needed = true;
            }
        }
        self.leave(Some(caller));
        Ok(())
    }

    /// Performs the physical switches implied by pending selection
    /// changes. Runs strictly after the scheduling lock is released.
    pub(crate) fn switch_after_release(&self, caller: Option<ThreadId>) {
        match self.mode {
            ExecutionMode::TimeSliced => self.context_switch_time_sliced(caller),
            ExecutionMode::Parallel => {
                let mut interrupt_cores = Vec::new();
                let mut switch_locally = false;
                {
                    let st = self.state.lock();
                    for core in 0..CORE_COUNT {
                        if !st.cores[core].switch_pending {
                            continue;
                        }
                        let outgoing = st.cores[core].current_thread;
                        if outgoing.is_none() || outgoing == caller {
                            switch_locally = true;
                        } else {
                            interrupt_cores.push(CoreId(core));
                        }
                    }
                }
                for core in interrupt_cores {
                    self.interrupts.request_interrupt(core);
                }
                if switch_locally {
                    self.context_switch_parallel(caller);
                }
            }
        }
    }

    fn context_switch_parallel(&self, caller: Option<ThreadId>) {
        let park = {
            let mut st = self.state.lock();
            for core in 0..CORE_COUNT {
                if !st.cores[core].switch_pending {
                    continue;
                }
                let outgoing = st.cores[core].current_thread;
                if outgoing.is_none() || outgoing == caller {
                    st.switch_core(core, true);
                }
            }
            match caller {
                None => None,
                Some(c) => {
                    let occupied = (0..CORE_COUNT)
                        .filter(|&core| st.cores[core].current_thread == Some(c))
                        .count();
                    if occupied > 1 {
                        panic!(
                            "scheduler corruption: {c} is current on {occupied} cores at once"
                        );
                    }
                    if occupied == 1 {
                        None
                    } else {
                        Some(st.thread(c).gate.clone())
                    }
                }
            }
        };
        if let Some(gate) = park {
            gate.wait();
        }
    }

    fn context_switch_time_sliced(&self, caller: Option<ThreadId>) {
        let park = {
            let mut st = self.state.lock();
            if let Some(active) = st.active_thread {
                if Some(active) != caller {
                    // another guest thread holds the host; it will drive
                    // the switch when it re-enters the kernel
                    let core = st
                        .thread(active)
                        .current_core
                        .unwrap_or(CoreId(st.last_switch_core));
                    drop(st);
                    self.interrupts.request_interrupt(core);
                    return;
                }
                st.thread(active).gate.reset();
                st.active_thread = None;
            }

            for core in 0..CORE_COUNT {
                if st.cores[core].switch_pending {
                    st.switch_core(core, false);
                }
            }

            let mut chosen = None;
            for step in 1..=CORE_COUNT {
                let core = (st.last_switch_core + step) % CORE_COUNT;
                if let Some(t) = st.cores[core].current_thread {
                    if st.thread(t).is_schedulable() {
                        chosen = Some((core, t));
                        break;
                    }
                }
            }

            match chosen {
                Some((core, next)) => {
                    st.last_switch_core = core;
                    st.active_thread = Some(next);
                    st.thread(next).gate.signal();
                    if Some(next) == caller {
                        None
                    } else {
                        caller.map(|c| st.thread(c).gate.clone())
                    }
                }
                None => caller.map(|c| st.thread(c).gate.clone()),
            }
        };
        if let Some(gate) = park {
            gate.wait();
        }
    }
}
