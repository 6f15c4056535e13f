//! Thread control blocks and the scheduling-state machine.
//!
//! A thread's requested run state (`None → Paused ⇄ Running →
//! TerminationPending`) is orthogonal to the force-pause bits: an external
//! actor can suppress a thread without disturbing what the thread asked
//! for, and clearing the last force-pause bit restores exactly the
//! requested state. Everything here mutates queue membership through the
//! per-core membership slots, so a thread is always unlinked from the
//! precise lists it was linked into.

use crate::gate::ExecutionGate;
use crate::queues::{QueueKind, QueueSlot};
use crate::KernelState;
use bitflags::bitflags;
use kernel_types::{
    CoreId, Handle, KernelError, ObjectId, ThreadId, CORE_COUNT, UNSCHEDULABLE_PRIORITY,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Requested run state. `TerminationPending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Created but never started
    None,
    /// Blocked in a wait protocol
    Paused,
    /// Wants to run (may still be force-paused)
    Running,
    /// On the way out; never schedulable again
    TerminationPending,
}

bitflags! {
    /// Force-pause reasons, orthogonal to the requested run state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ForcePause: u8 {
        const PROCESS = 1 << 0;
        const THREAD = 1 << 1;
        const DEBUG = 1 << 2;
        const KERNEL_INIT = 1 << 3;
    }
}

/// Per-guest-thread scheduling state.
pub struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) name: String,
    pub(crate) base_priority: u32,
    pub(crate) dynamic_priority: u32,
    pub(crate) affinity_mask: u64,
    pub(crate) preferred_core: CoreId,
    /// Core this thread is assigned to; `None` while floating between
    /// cores (yield-to-any) or before first assignment
    pub(crate) current_core: Option<CoreId>,
    pub(crate) run_state: RunState,
    pub(crate) force_pause: ForcePause,
    pub(crate) queue_slots: [Option<QueueSlot>; CORE_COUNT],

    // Mutex-ownership graph
    pub(crate) mutex_owner: Option<ThreadId>,
    pub(crate) mutex_waiters: Vec<ThreadId>,
    pub(crate) mutex_address: u64,
    pub(crate) mutex_wait_handle: Handle,

    // Arbitration / wait bookkeeping
    pub(crate) condvar_address: Option<u64>,
    pub(crate) arbiter_address: Option<u64>,
    pub(crate) waiting_sync: bool,
    pub(crate) wait_objects: Vec<ObjectId>,
    pub(crate) signaled_object: Option<ObjectId>,
    pub(crate) sync_result: Option<KernelError>,
    pub(crate) cancel_pending: bool,
    pub(crate) termination_requested: bool,

    pub(crate) exit_object: ObjectId,
    pub(crate) last_scheduled_tick: u64,
    pub(crate) gate: Arc<ExecutionGate>,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        name: String,
        priority: u32,
        preferred_core: CoreId,
        affinity_mask: u64,
        exit_object: ObjectId,
    ) -> Self {
        Self {
            id,
            name,
            base_priority: priority,
            dynamic_priority: priority,
            affinity_mask,
            preferred_core,
            current_core: Some(preferred_core),
            run_state: RunState::None,
            force_pause: ForcePause::KERNEL_INIT,
            queue_slots: [None; CORE_COUNT],
            mutex_owner: None,
            mutex_waiters: Vec::new(),
            mutex_address: 0,
            mutex_wait_handle: Handle::from_raw(0),
            condvar_address: None,
            arbiter_address: None,
            waiting_sync: false,
            wait_objects: Vec::new(),
            signaled_object: None,
            sync_result: None,
            cancel_pending: false,
            termination_requested: false,
            exit_object,
            last_scheduled_tick: 0,
            gate: Arc::new(ExecutionGate::new()),
        }
    }

    /// Effective runnability: requested Running, no force-pause bits, and
    /// a schedulable priority.
    pub(crate) fn is_schedulable(&self) -> bool {
        self.run_state == RunState::Running
            && self.force_pause.is_empty()
            && self.dynamic_priority < UNSCHEDULABLE_PRIORITY
    }
}

impl KernelState {
    pub(crate) fn thread(&self, id: ThreadId) -> &Thread {
        self.threads.get(&id).expect("unknown thread id")
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        self.threads.get_mut(&id).expect("unknown thread id")
    }

    /// Links a schedulable thread into its core's assigned queue and every
    /// other affinity-eligible core's eligible queue.
    pub(crate) fn enqueue_thread_at(&mut self, id: ThreadId, front: bool) {
        let (priority, affinity, current) = {
            let t = self.thread(id);
            if !t.is_schedulable() {
                return;
            }
            (t.dynamic_priority, t.affinity_mask, t.current_core)
        };
        if let Some(core) = current {
            self.queues.push_assigned(core.0, priority, id, front);
            self.thread_mut(id).queue_slots[core.0] = Some(QueueSlot {
                kind: QueueKind::Assigned,
                priority,
            });
        }
        for core in 0..CORE_COUNT {
            if Some(CoreId(core)) != current && affinity & (1 << core) != 0 {
                self.queues.push_eligible(core, priority, id);
                self.thread_mut(id).queue_slots[core] = Some(QueueSlot {
                    kind: QueueKind::Eligible,
                    priority,
                });
            }
        }
        self.reselection_needed = true;
    }

    pub(crate) fn enqueue_thread(&mut self, id: ThreadId) {
        self.enqueue_thread_at(id, false);
    }

    /// Unlinks a thread from every scheduling queue it is a member of.
    pub(crate) fn dequeue_thread(&mut self, id: ThreadId) {
        for core in 0..CORE_COUNT {
            let slot = match self.thread(id).queue_slots[core] {
                Some(slot) => slot,
                None => continue,
            };
            match slot.kind {
                QueueKind::Assigned => self.queues.remove_assigned(core, slot.priority, id),
                QueueKind::Eligible => self.queues.remove_eligible(core, slot.priority, id),
            }
            self.thread_mut(id).queue_slots[core] = None;
            self.reselection_needed = true;
        }
    }

    fn apply_schedulability_change(&mut self, id: ThreadId, was_schedulable: bool) {
        let now = self.thread(id).is_schedulable();
        if was_schedulable && !now {
            self.dequeue_thread(id);
        } else if !was_schedulable && now {
            self.enqueue_thread(id);
        }
    }

    /// Writes the requested run state, adjusting queue membership.
    ///
    /// Writes to a terminated thread are ignored; nothing comes back from
    /// `TerminationPending`.
    pub(crate) fn set_requested_state(&mut self, id: ThreadId, state: RunState) {
        let was = {
            let t = self.thread(id);
            if t.run_state == RunState::TerminationPending || t.run_state == state {
                return;
            }
            t.is_schedulable()
        };
        self.thread_mut(id).run_state = state;
        self.apply_schedulability_change(id, was);
    }

    /// Sets or clears force-pause bits without touching the requested
    /// state. Clearing the last bit while the thread requested Running
    /// re-enqueues it.
    pub(crate) fn set_force_pause(&mut self, id: ThreadId, bits: ForcePause, pause: bool) {
        let was = self.thread(id).is_schedulable();
        {
            let t = self.thread_mut(id);
            if pause {
                t.force_pause.insert(bits);
            } else {
                t.force_pause.remove(bits);
            }
        }
        self.apply_schedulability_change(id, was);
    }

    /// Moves a thread to a new effective priority, repositioning it in
    /// every priority-ordered structure it participates in.
    pub(crate) fn set_dynamic_priority(&mut self, id: ThreadId, priority: u32) {
        let (old, was_schedulable) = {
            let t = self.thread(id);
            (t.dynamic_priority, t.is_schedulable())
        };
        if old == priority {
            return;
        }
        if was_schedulable {
            self.dequeue_thread(id);
        }
        self.thread_mut(id).dynamic_priority = priority;
        if self.thread(id).is_schedulable() {
            // the currently executing thread re-enters at the front of its
            // band so a priority change cannot preempt the thread itself
            let executing = self
                .cores
                .iter()
                .any(|core| core.current_thread == Some(id));
            self.enqueue_thread_at(id, executing);
        }

        if let Some(owner) = self.thread(id).mutex_owner {
            self.resort_mutex_waiter(owner, id);
        }
        if self.thread(id).condvar_address.is_some() {
            self.condvar_waiters.retain(|&t| t != id);
            let pos = self.urgency_insert_position(&self.condvar_waiters, priority);
            self.condvar_waiters.insert(pos, id);
        }
        if self.thread(id).arbiter_address.is_some() {
            self.arbiter_waiters.retain(|&t| t != id);
            let pos = self.urgency_insert_position(&self.arbiter_waiters, priority);
            self.arbiter_waiters.insert(pos, id);
        }
        self.reselection_needed = true;
    }

    /// Index at which a thread of `priority` belongs in an urgency-sorted
    /// list: before the first entry that is numerically greater (less
    /// urgent), after all equal entries.
    pub(crate) fn urgency_insert_position(&self, list: &[ThreadId], priority: u32) -> usize {
        list.iter()
            .position(|&t| self.thread(t).dynamic_priority > priority)
            .unwrap_or(list.len())
    }

    fn resort_mutex_waiter(&mut self, owner: ThreadId, waiter: ThreadId) {
        let priority = self.thread(waiter).dynamic_priority;
        let mut list = std::mem::take(&mut self.thread_mut(owner).mutex_waiters);
        list.retain(|&t| t != waiter);
        let pos = self.urgency_insert_position(&list, priority);
        list.insert(pos, waiter);
        self.thread_mut(owner).mutex_waiters = list;
    }

    /// Registers `waiter` as blocked on a mutex held by `owner` and
    /// propagates priority inheritance up the ownership chain.
    pub(crate) fn add_mutex_waiter(&mut self, owner: ThreadId, waiter: ThreadId) {
        let priority = self.thread(waiter).dynamic_priority;
        let mut list = std::mem::take(&mut self.thread_mut(owner).mutex_waiters);
        let pos = self.urgency_insert_position(&list, priority);
        list.insert(pos, waiter);
        self.thread_mut(owner).mutex_waiters = list;
        self.thread_mut(waiter).mutex_owner = Some(owner);
        self.recompute_inherited_priority(owner);
    }

    /// Removes a waiter edge and undoes its contribution to inheritance.
    pub(crate) fn remove_mutex_waiter(&mut self, owner: ThreadId, waiter: ThreadId) {
        self.thread_mut(owner).mutex_waiters.retain(|&t| t != waiter);
        self.thread_mut(waiter).mutex_owner = None;
        self.recompute_inherited_priority(owner);
    }

    /// Re-derives a thread's dynamic priority from its base priority and
    /// direct waiters, walking up the owner chain until a priority stops
    /// changing.
    pub(crate) fn recompute_inherited_priority(&mut self, start: ThreadId) {
        let mut current = start;
        loop {
            let target = {
                let t = self.thread(current);
                let inherited = t
                    .mutex_waiters
                    .iter()
                    .map(|&w| self.thread(w).dynamic_priority)
                    .min();
                match inherited {
                    Some(p) => t.base_priority.min(p),
                    None => t.base_priority,
                }
            };
            if target == self.thread(current).dynamic_priority {
                break;
            }
            self.set_dynamic_priority(current, target);
            match self.thread(current).mutex_owner {
                Some(owner) => current = owner,
                None => break,
            }
        }
    }

    /// Hands ownership of the mutex at `address` to its most urgent
    /// waiter, reparenting the remaining waiters for that address onto the
    /// new owner. Returns the new owner (if any) and how many waiters were
    /// queued on the address, the new owner included.
    pub(crate) fn relinquish_mutex(
        &mut self,
        owner: ThreadId,
        address: u64,
    ) -> (Option<ThreadId>, usize) {
        let list = std::mem::take(&mut self.thread_mut(owner).mutex_waiters);
        let (matching, remaining): (Vec<ThreadId>, Vec<ThreadId>) = list
            .into_iter()
            .partition(|&t| self.thread(t).mutex_address == address);
        self.thread_mut(owner).mutex_waiters = remaining;
        if matching.is_empty() {
            return (None, 0);
        }

        // the list is urgency-sorted, so the first match is the most urgent
        let new_owner = matching[0];
        for &waiter in &matching {
            self.thread_mut(waiter).mutex_owner = None;
        }
        for &waiter in &matching[1..] {
            self.add_mutex_waiter(new_owner, waiter);
        }
        self.recompute_inherited_priority(owner);
        self.recompute_inherited_priority(new_owner);
        (Some(new_owner), matching.len())
    }

    /// Makes a thread runnable again, recording the wait outcome
    /// (`None` = success).
    pub(crate) fn wake_thread(&mut self, id: ThreadId, result: Option<KernelError>) {
        self.thread_mut(id).sync_result = result;
        self.set_requested_state(id, RunState::Running);
    }

    /// Pulls a thread out of whatever wait structure it is blocked in and
    /// wakes it with an error result. Used by cancellation, termination
    /// and timeouts; every removal is idempotent.
    pub(crate) fn abort_wait(&mut self, id: ThreadId, error: KernelError) {
        if self.thread(id).condvar_address.is_some() {
            self.condvar_waiters.retain(|&t| t != id);
            self.thread_mut(id).condvar_address = None;
        }
        if self.thread(id).arbiter_address.is_some() {
            self.arbiter_waiters.retain(|&t| t != id);
            self.thread_mut(id).arbiter_address = None;
        }
        if let Some(owner) = self.thread(id).mutex_owner {
            self.remove_mutex_waiter(owner, id);
        }
        self.wake_thread(id, Some(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelState;

    fn state_with_threads(priorities: &[u32]) -> (KernelState, Vec<ThreadId>) {
        let mut st = KernelState::new();
        let ids = priorities
            .iter()
            .map(|&p| st.insert_thread("t".into(), p, CoreId(0), 0b1111))
            .collect();
        (st, ids)
    }

    fn start(st: &mut KernelState, id: ThreadId) {
        st.set_requested_state(id, RunState::Running);
        st.set_force_pause(id, ForcePause::KERNEL_INIT, false);
    }

    /// Checks the inheritance invariant for every thread.
    fn assert_inheritance_invariant(st: &KernelState) {
        for (&id, t) in &st.threads {
            let inherited = t
                .mutex_waiters
                .iter()
                .map(|&w| st.thread(w).dynamic_priority)
                .min();
            let expected = match inherited {
                Some(p) => t.base_priority.min(p),
                None => t.base_priority,
            };
            assert_eq!(
                st.thread(id).dynamic_priority,
                expected,
                "inheritance invariant broken for {id}"
            );
        }
    }

    #[test]
    fn test_start_enqueues_on_affinity_cores() {
        let (mut st, ids) = state_with_threads(&[20]);
        let id = ids[0];
        start(&mut st, id);

        assert_eq!(st.queues.first_assigned(0), Some(id));
        for core in 1..CORE_COUNT {
            assert_eq!(st.queues.eligible_in_order(core), vec![(20, id)]);
        }
    }

    #[test]
    fn test_force_pause_preserves_requested_state() {
        let (mut st, ids) = state_with_threads(&[20]);
        let id = ids[0];
        start(&mut st, id);

        st.set_force_pause(id, ForcePause::DEBUG, true);
        assert_eq!(st.thread(id).run_state, RunState::Running);
        assert!(!st.thread(id).is_schedulable());
        assert_eq!(st.queues.first_assigned(0), None);

        // a second pause reason, then clear one of the two
        st.set_force_pause(id, ForcePause::THREAD, true);
        st.set_force_pause(id, ForcePause::DEBUG, false);
        assert!(!st.thread(id).is_schedulable());

        // clearing the last bit re-enqueues at the requested state
        st.set_force_pause(id, ForcePause::THREAD, false);
        assert!(st.thread(id).is_schedulable());
        assert_eq!(st.queues.first_assigned(0), Some(id));
    }

    #[test]
    fn test_waiter_list_is_urgency_sorted_with_fifo_ties() {
        let (mut st, ids) = state_with_threads(&[30, 10, 20, 20, 5]);
        let owner = ids[0];
        for &w in &ids[1..] {
            st.add_mutex_waiter(owner, w);
        }
        // 5 first, then 10, then the two 20s in insertion order
        assert_eq!(
            st.thread(owner).mutex_waiters,
            vec![ids[4], ids[1], ids[2], ids[3]]
        );
        assert_inheritance_invariant(&st);
    }

    #[test]
    fn test_priority_inheritance_propagates_transitively() {
        // chain: c waits on b's mutex, b waits on a's mutex
        let (mut st, ids) = state_with_threads(&[40, 30, 8]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);

        st.add_mutex_waiter(a, b);
        assert_eq!(st.thread(a).dynamic_priority, 30);

        st.add_mutex_waiter(b, c);
        assert_eq!(st.thread(b).dynamic_priority, 8);
        // b's boost flows through to a
        assert_eq!(st.thread(a).dynamic_priority, 8);
        assert_inheritance_invariant(&st);

        st.remove_mutex_waiter(b, c);
        assert_eq!(st.thread(b).dynamic_priority, 30);
        assert_eq!(st.thread(a).dynamic_priority, 30);
        assert_inheritance_invariant(&st);
    }

    #[test]
    fn test_base_priority_change_reflows_inheritance() {
        let (mut st, ids) = state_with_threads(&[40, 25]);
        let (owner, waiter) = (ids[0], ids[1]);
        st.add_mutex_waiter(owner, waiter);
        assert_eq!(st.thread(owner).dynamic_priority, 25);

        // waiter gets less urgent: owner falls back to its own base
        st.thread_mut(waiter).base_priority = 50;
        st.set_dynamic_priority(waiter, 50);
        st.recompute_inherited_priority(owner);
        assert_eq!(st.thread(owner).dynamic_priority, 40);
        assert_inheritance_invariant(&st);
    }

    #[test]
    fn test_relinquish_hands_off_to_most_urgent_and_reparents() {
        let (mut st, ids) = state_with_threads(&[30, 22, 14, 18]);
        let owner = ids[0];
        for &w in &ids[1..] {
            st.thread_mut(w).mutex_address = 0x1000;
            st.add_mutex_waiter(owner, w);
        }

        let (new_owner, count) = st.relinquish_mutex(owner, 0x1000);
        assert_eq!(new_owner, Some(ids[2])); // priority 14 is most urgent
        assert_eq!(count, 3);
        assert!(st.thread(owner).mutex_waiters.is_empty());
        // the two losers now wait on the new owner, urgency-sorted
        assert_eq!(st.thread(ids[2]).mutex_waiters, vec![ids[3], ids[1]]);
        assert_eq!(st.thread(owner).dynamic_priority, 30);
        assert_eq!(st.thread(ids[2]).dynamic_priority, 14);
        assert_inheritance_invariant(&st);
    }

    #[test]
    fn test_relinquish_leaves_other_addresses_alone() {
        let (mut st, ids) = state_with_threads(&[30, 20, 10]);
        let owner = ids[0];
        st.thread_mut(ids[1]).mutex_address = 0x1000;
        st.thread_mut(ids[2]).mutex_address = 0x2000;
        st.add_mutex_waiter(owner, ids[1]);
        st.add_mutex_waiter(owner, ids[2]);

        let (new_owner, count) = st.relinquish_mutex(owner, 0x1000);
        assert_eq!(new_owner, Some(ids[1]));
        assert_eq!(count, 1);
        // the 0x2000 waiter still belongs to the old owner
        assert_eq!(st.thread(owner).mutex_waiters, vec![ids[2]]);
        assert_eq!(st.thread(owner).dynamic_priority, 10);
        assert_inheritance_invariant(&st);
    }

    #[test]
    fn test_priority_change_repositions_running_thread() {
        let (mut st, ids) = state_with_threads(&[20, 20]);
        start(&mut st, ids[0]);
        start(&mut st, ids[1]);
        assert_eq!(st.queues.assigned_in_order(0), vec![ids[0], ids[1]]);

        // not executing: re-enters at the back of the new band
        st.set_dynamic_priority(ids[0], 25);
        assert_eq!(st.queues.assigned_in_order(0), vec![ids[1], ids[0]]);

        // executing: re-enters at the front of its band
        st.cores[0].current_thread = Some(ids[1]);
        st.set_dynamic_priority(ids[1], 25);
        assert_eq!(st.queues.assigned_in_order(0), vec![ids[1], ids[0]]);
    }

    #[test]
    fn test_terminated_state_is_terminal() {
        let (mut st, ids) = state_with_threads(&[20]);
        let id = ids[0];
        start(&mut st, id);
        st.set_requested_state(id, RunState::TerminationPending);
        assert_eq!(st.queues.first_assigned(0), None);

        st.set_requested_state(id, RunState::Running);
        assert_eq!(st.thread(id).run_state, RunState::TerminationPending);
        assert_eq!(st.queues.first_assigned(0), None);
    }
}
