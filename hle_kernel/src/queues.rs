//! Priority-indexed per-core scheduling queues.
//!
//! For every (priority, core) pair there are two ordered lists: the
//! "assigned" list of threads that run on that core if picked, and the
//! "eligible" list of threads whose affinity admits the core but which are
//! currently assigned elsewhere (load-balancing candidates). A 64-bit
//! presence mask per core and list kind makes highest-priority lookup a
//! single trailing-zeros scan.

use kernel_types::{ThreadId, CORE_COUNT, PRIORITY_COUNT};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Which of the two per-core lists a thread is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueKind {
    /// Runs here if picked
    Assigned,
    /// Could be migrated here
    Eligible,
}

/// A thread's queue-membership record for one core.
///
/// Kept on the thread itself (one slot per core) so dequeueing targets
/// exactly one short list instead of scanning every queue. The record is
/// `Some` iff the thread is linked into some list for that core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSlot {
    pub kind: QueueKind,
    pub priority: u32,
}

/// The dual priority queues for all cores.
pub struct SchedulingQueues {
    assigned: Vec<Vec<VecDeque<ThreadId>>>,
    eligible: Vec<Vec<VecDeque<ThreadId>>>,
    assigned_mask: [u64; CORE_COUNT],
    eligible_mask: [u64; CORE_COUNT],
}

impl SchedulingQueues {
    /// Creates empty queues for all cores and priorities
    pub fn new() -> Self {
        let empty = || {
            (0..CORE_COUNT)
                .map(|_| (0..PRIORITY_COUNT).map(|_| VecDeque::new()).collect())
                .collect()
        };
        Self {
            assigned: empty(),
            eligible: empty(),
            assigned_mask: [0; CORE_COUNT],
            eligible_mask: [0; CORE_COUNT],
        }
    }

    /// Links a thread into a core's assigned list at `priority`.
    pub fn push_assigned(&mut self, core: usize, priority: u32, thread: ThreadId, front: bool) {
        debug_assert!((priority as usize) < PRIORITY_COUNT);
        let queue = &mut self.assigned[core][priority as usize];
        if front {
            queue.push_front(thread);
        } else {
            queue.push_back(thread);
        }
        self.assigned_mask[core] |= 1 << priority;
    }

    /// Unlinks a thread from a core's assigned list.
    pub fn remove_assigned(&mut self, core: usize, priority: u32, thread: ThreadId) {
        let queue = &mut self.assigned[core][priority as usize];
        queue.retain(|&t| t != thread);
        if queue.is_empty() {
            self.assigned_mask[core] &= !(1 << priority);
        }
    }

    /// Links a thread into a core's eligible list at `priority`.
    pub fn push_eligible(&mut self, core: usize, priority: u32, thread: ThreadId) {
        debug_assert!((priority as usize) < PRIORITY_COUNT);
        self.eligible[core][priority as usize].push_front(thread);
        self.eligible_mask[core] |= 1 << priority;
    }

    /// Unlinks a thread from a core's eligible list.
    pub fn remove_eligible(&mut self, core: usize, priority: u32, thread: ThreadId) {
        let queue = &mut self.eligible[core][priority as usize];
        queue.retain(|&t| t != thread);
        if queue.is_empty() {
            self.eligible_mask[core] &= !(1 << priority);
        }
    }

    /// Most urgent assigned thread for a core, if any.
    pub fn first_assigned(&self, core: usize) -> Option<ThreadId> {
        let priority = self.assigned_mask[core].trailing_zeros();
        if priority as usize >= PRIORITY_COUNT {
            return None;
        }
        self.assigned[core][priority as usize].front().copied()
    }

    /// Second-most urgent assigned thread for a core, crossing priority
    /// bands if the top band has only one entry.
    pub fn second_assigned(&self, core: usize) -> Option<ThreadId> {
        self.assigned_in_order(core).into_iter().nth(1)
    }

    /// All assigned threads for a core, most urgent first.
    pub fn assigned_in_order(&self, core: usize) -> Vec<ThreadId> {
        self.in_order(&self.assigned, self.assigned_mask[core], core)
            .into_iter()
            .map(|(_, t)| t)
            .collect()
    }

    /// All eligible threads for a core with their priorities, most urgent
    /// first.
    pub fn eligible_in_order(&self, core: usize) -> Vec<(u32, ThreadId)> {
        self.in_order(&self.eligible, self.eligible_mask[core], core)
    }

    fn in_order(
        &self,
        lists: &[Vec<VecDeque<ThreadId>>],
        mut mask: u64,
        core: usize,
    ) -> Vec<(u32, ThreadId)> {
        let mut out = Vec::new();
        while mask != 0 {
            let priority = mask.trailing_zeros();
            for &thread in &lists[core][priority as usize] {
                out.push((priority, thread));
            }
            mask &= !(1 << priority);
        }
        out
    }

    /// Moves the head of one assigned priority band to its tail and
    /// returns the new head.
    pub fn rotate_assigned(&mut self, core: usize, priority: u32) -> Option<ThreadId> {
        let queue = &mut self.assigned[core][priority as usize];
        if let Some(head) = queue.pop_front() {
            queue.push_back(head);
        }
        queue.front().copied()
    }

    /// Eligible threads in one priority band, in list order.
    pub fn eligible_at(&self, core: usize, priority: u32) -> Vec<ThreadId> {
        self.eligible[core][priority as usize].iter().copied().collect()
    }
}

impl Default for SchedulingQueues {
    fn default() -> Self {
        Self::new()
    }
}
