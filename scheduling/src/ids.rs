//! Dense, monotonically increasing identifiers.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Assigns a fresh tag to each [`Scheduler`](crate::Scheduler) instance so
/// that ids minted by one scheduler can never be mistaken for ids minted by
/// another, even when both schedulers happen to have allocated the same
/// number of tasks or resources. The teacher's `TaskID` was a content hash,
/// which made this collision vanishingly unlikely by accident; a dense
/// per-scheduler counter needs this tag to keep the same guarantee on
/// purpose.
pub(crate) fn next_scheduler_tag() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Opaque, stable identifier for a task, assigned in creation order.
///
/// Carries the tag of the [`Scheduler`](crate::Scheduler) that created it so
/// an id from a different scheduler instance is rejected as
/// [`SchedulerError::UnknownId`](crate::SchedulerError::UnknownId) rather
/// than silently accepted because its index happens to be in bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    index: u64,
    scheduler: u64,
}

/// Opaque, stable identifier for a resource, assigned in creation order.
///
/// Ascending order over `ResourceId` is the canonical lock order used by
/// the resource lock manager: every acquisition of a set of resources
/// visits them in this order, which is what makes the hierarchical lock
/// protocol deadlock-free. `index` is compared before `scheduler` so this
/// ordering reflects creation order within one scheduler, the only context
/// in which two `ResourceId`s are ever compared for locking purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    index: u64,
    scheduler: u64,
}

impl TaskId {
    pub(crate) fn new(scheduler: u64, index: u64) -> Self {
        Self { index, scheduler }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn scheduler(self) -> u64 {
        self.scheduler
    }
}

impl ResourceId {
    pub(crate) fn new(scheduler: u64, index: u64) -> Self {
        Self { index, scheduler }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn scheduler(self) -> u64 {
        self.scheduler
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.index)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource#{}", self.index)
    }
}
