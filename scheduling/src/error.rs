//! Scheduler error types.
//!
//! A plain enum with a manual `Display`/`Error` impl, the same pattern
//! `thread::ThreadPoolError` uses, rather than a derive-macro error crate.

use crate::ids::TaskId;
use std::{fmt, sync::Arc};

/// Errors returned by the scheduler's build-time and run-time API.
#[derive(Clone, Debug)]
pub enum SchedulerError {
    /// A `TaskId` or `ResourceId` was not returned by this scheduler.
    UnknownId,
    /// A task or resource was declared to depend on itself.
    SelfEdge,
    /// The task or resource dependency graph contains a cycle.
    CycleDetected,
    /// The graph was mutated after [`run`](crate::Scheduler::run) started.
    Frozen,
    /// `run` was called more than once.
    AlreadyRun,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownId => write!(f, "id was not created by this scheduler"),
            Self::SelfEdge => write!(f, "a task or resource cannot depend on itself"),
            Self::CycleDetected => write!(f, "dependency graph contains a cycle"),
            Self::Frozen => write!(f, "scheduler was already run and can no longer be mutated"),
            Self::AlreadyRun => write!(f, "run was already called on this scheduler"),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// The cause a task failure or a downstream cancellation carries.
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// Every task failure observed while joining a run, not just the first,
/// mirroring `ThreadPoolTaskErrors`'s one-entry-per-failure shape.
#[derive(Clone, Debug, Default)]
pub struct RunErrors {
    failures: Vec<(TaskId, Cause)>,
}

impl RunErrors {
    pub(crate) fn push(&mut self, id: TaskId, cause: Cause) {
        self.failures.push((id, cause));
    }

    /// Whether any task failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Every `(task, cause)` pair observed, in the order the failures were
    /// recorded.
    pub fn failures(&self) -> &[(TaskId, Cause)] {
        &self.failures
    }
}

impl fmt::Display for RunErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed", self.failures.len())?;
        for (id, cause) in &self.failures {
            write!(f, "; {id}: {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RunErrors {}
