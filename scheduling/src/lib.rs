//! A DAG-based task scheduler with hierarchical resource locking.
//!
//! Tasks are built up incrementally ([`Scheduler::add_task`],
//! [`Scheduler::add_task_dependency`]) alongside a separate DAG of named
//! resources ([`Scheduler::add_resource`],
//! [`Scheduler::add_resource_dependency`]), each task declaring the
//! resources it needs exclusive access to
//! ([`Scheduler::add_required_resource`]). Calling [`Scheduler::run`]
//! freezes the graph and executes every task through a pluggable
//! [`thread::Executor`], honoring both the task DAG's happens-before
//! ordering and mutual exclusion on every resource a task requires plus,
//! transitively, every ancestor of those resources in the resource DAG.
//!
//! See [`lock`] for the hierarchical locking protocol and [`run`] for the
//! topological wiring that turns a built graph into running tasks.

mod build;
mod containers;
mod error;
mod graph;
mod ids;
mod lock;
mod macros;
mod run;

pub use build::Scheduler;
pub use error::{Cause, RunErrors, SchedulerError};
pub use ids::{ResourceId, TaskId};
pub use run::RunHandle;
