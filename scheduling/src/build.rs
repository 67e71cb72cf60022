//! Incremental, single-threaded construction of a task/resource graph.
//!
//! Grounded on `impact_scheduling::TaskScheduler`: a single-threaded build
//! phase (`register_task`/`complete_task_registration`) followed by a
//! frozen execution phase, generalized from one Rust type per task
//! (`define_task!`-generated structs registered via `Arc<dyn Task<S>>`) to
//! opaque ids over dynamically supplied closures, since this scheduler's
//! API is a builder over ids rather than one Rust type per task.

use crate::{
    containers::HashSet,
    error::SchedulerError,
    graph::Dag,
    ids::{self, ResourceId, TaskId},
};
use parking_lot::Mutex;
use std::sync::Arc;
use thread::{CompletionSignal, Work};

pub(crate) struct TaskRecord {
    pub body: Option<Work>,
    pub required: HashSet<ResourceId>,
}

/// A DAG of tasks with hierarchical resource locking, built incrementally
/// and then executed once via [`run`](Self::run).
///
/// All build-time operations are externally synchronized: the client must
/// construct the graph from a single thread. After `run()` the scheduler
/// is frozen and immutable; observing the returned handle is thread-safe.
pub struct Scheduler<E> {
    pub(crate) executor: E,
    pub(crate) tag: u64,
    pub(crate) task_dag: Dag<TaskId>,
    pub(crate) resource_dag: Dag<ResourceId>,
    pub(crate) tasks: Vec<TaskRecord>,
    pub(crate) resource_mutexes: Vec<Mutex<()>>,
    pub(crate) frozen: bool,
    pub(crate) ran: bool,
    pub(crate) run_done: Option<CompletionSignal>,
}

impl<E> std::fmt::Debug for Scheduler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("n_tasks", &self.tasks.len())
            .field("n_resources", &self.resource_mutexes.len())
            .field("frozen", &self.frozen)
            .field("ran", &self.ran)
            .finish()
    }
}

impl<E> Scheduler<E> {
    /// Creates a new, empty scheduler that will dispatch work through
    /// `executor` once [`run`](Self::run) is called.
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            tag: ids::next_scheduler_tag(),
            task_dag: Dag::new(),
            resource_dag: Dag::new(),
            tasks: Vec::new(),
            resource_mutexes: Vec::new(),
            frozen: false,
            ran: false,
            run_done: None,
        }
    }

    /// Registers a unit of work and returns the id it is known by from now
    /// on. Ids are dense and strictly increasing within a scheduler.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Frozen`] if `run` has already started.
    pub fn add_task<F>(&mut self, body: F) -> Result<TaskId, SchedulerError>
    where
        F: FnOnce() -> Result<(), Arc<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        self.reject_if_frozen()?;
        let id = TaskId::new(self.tag, self.tasks.len() as u64);
        self.task_dag.add_node(id);
        self.tasks.push(TaskRecord {
            body: Some(Box::new(body)),
            required: HashSet::default(),
        });
        log::debug!("added {id}");
        Ok(id)
    }

    /// Registers a resource and returns the id it is known by from now on.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Frozen`] if `run` has already started.
    pub fn add_resource(&mut self) -> Result<ResourceId, SchedulerError> {
        self.reject_if_frozen()?;
        let id = ResourceId::new(self.tag, self.resource_mutexes.len() as u64);
        self.resource_dag.add_node(id);
        self.resource_mutexes.push(Mutex::new(()));
        log::debug!("added {id}");
        Ok(id)
    }

    /// Declares that `child` must not start until `parent` has completed.
    /// Adding the same edge twice is equivalent to adding it once.
    ///
    /// # Errors
    /// Returns [`SchedulerError::UnknownId`] if either id was not returned
    /// by this scheduler, [`SchedulerError::SelfEdge`] if `parent ==
    /// child`, or [`SchedulerError::Frozen`] if `run` has already started.
    /// Cycles are not rejected here; they surface as
    /// [`SchedulerError::CycleDetected`] from [`run`](Self::run).
    pub fn add_task_dependency(&mut self, parent: TaskId, child: TaskId) -> Result<(), SchedulerError> {
        self.reject_if_frozen()?;
        self.check_task_id(parent)?;
        self.check_task_id(child)?;
        self.task_dag.add_edge(parent, child)
    }

    /// Declares that `child` implies `parent` whenever `child` is locked.
    /// Adding the same edge twice is equivalent to adding it once.
    ///
    /// # Errors
    /// Same as [`add_task_dependency`](Self::add_task_dependency), over
    /// `ResourceId` instead of `TaskId`.
    pub fn add_resource_dependency(&mut self, parent: ResourceId, child: ResourceId) -> Result<(), SchedulerError> {
        self.reject_if_frozen()?;
        self.check_resource_id(parent)?;
        self.check_resource_id(child)?;
        self.resource_dag.add_edge(parent, child)
    }

    /// Declares that `task` must hold `resource` (and, transitively, all of
    /// its ancestors) while executing. Idempotent: declaring the same
    /// requirement twice is equivalent to declaring it once.
    ///
    /// # Errors
    /// Returns [`SchedulerError::UnknownId`] if either id is unknown, or
    /// [`SchedulerError::Frozen`] if `run` has already started.
    pub fn add_required_resource(&mut self, task: TaskId, resource: ResourceId) -> Result<(), SchedulerError> {
        self.reject_if_frozen()?;
        self.check_resource_id(resource)?;
        self.check_task_id(task)?;
        self.tasks[task.index()].required.insert(resource);
        Ok(())
    }

    fn reject_if_frozen(&self) -> Result<(), SchedulerError> {
        if self.frozen {
            Err(SchedulerError::Frozen)
        } else {
            Ok(())
        }
    }

    fn check_task_id(&self, id: TaskId) -> Result<(), SchedulerError> {
        if id.scheduler() == self.tag && id.index() < self.tasks.len() {
            Ok(())
        } else {
            Err(SchedulerError::UnknownId)
        }
    }

    fn check_resource_id(&self, id: ResourceId) -> Result<(), SchedulerError> {
        if id.scheduler() == self.tag && id.index() < self.resource_mutexes.len() {
            Ok(())
        } else {
            Err(SchedulerError::UnknownId)
        }
    }
}

/// Waits for any in-flight run to finish before releasing the executor,
/// mirroring `ThreadPool::drop`'s explicit "wait for no pending tasks, then
/// join" shutdown rather than relying on the executor's `Arc` refcount to
/// decide when work has actually settled.
impl<E> Drop for Scheduler<E> {
    fn drop(&mut self) {
        if let Some(done) = self.run_done.take() {
            done.wait();
        }
    }
}
