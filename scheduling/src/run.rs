//! Scheduler run engine: topological wiring of per-task completions.

use crate::{
    build::Scheduler,
    error::{Cause, RunErrors, SchedulerError},
    lock::ResourceLocks,
    macros::with_trace_logging,
};
use parking_lot::Mutex;
use std::{
    panic,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thread::{CompletionSignal, Executor, Latch, Work};

/// The handle returned by [`Scheduler::run`]; completes once every task
/// with no successor has settled.
#[derive(Clone)]
pub struct RunHandle {
    done: CompletionSignal,
    errors: Arc<Mutex<RunErrors>>,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle").field("done", &self.done).finish()
    }
}

impl RunHandle {
    /// Blocks until every task has settled, then returns every task
    /// failure observed (not just the first), or `Ok(())` if every leaf
    /// task succeeded.
    pub fn wait(&self) -> Result<(), RunErrors> {
        self.done.wait();
        let errors = self.errors.lock().clone();
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Requests cancellation of this run. Best-effort and asynchronous: any
    /// task that has not yet started (still waiting on the startup latch, or
    /// still waiting on its predecessors) is skipped and settles as
    /// cancelled instead of running its body; a task already past that point
    /// runs to completion and releases its resources normally, exactly as
    /// if cancellation had never been requested. Idempotent.
    pub fn cancel(&self) {
        log::warn!("run cancellation requested");
        self.cancelled.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
struct Panicked(String);

impl std::fmt::Display for Panicked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task panicked: {}", self.0)
    }
}

impl std::error::Error for Panicked {}

#[derive(Debug)]
struct CancelledBeforeStart;

impl std::fmt::Display for CancelledBeforeStart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "skipped: run was cancelled before this task started")
    }
}

impl std::error::Error for CancelledBeforeStart {}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl<E: Executor> Scheduler<E> {
    /// Freezes the graph, wires a completion signal per task onto its
    /// predecessors' signals in topological order, wraps each task body
    /// with a resource-acquisition prelude and release epilogue, and
    /// submits everything through the executor.
    ///
    /// Tasks with no predecessor are dispatched immediately but block on an
    /// internal latch that only opens once every edge in the graph has
    /// been wired — this prevents a source task from racing ahead of
    /// edges still being registered for a task appearing later in
    /// topological order, which would make sibling ordering
    /// non-deterministic. This replaces the source's "lock a mutex before
    /// wiring, unlock after" idiom, which overloads mutex semantics as a
    /// one-shot signal, with an explicit single-fire latch.
    ///
    /// # Errors
    /// Returns [`SchedulerError::CycleDetected`] if the task graph or the
    /// resource graph is cyclic, or [`SchedulerError::AlreadyRun`] on a
    /// second call.
    pub fn run(&mut self) -> Result<RunHandle, SchedulerError> {
        if self.ran {
            return Err(SchedulerError::AlreadyRun);
        }
        self.ran = true;
        self.frozen = true;

        // A cyclic resource hierarchy could never be locked, even though
        // no task ever walks it directly; reject it up front.
        self.resource_dag.toposort()?;
        let order = with_trace_logging!("topological sort"; self.task_dag.toposort())?;
        log::debug!("scheduler frozen, {} task(s) in run order", order.len());

        let locks = Arc::new(ResourceLocks::new(
            std::mem::take(&mut self.resource_dag),
            std::mem::take(&mut self.resource_mutexes),
        ));
        let latch = Arc::new(Latch::new());
        let errors = Arc::new(Mutex::new(RunErrors::default()));
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut completions: Vec<Option<CompletionSignal>> = vec![None; self.tasks.len()];

        for &task_id in &order {
            let idx = task_id.index();

            let parent_signals: Vec<CompletionSignal> = self
                .task_dag
                .parents(task_id)
                .map(|parent| {
                    completions[parent.index()]
                        .clone()
                        .expect("predecessors are wired before their dependents in topological order")
                })
                .collect();
            let is_source = parent_signals.is_empty();

            let body = self.tasks[idx]
                .body
                .take()
                .expect("each task body is consumed exactly once, during run()");
            let required = self.tasks[idx].required.clone();
            let locks = Arc::clone(&locks);
            let latch = Arc::clone(&latch);
            let errors = Arc::clone(&errors);
            let cancelled = Arc::clone(&cancelled);

            let wrapped: Work = Box::new(move || {
                if is_source {
                    latch.wait();
                }
                if cancelled.load(Ordering::Acquire) {
                    log::warn!("{task_id} skipped: run cancelled before it started");
                    let cause: Cause = Arc::new(CancelledBeforeStart);
                    errors.lock().push(task_id, Arc::clone(&cause));
                    return Err(cause);
                }
                let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                    let _guard = locks.acquire(&required);
                    with_trace_logging!("{} executing", task_id; body())
                }));
                match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(cause)) => {
                        log::error!("{task_id} failed: {cause}");
                        errors.lock().push(task_id, Arc::clone(&cause));
                        Err(cause)
                    }
                    Err(panic_payload) => {
                        let cause: Cause = Arc::new(Panicked(panic_message(panic_payload)));
                        log::error!("{task_id} panicked: {cause}");
                        errors.lock().push(task_id, Arc::clone(&cause));
                        Err(cause)
                    }
                }
            });

            completions[idx] = Some(self.executor.after(&parent_signals, wrapped));
        }

        let leaves: Vec<CompletionSignal> = order
            .iter()
            .filter(|id| self.task_dag.children(**id).next().is_none())
            .map(|id| completions[id.index()].clone().expect("every task is wired above"))
            .collect();

        latch.fire();
        log::debug!("latch fired, {} leaf completion(s) to join", leaves.len());

        let done = if leaves.is_empty() {
            self.executor.ready()
        } else {
            self.executor
                .after(&leaves, Box::new(|| -> Result<(), Cause> { Ok(()) }))
        };

        self.run_done = Some(done.clone());

        Ok(RunHandle { done, errors, cancelled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scheduler as PublicScheduler;
    use std::{
        num::NonZeroUsize,
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicIsize, AtomicUsize, Ordering},
        },
        time::Duration,
    };
    use thread::ThreadPoolExecutor;

    fn scheduler() -> PublicScheduler<ThreadPoolExecutor> {
        PublicScheduler::new(ThreadPoolExecutor::new(
            NonZeroUsize::new(4).unwrap(),
            NonZeroUsize::new(64).unwrap(),
        ))
    }

    fn ok() -> Result<(), Cause> {
        Ok(())
    }

    // S1. Chain of three: "hello" + " " + "world", serialized by a shared
    // resource so the appends cannot interleave.
    #[test]
    fn chain_of_three_runs_in_dependency_order() {
        let mut scheduler = scheduler();
        let buffer = Arc::new(StdMutex::new(String::new()));
        let r = scheduler.add_resource().unwrap();

        let push = |buffer: Arc<StdMutex<String>>, text: &'static str| {
            move || {
                buffer.lock().unwrap().push_str(text);
                ok()
            }
        };

        let h = scheduler.add_task(push(Arc::clone(&buffer), "hello")).unwrap();
        let s = scheduler.add_task(push(Arc::clone(&buffer), " ")).unwrap();
        let w = scheduler.add_task(push(Arc::clone(&buffer), "world")).unwrap();

        for &t in &[h, s, w] {
            scheduler.add_required_resource(t, r).unwrap();
        }
        scheduler.add_task_dependency(h, s).unwrap();
        scheduler.add_task_dependency(s, w).unwrap();

        scheduler.run().unwrap().wait().unwrap();
        assert_eq!(*buffer.lock().unwrap(), "hello world");
    }

    // S2. Fan-out: A finishes strictly before any of B1..B3 start.
    #[test]
    fn fan_out_runs_source_before_every_sibling() {
        let mut scheduler = scheduler();
        let a_end = Arc::new(AtomicIsize::new(-1));
        let b_starts = Arc::new(StdMutex::new(Vec::new()));
        let counter = Arc::new(AtomicIsize::new(0));

        let a_end_clone = Arc::clone(&a_end);
        let counter_clone = Arc::clone(&counter);
        let a = scheduler
            .add_task(move || {
                a_end_clone.store(counter_clone.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                ok()
            })
            .unwrap();

        let mut siblings = Vec::new();
        for _ in 0..3 {
            let b_starts = Arc::clone(&b_starts);
            let counter = Arc::clone(&counter);
            let b = scheduler
                .add_task(move || {
                    b_starts.lock().unwrap().push(counter.fetch_add(1, Ordering::SeqCst));
                    ok()
                })
                .unwrap();
            scheduler.add_task_dependency(a, b).unwrap();
            siblings.push(b);
        }

        scheduler.run().unwrap().wait().unwrap();

        let a_end = a_end.load(Ordering::SeqCst);
        assert!(a_end >= 0);
        assert!(b_starts.lock().unwrap().iter().all(|&start| start > a_end));
    }

    // S3. Resource-gated siblings: ten tasks sharing one resource never
    // overlap, though no task-edges order them.
    #[test]
    fn resource_gated_siblings_never_overlap() {
        let mut scheduler = scheduler();
        let r = scheduler.add_resource().unwrap();
        let overlapping = Arc::new(AtomicUsize::new(0));
        let max_overlap = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let overlapping = Arc::clone(&overlapping);
            let max_overlap = Arc::clone(&max_overlap);
            let t = scheduler
                .add_task(move || {
                    let now = overlapping.fetch_add(1, Ordering::SeqCst) + 1;
                    max_overlap.fetch_max(now, Ordering::SeqCst);
                    overlapping.fetch_sub(1, Ordering::SeqCst);
                    ok()
                })
                .unwrap();
            scheduler.add_required_resource(t, r).unwrap();
        }

        scheduler.run().unwrap().wait().unwrap();
        assert_eq!(max_overlap.load(Ordering::SeqCst), 1);
    }

    // S4. Hierarchical lock: T1 requires the child resource (which implies
    // the parent), T2 requires the parent directly; they must not overlap.
    #[test]
    fn hierarchical_requirement_contends_with_parent_requirement() {
        let mut scheduler = scheduler();
        let p = scheduler.add_resource().unwrap();
        let c = scheduler.add_resource().unwrap();
        scheduler.add_resource_dependency(p, c).unwrap();

        let overlapping = Arc::new(AtomicUsize::new(0));
        let max_overlap = Arc::new(AtomicUsize::new(0));

        let overlapping1 = Arc::clone(&overlapping);
        let max_overlap1 = Arc::clone(&max_overlap);
        let t1 = scheduler
            .add_task(move || {
                let now = overlapping1.fetch_add(1, Ordering::SeqCst) + 1;
                max_overlap1.fetch_max(now, Ordering::SeqCst);
                std::thread::yield_now();
                overlapping1.fetch_sub(1, Ordering::SeqCst);
                ok()
            })
            .unwrap();
        scheduler.add_required_resource(t1, c).unwrap();

        let overlapping2 = Arc::clone(&overlapping);
        let max_overlap2 = Arc::clone(&max_overlap);
        let t2 = scheduler
            .add_task(move || {
                let now = overlapping2.fetch_add(1, Ordering::SeqCst) + 1;
                max_overlap2.fetch_max(now, Ordering::SeqCst);
                std::thread::yield_now();
                overlapping2.fetch_sub(1, Ordering::SeqCst);
                ok()
            })
            .unwrap();
        scheduler.add_required_resource(t2, p).unwrap();

        scheduler.run().unwrap().wait().unwrap();
        assert_eq!(max_overlap.load(Ordering::SeqCst), 1);
    }

    // S5. Cycle rejection: run() fails and no task body executes.
    #[test]
    fn cyclic_task_graph_is_rejected_before_any_task_runs() {
        let mut scheduler = scheduler();
        let ran = Arc::new(AtomicUsize::new(0));

        let ran_a = Arc::clone(&ran);
        let a = scheduler.add_task(move || {
            ran_a.fetch_add(1, Ordering::SeqCst);
            ok()
        }).unwrap();
        let ran_b = Arc::clone(&ran);
        let b = scheduler.add_task(move || {
            ran_b.fetch_add(1, Ordering::SeqCst);
            ok()
        }).unwrap();

        scheduler.add_task_dependency(a, b).unwrap();
        scheduler.add_task_dependency(b, a).unwrap();

        assert!(matches!(scheduler.run(), Err(SchedulerError::CycleDetected)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    // S6. Failure propagation: A -> B -> C, B fails, C never runs, A ran.
    #[test]
    fn failure_cancels_downstream_without_affecting_upstream() {
        let mut scheduler = scheduler();
        let a_ran = Arc::new(AtomicUsize::new(0));
        let c_ran = Arc::new(AtomicUsize::new(0));

        let a_ran_clone = Arc::clone(&a_ran);
        let a = scheduler
            .add_task(move || {
                a_ran_clone.fetch_add(1, Ordering::SeqCst);
                ok()
            })
            .unwrap();
        let b = scheduler
            .add_task(|| Err(Arc::new(std::io::Error::other("b failed")) as Cause))
            .unwrap();
        let c_ran_clone = Arc::clone(&c_ran);
        let c = scheduler
            .add_task(move || {
                c_ran_clone.fetch_add(1, Ordering::SeqCst);
                ok()
            })
            .unwrap();

        scheduler.add_task_dependency(a, b).unwrap();
        scheduler.add_task_dependency(b, c).unwrap();

        let result = scheduler.run().unwrap().wait();
        let errors = result.unwrap_err();
        assert_eq!(errors.failures().len(), 1);
        assert_eq!(errors.failures()[0].0, b);
        assert_eq!(a_ran.load(Ordering::SeqCst), 1);
        assert_eq!(c_ran.load(Ordering::SeqCst), 0);
    }

    // Cancellation: A -> B -> C. A is already in flight when cancel() is
    // called, so it runs to completion; B and C have not started yet, so
    // they are skipped.
    #[test]
    fn cancel_runs_in_flight_tasks_to_completion_and_skips_the_rest() {
        let mut scheduler = scheduler();
        let a_started = Arc::new(AtomicUsize::new(0));
        let a_ran = Arc::new(AtomicUsize::new(0));
        let b_ran = Arc::new(AtomicUsize::new(0));
        let c_ran = Arc::new(AtomicUsize::new(0));

        let a_started_clone = Arc::clone(&a_started);
        let a_ran_clone = Arc::clone(&a_ran);
        let a = scheduler
            .add_task(move || {
                a_started_clone.store(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                a_ran_clone.fetch_add(1, Ordering::SeqCst);
                ok()
            })
            .unwrap();
        let b_ran_clone = Arc::clone(&b_ran);
        let b = scheduler
            .add_task(move || {
                b_ran_clone.fetch_add(1, Ordering::SeqCst);
                ok()
            })
            .unwrap();
        let c_ran_clone = Arc::clone(&c_ran);
        let c = scheduler
            .add_task(move || {
                c_ran_clone.fetch_add(1, Ordering::SeqCst);
                ok()
            })
            .unwrap();

        scheduler.add_task_dependency(a, b).unwrap();
        scheduler.add_task_dependency(b, c).unwrap();

        let handle = scheduler.run().unwrap();
        // Wait for A to have passed its own cancellation check and entered
        // its body before cancelling, so this exercises "already in
        // flight" rather than racing A's own check.
        while a_started.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        handle.cancel();
        let result = handle.wait();

        assert!(result.is_err());
        assert_eq!(a_ran.load(Ordering::SeqCst), 1);
        assert_eq!(b_ran.load(Ordering::SeqCst), 0);
        assert_eq!(c_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_is_idempotent_and_harmless_after_a_run_already_finished() {
        let mut scheduler = scheduler();
        scheduler.add_task(ok).unwrap();
        let handle = scheduler.run().unwrap();
        handle.wait().unwrap();
        handle.cancel();
        handle.cancel();
    }

    #[test]
    fn running_twice_returns_already_run() {
        let mut scheduler = scheduler();
        scheduler.add_task(ok).unwrap();
        scheduler.run().unwrap().wait().unwrap();
        assert!(matches!(scheduler.run(), Err(SchedulerError::AlreadyRun)));
    }

    #[test]
    fn mutating_after_run_is_rejected() {
        let mut scheduler = scheduler();
        let t = scheduler.add_task(ok).unwrap();
        scheduler.run().unwrap().wait().unwrap();
        assert!(matches!(scheduler.add_task(ok), Err(SchedulerError::Frozen)));
        assert!(matches!(
            scheduler.add_task_dependency(t, t),
            Err(SchedulerError::Frozen)
        ));
    }

    #[test]
    fn empty_scheduler_completes_immediately() {
        let mut scheduler = scheduler();
        scheduler.run().unwrap().wait().unwrap();
    }
}
