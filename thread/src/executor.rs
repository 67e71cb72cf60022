//! The pluggable execution capability the scheduler builds on.

use crate::{
    pool::{DynamicTask, DynamicThreadPool, ThreadPoolError},
    signal::{CompletionSignal, Outcome},
};
use parking_lot::Mutex;
use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// A unit of work submitted to an [`Executor`]. Returning `Err` records a
/// task failure on the resulting signal without panicking the worker.
pub type Work = Box<dyn FnOnce() -> Result<(), Arc<dyn std::error::Error + Send + Sync>> + Send>;

/// The minimal capability the scheduler needs from its execution backend:
/// register work that runs once a set of predecessor signals has settled,
/// wait on a signal, and obtain an already-complete signal to use as a root.
///
/// This is the seam that decouples the scheduler from any specific
/// thread-pool or future/promise library. [`ThreadPoolExecutor`] is the one
/// concrete implementation this crate provides; nothing about the scheduler
/// assumes it is the only one.
pub trait Executor {
    /// Returns a signal that has already settled successfully.
    fn ready(&self) -> CompletionSignal;

    /// Registers `work` to run once every signal in `parents` has settled.
    /// If any parent failed or was cancelled, `work` never runs and the
    /// returned signal settles as `Cancelled` carrying that parent's cause.
    /// Returns immediately; does not block.
    fn after(&self, parents: &[CompletionSignal], work: Work) -> CompletionSignal;

    /// Blocks the calling thread until `signal` settles.
    fn wait(&self, signal: &CompletionSignal) -> Outcome {
        signal.wait()
    }
}

struct Inner {
    pool: DynamicThreadPool,
}

/// A production [`Executor`] backed by a fixed pool of worker threads and a
/// bounded work queue, grounded directly on [`DynamicThreadPool`].
///
/// Cheaply `Clone`-able: clones share the same underlying pool, and the pool
/// is torn down only once the last clone is dropped.
#[derive(Clone)]
pub struct ThreadPoolExecutor {
    inner: Arc<Inner>,
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor").finish_non_exhaustive()
    }
}

impl ThreadPoolExecutor {
    pub fn new(n_workers: NonZeroUsize, queue_capacity: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool: DynamicThreadPool::new_dynamic(n_workers, queue_capacity),
            }),
        }
    }

    pub fn n_workers(&self) -> NonZeroUsize {
        self.inner.pool.n_workers()
    }

    fn dispatch(&self, work: Work, result: CompletionSignal) {
        dispatch_on(&self.inner, work, result);
    }
}

fn dispatch_on(inner: &Inner, work: Work, result: CompletionSignal) {
    let outcome = inner.pool.execute(std::iter::once(DynamicTask::new(move || {
        log::trace!("task execution starting");
        let settled = match work() {
            Ok(()) => Outcome::Success,
            Err(cause) => {
                log::error!("task failed: {cause}");
                Outcome::Failed(cause)
            }
        };
        log::trace!("task execution finished");
        result.complete(settled);
    })));

    if let Err(err) = outcome {
        log::error!("failed to dispatch task: {err}");
        // `execute` failing means our `DynamicTask` above was never handed
        // to a worker, so `result` was never completed by it; complete it
        // here so anything waiting on it never waits forever.
        result.complete(Outcome::Failed(Arc::new(DispatchError(err))));
    }
}

impl Executor for ThreadPoolExecutor {
    fn ready(&self) -> CompletionSignal {
        CompletionSignal::ready()
    }

    fn after(&self, parents: &[CompletionSignal], work: Work) -> CompletionSignal {
        let result = CompletionSignal::pending();

        if parents.is_empty() {
            self.dispatch(work, result.clone());
            return result;
        }

        // The work must run exactly once, triggered by whichever parent
        // settles last. A slot shared between every parent's callback holds
        // it until that moment; the inner pool handle travels with it so the
        // callback (which may run on any worker thread, or synchronously
        // during `after` itself if a parent is already settled) can dispatch
        // without borrowing `self`.
        let remaining = Arc::new(AtomicUsize::new(parents.len()));
        let slot: Arc<Mutex<Option<Work>>> = Arc::new(Mutex::new(Some(work)));
        let upstream_cause: Arc<Mutex<Option<Arc<dyn std::error::Error + Send + Sync>>>> =
            Arc::new(Mutex::new(None));

        for parent in parents {
            let remaining = Arc::clone(&remaining);
            let slot = Arc::clone(&slot);
            let upstream_cause = Arc::clone(&upstream_cause);
            let result = result.clone();
            let inner = Arc::clone(&self.inner);

            parent.on_complete(move |outcome| {
                if let Some(cause) = outcome.cause() {
                    let mut upstream_cause = upstream_cause.lock();
                    if upstream_cause.is_none() {
                        *upstream_cause = Some(Arc::new(DisplayError(cause.to_string())));
                    }
                }

                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let work = slot.lock().take();
                    let cause = upstream_cause.lock().clone();
                    match (cause, work) {
                        (Some(cause), _) => {
                            log::warn!("task cancelled: upstream failure");
                            result.complete(Outcome::Cancelled(cause));
                        }
                        (None, Some(work)) => dispatch_on(&inner, work, result),
                        (None, None) => unreachable!("work slot only ever emptied once"),
                    }
                }
            });
        }

        result
    }
}

#[derive(Debug)]
struct DispatchError(ThreadPoolError);

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor dispatch failed: {}", self.0)
    }
}

impl std::error::Error for DispatchError {}

#[derive(Debug)]
struct DisplayError(String);

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DisplayError {}
