//! Thread pool implementation.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    num::NonZeroUsize,
    panic,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

/// A set of worker threads configured to execute a specific task on request.
///
/// # Type parameters
/// `M` is the type of message content sent to threads when they should execute
/// a task.
#[derive(Debug)]
pub struct ThreadPool<M> {
    communicator: ThreadPoolCommunicator<M>,
    workers: Vec<Worker>,
}

/// A [`ThreadPool`] whose message type is a boxed nullary closure, enabling
/// tasks to be dynamically specified at execution time rather than at pool
/// construction time. This is the backbone of the crate's
/// [`Executor`](crate::executor::Executor) implementation: every unit of work
/// registered through `after` is dispatched as one `DynamicTask`.
pub type DynamicThreadPool = ThreadPool<DynamicTask>;

/// A boxed closure representing a [`DynamicThreadPool`] task.
#[allow(missing_debug_implementations)]
pub struct DynamicTask(Box<dyn FnOnce() + Send>);

pub type ThreadPoolResult = Result<(), ThreadPoolError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadPoolError {
    QueueFull,
    ChannelDisconnected,
    TaskScheduledDuringShutdown,
}

#[derive(Debug)]
struct Worker {
    handle: JoinHandle<()>,
}

/// A shared structure for handling communication between the threads in a
/// [`ThreadPool`].
#[derive(Debug)]
struct ThreadPoolCommunicator<M> {
    n_workers: NonZeroUsize,
    channel: ThreadPoolChannel<M>,
    execution_progress: Arc<ExecutionProgress>,
}

/// A single channel shared between the main thread and all worker threads in
/// a [`ThreadPool`], used for sending instructions to a shared queue.
#[derive(Debug)]
struct ThreadPoolChannel<M> {
    owning_worker_id: Option<WorkerID>,
    sender: Sender<WorkerInstruction<M>>,
    receiver: Receiver<WorkerInstruction<M>>,
    execution_progress: Arc<ExecutionProgress>,
}

#[derive(Debug)]
struct ExecutionProgress {
    pending_task_count: AtomicUsize,
    wait_mutex: Mutex<()>,
    no_pending_tasks_condvar: Condvar,
    is_shutting_down: AtomicBool,
}

/// An instruction that can be sent to threads in a [`ThreadPool`] to make them
/// begin executing their task with a given message of type `M` (which can be
/// any piece of data), or to terminate so that they can be joined.
#[derive(Clone, Debug, PartialEq, Eq)]
enum WorkerInstruction<M> {
    Execute(M),
    Terminate,
}

/// ID identifying worker threads in a [`ThreadPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct WorkerID(u64);

impl<M> ThreadPool<M> {
    /// Creates a new thread pool containing the given number of worker
    /// threads configured to execute a specified task. When a thread receives
    /// a [`WorkerInstruction`] to execute the task, the given `execute_task`
    /// closure is called with the message contained in the execution
    /// instruction.
    pub fn new<T>(n_workers: NonZeroUsize, queue_capacity: NonZeroUsize, execute_task: &'static T) -> Self
    where
        M: Send + 'static,
        T: Fn(M) + Sync,
    {
        let communicator = ThreadPoolCommunicator::new(n_workers, queue_capacity);

        let workers = (0..n_workers.get() as u64)
            .map(|worker_id| {
                let communicator = communicator.clone_for_worker(WorkerID(worker_id));
                Worker::spawn(communicator, execute_task)
            })
            .collect();

        Self {
            communicator,
            workers,
        }
    }

    /// Returns the number of worker threads in the thread pool (this does not
    /// include the main thread).
    pub fn n_workers(&self) -> NonZeroUsize {
        self.communicator.n_workers()
    }

    /// Instructs worker threads in the pool to execute their task. The task
    /// will be executed with each of the given messages. This function
    /// returns as soon as all the given execution instructions have been
    /// sent; it does not wait for them to run.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The queue is full or has become disconnected.
    /// - The pool is currently shutting down.
    pub fn execute(&self, messages: impl IntoIterator<Item = M>) -> ThreadPoolResult {
        for message in messages {
            self.communicator
                .channel()
                .send_execute_instruction(message)?;
        }
        Ok(())
    }
}

impl DynamicThreadPool {
    /// Creates a new [`DynamicThreadPool`] with the given number of workers
    /// and capacity for the communication channel.
    pub fn new_dynamic(n_workers: NonZeroUsize, queue_capacity: NonZeroUsize) -> Self {
        Self::new(n_workers, queue_capacity, &|task: DynamicTask| (task.0)())
    }
}

impl<M> Drop for ThreadPool<M> {
    fn drop(&mut self) {
        let execution_progress = self.communicator.execution_progress();

        execution_progress.report_shutdown_started();
        execution_progress.wait_for_no_pending_tasks();

        for _ in 0..self.workers.len() {
            let _ = self
                .communicator
                .channel()
                .try_send_instruction(WorkerInstruction::Terminate);
        }

        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

impl DynamicTask {
    /// Creates a new dynamic task represented by the given closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }
}

impl fmt::Debug for DynamicTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicTask").finish()
    }
}

impl fmt::Display for ThreadPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "thread pool task queue is full"),
            Self::ChannelDisconnected => write!(f, "thread pool channel was disconnected"),
            Self::TaskScheduledDuringShutdown => {
                write!(f, "a task execution was requested while the pool was shutting down")
            }
        }
    }
}

impl std::error::Error for ThreadPoolError {}

impl Worker {
    fn spawn<M, F>(communicator: ThreadPoolCommunicator<M>, execute_task: &'static F) -> Self
    where
        M: Send + 'static,
        F: Fn(M) + Sync,
    {
        let handle = thread::spawn(move || {
            let worker_id = communicator.channel().owning_worker_id();
            log::trace!("worker {worker_id} spawned");

            loop {
                let Some(instruction) = communicator.channel().wait_for_next_instruction() else {
                    break;
                };

                match instruction {
                    WorkerInstruction::Execute(message) => {
                        if let Err(cause) =
                            panic::catch_unwind(panic::AssertUnwindSafe(|| execute_task(message)))
                        {
                            log::error!("task panicked: {cause:?}");
                        }

                        communicator
                            .execution_progress()
                            .register_completed_tasks(1);
                    }
                    WorkerInstruction::Terminate => {
                        log::trace!("worker {worker_id} terminating");
                        break;
                    }
                }
            }
        });
        Self { handle }
    }

    fn join(self) {
        if let Err(err) = self.handle.join() {
            log::error!("worker thread failed to join: {err:?}");
        }
    }
}

impl<M> ThreadPoolCommunicator<M> {
    fn new(n_workers: NonZeroUsize, queue_capacity: NonZeroUsize) -> Self {
        let execution_progress = Arc::new(ExecutionProgress::new());
        let channel = ThreadPoolChannel::new(queue_capacity, execution_progress.clone());
        Self {
            n_workers,
            channel,
            execution_progress,
        }
    }

    fn n_workers(&self) -> NonZeroUsize {
        self.n_workers
    }

    fn channel(&self) -> &ThreadPoolChannel<M> {
        &self.channel
    }

    fn execution_progress(&self) -> &ExecutionProgress {
        &self.execution_progress
    }

    fn clone_for_worker(&self, worker_id: WorkerID) -> Self {
        Self {
            n_workers: self.n_workers,
            channel: self.channel.clone_for_worker(worker_id),
            execution_progress: self.execution_progress.clone(),
        }
    }
}

impl<M> ThreadPoolChannel<M> {
    fn new(capacity: NonZeroUsize, execution_progress: Arc<ExecutionProgress>) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.get());
        Self {
            owning_worker_id: None,
            sender,
            receiver,
            execution_progress,
        }
    }

    /// Sends an instruction to execute the task with the given message to the
    /// receiving queue shared between the workers. The first available worker
    /// will execute the task once with the given message.
    ///
    /// # Errors
    /// Returns an error if the queue is full or has become disconnected, or if
    /// the pool is currently shutting down.
    fn send_execute_instruction(&self, message: M) -> ThreadPoolResult {
        self.execution_progress.add_to_pending_task_count(1);

        if self.execution_progress.is_shutting_down() {
            self.execution_progress.register_completed_tasks(1);
            return Err(ThreadPoolError::TaskScheduledDuringShutdown);
        }

        self.try_send_instruction(WorkerInstruction::Execute(message))
            .inspect_err(|_| {
                self.execution_progress.register_completed_tasks(1);
            })
    }

    fn try_send_instruction(&self, instruction: WorkerInstruction<M>) -> ThreadPoolResult {
        self.sender.try_send(instruction).map_err(|err| match err {
            TrySendError::Full(_) => ThreadPoolError::QueueFull,
            TrySendError::Disconnected(_) => ThreadPoolError::ChannelDisconnected,
        })
    }

    /// Returns `None` if the channel was disconnected.
    fn wait_for_next_instruction(&self) -> Option<WorkerInstruction<M>> {
        self.receiver.recv().ok()
    }

    /// # Panics
    /// If called on a [`ThreadPoolChannel`] that has not been assigned to a
    /// worker thread.
    fn owning_worker_id(&self) -> WorkerID {
        self.owning_worker_id.unwrap()
    }

    fn clone_for_worker(&self, worker_id: WorkerID) -> Self {
        Self {
            owning_worker_id: Some(worker_id),
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            execution_progress: self.execution_progress.clone(),
        }
    }
}

impl ExecutionProgress {
    fn new() -> Self {
        Self {
            pending_task_count: AtomicUsize::new(0),
            wait_mutex: Mutex::default(),
            no_pending_tasks_condvar: Condvar::new(),
            is_shutting_down: AtomicBool::new(false),
        }
    }

    fn add_to_pending_task_count(&self, n_tasks: usize) {
        if n_tasks == 0 {
            return;
        }
        self.pending_task_count.fetch_add(n_tasks, Ordering::AcqRel);
    }

    /// # Panics
    /// If the count is attempted to be decremented below zero.
    fn register_completed_tasks(&self, n_tasks: usize) {
        if n_tasks == 0 {
            return;
        }

        let previous_count = self.pending_task_count.fetch_sub(n_tasks, Ordering::AcqRel);
        assert!(
            previous_count >= n_tasks,
            "underflow when registering executed tasks"
        );

        if previous_count == n_tasks {
            // Acquire the wait mutex before notifying so a waiter that just
            // checked the count can't miss this wakeup.
            let _guard = self.wait_mutex.lock();
            self.no_pending_tasks_condvar.notify_all();
        }
    }

    fn wait_for_no_pending_tasks(&self) {
        if self.pending_task_count.load(Ordering::Acquire) == 0 {
            return;
        }

        let mut guard = self.wait_mutex.lock();
        while self.pending_task_count.load(Ordering::Acquire) != 0 {
            self.no_pending_tasks_condvar.wait(&mut guard);
        }
    }

    #[cfg(test)]
    fn pending_task_count(&self) -> usize {
        self.pending_task_count.load(Ordering::Acquire)
    }

    fn report_shutdown_started(&self) {
        self.is_shutting_down.store(true, Ordering::Release);
    }

    fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Acquire)
    }
}

impl From<WorkerID> for u64 {
    fn from(id: WorkerID) -> Self {
        id.0
    }
}

impl fmt::Display for WorkerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
