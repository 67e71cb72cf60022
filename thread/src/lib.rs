//! Thread pool execution and completion signals.
//!
//! This crate provides the concrete [`Executor`] implementation the
//! scheduling crate runs on top of: a fixed pool of worker threads
//! ([`pool::ThreadPool`]), one-shot completion signals with fan-in support
//! ([`signal::CompletionSignal`]), and an explicit single-fire gate
//! ([`signal::Latch`]).

pub mod executor;
pub mod pool;
pub mod signal;

pub use executor::{Executor, ThreadPoolExecutor, Work};
pub use pool::{DynamicTask, DynamicThreadPool, ThreadPool, ThreadPoolError};
pub use signal::{CompletionSignal, Latch, Outcome};
