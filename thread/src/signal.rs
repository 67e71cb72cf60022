//! One-shot completion signals.

use parking_lot::{Condvar, Mutex};
use std::{fmt, sync::Arc};

/// The result a [`CompletionSignal`] settles to.
///
/// `Cancelled` carries the cause of the upstream failure or cancellation that
/// prevented the associated work from running at all.
#[derive(Clone)]
pub enum Outcome {
    Success,
    Failed(Arc<dyn std::error::Error + Send + Sync>),
    Cancelled(Arc<dyn std::error::Error + Send + Sync>),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The cause to attribute to anything downstream of this outcome, if any.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        match self {
            Self::Success => None,
            Self::Failed(cause) | Self::Cancelled(cause) => Some(cause.as_ref()),
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Failed(cause) => write!(f, "Failed({cause})"),
            Self::Cancelled(cause) => write!(f, "Cancelled({cause})"),
        }
    }
}

type Waiter = Box<dyn FnOnce(Outcome) + Send>;

struct SignalState {
    outcome: Option<Outcome>,
    waiters: Vec<Waiter>,
}

struct SignalInner {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

/// A one-shot, cloneable completion indicator for a single unit of work.
///
/// Any number of downstream consumers may observe the same signal, either by
/// blocking on [`wait`](Self::wait) or by registering a callback with
/// [`on_complete`](Self::on_complete); both are safe to call both before and
/// after the signal has settled.
#[derive(Clone)]
pub struct CompletionSignal(Arc<SignalInner>);

impl CompletionSignal {
    /// Creates a signal that has not yet settled.
    pub fn pending() -> Self {
        Self(Arc::new(SignalInner {
            state: Mutex::new(SignalState {
                outcome: None,
                waiters: Vec::new(),
            }),
            condvar: Condvar::new(),
        }))
    }

    /// Creates a signal that is already complete.
    pub fn ready() -> Self {
        let signal = Self::pending();
        signal.complete(Outcome::Success);
        signal
    }

    /// Settles this signal. Idempotent calls beyond the first are ignored;
    /// in practice every signal is completed from exactly one place (the
    /// executor dispatching the work it was created for).
    pub fn complete(&self, outcome: Outcome) {
        let waiters = {
            // Hold the lock only long enough to record the outcome and take
            // the waiter list; waiters run outside the lock so a waiter that
            // itself touches this signal can't deadlock.
            let mut state = self.0.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.waiters)
        };
        self.0.condvar.notify_all();
        for waiter in waiters {
            waiter(outcome.clone());
        }
    }

    /// Returns the outcome if the signal has already settled.
    pub fn outcome(&self) -> Option<Outcome> {
        self.0.state.lock().outcome.clone()
    }

    /// Blocks the calling thread until the signal settles, then returns its
    /// outcome.
    pub fn wait(&self) -> Outcome {
        let mut state = self.0.state.lock();
        while state.outcome.is_none() {
            self.0.condvar.wait(&mut state);
        }
        state.outcome.clone().unwrap()
    }

    /// Registers `f` to run with the outcome once the signal settles. Calls
    /// `f` immediately, without blocking, if the signal has already settled.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let mut state = self.0.state.lock();
        match &state.outcome {
            Some(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                f(outcome);
            }
            None => state.waiters.push(Box::new(f)),
        }
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome() {
            Some(outcome) => f.debug_tuple("CompletionSignal").field(&outcome).finish(),
            None => write!(f, "CompletionSignal(Pending)"),
        }
    }
}

/// An explicit single-fire gate.
///
/// Replaces the mutex-as-signal idiom where a mutex is locked before wiring a
/// graph of continuations and unlocked afterward to let the first one
/// through: that conflates mutual exclusion with one-shot notification and
/// is easy to get wrong (forgetting the unlock, or unlocking from the wrong
/// thread). A `Latch` only ever does one thing: block everyone waiting on it
/// until [`fire`](Self::fire) is called, exactly once.
#[derive(Debug)]
pub struct Latch {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Opens the latch. Subsequent calls are no-ops.
    pub fn fire(&self) {
        let mut fired = self.mutex.lock();
        if *fired {
            return;
        }
        *fired = true;
        self.condvar.notify_all();
    }

    /// Blocks until [`fire`](Self::fire) has been called.
    pub fn wait(&self) {
        let mut fired = self.mutex.lock();
        while !*fired {
            self.condvar.wait(&mut fired);
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    fn test_error(message: &str) -> Arc<dyn std::error::Error + Send + Sync> {
        Arc::new(io::Error::other(message.to_string()))
    }

    #[test]
    fn ready_signal_is_already_complete() {
        let signal = CompletionSignal::ready();
        assert!(signal.outcome().unwrap().is_success());
    }

    #[test]
    fn pending_signal_has_no_outcome_until_completed() {
        let signal = CompletionSignal::pending();
        assert!(signal.outcome().is_none());
        signal.complete(Outcome::Success);
        assert!(signal.outcome().unwrap().is_success());
    }

    #[test]
    fn wait_blocks_until_completion() {
        let signal = CompletionSignal::pending();
        let waiter = signal.clone();
        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(Duration::from_millis(20));
        signal.complete(Outcome::Success);

        assert!(handle.join().unwrap().is_success());
    }

    #[test]
    fn on_complete_fires_immediately_for_settled_signal() {
        let signal = CompletionSignal::ready();
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_clone = Arc::clone(&observed);
        signal.on_complete(move |_| {
            observed_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_complete_fires_after_later_completion() {
        let signal = CompletionSignal::pending();
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_clone = Arc::clone(&observed);
        signal.on_complete(move |_| {
            observed_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        signal.complete(Outcome::Success);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_outcome_carries_the_cause() {
        let signal = CompletionSignal::pending();
        signal.complete(Outcome::Cancelled(test_error("upstream failed")));
        let outcome = signal.outcome().unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.cause().unwrap().to_string(), "upstream failed");
    }

    #[test]
    fn latch_blocks_until_fired() {
        let latch = Arc::new(Latch::new());
        let waiter = Arc::clone(&latch);
        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(Duration::from_millis(20));
        latch.fire();

        handle.join().unwrap();
    }

    #[test]
    fn latch_fire_is_idempotent() {
        let latch = Latch::new();
        latch.fire();
        latch.fire();
        latch.wait();
    }
}
