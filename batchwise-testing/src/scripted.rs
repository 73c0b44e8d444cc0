//! Operations that play back a fixed script of outcomes.

use std::collections::VecDeque;
use std::future::{ready, Future};
use std::sync::atomic::{AtomicU32, Ordering};

use batchwise::{Operation, TransportFailure};
use parking_lot::Mutex;

/// An [`Operation`] returning scripted outcomes in order, then repeating a
/// final outcome forever.
#[derive(Debug)]
pub struct ScriptedOperation<T> {
    script: Mutex<VecDeque<Result<T, TransportFailure>>>,
    then: Result<T, TransportFailure>,
    calls: AtomicU32,
}

impl<T: Clone> ScriptedOperation<T> {
    /// Play `script`, then return `then` on every later call.
    pub fn new(
        script: impl IntoIterator<Item = Result<T, TransportFailure>>,
        then: Result<T, TransportFailure>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            then,
            calls: AtomicU32::new(0),
        }
    }

    /// Fail with each of `failures` in turn, then succeed with `value`.
    pub fn failing_then_succeeding(failures: Vec<TransportFailure>, value: T) -> Self {
        Self::new(failures.into_iter().map(Err), Ok(value))
    }

    /// Fail with `failure` on every call.
    pub fn always_failing(failure: TransportFailure) -> Self {
        Self::new([], Err(failure))
    }

    /// Number of calls so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<T> Operation for ScriptedOperation<T>
where
    T: Clone + Send,
{
    type Output = T;
    type Failure = TransportFailure;

    fn call(&self) -> impl Future<Output = Result<T, TransportFailure>> + Send {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.then.clone());
        ready(next)
    }
}
