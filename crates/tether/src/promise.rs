//! Single-assignment, multi-waiter futures.
//!
//! A [`Promise`] is the one inter-thread suspension point in the reference
//! context: a caller blocks (or attaches a callback) on a promise that a
//! different thread, handling the corresponding inbound message, later
//! completes. Completing twice is an error; failure reaches every waiter
//! exactly once.

use crate::error::RefError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(&Result<T, RefError>) + Send>;

enum State<T> {
    Pending { callbacks: Vec<Callback<T>> },
    Done(Result<T, RefError>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// A single-assignment value observable by any number of waiters.
///
/// Clones share the same underlying slot. Callbacks registered with
/// [`Promise::then`] run on the completing thread, strictly outside the
/// promise's internal lock; waiters blocked in [`Promise::wait`] are woken
/// by the same completion.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Creates an unfulfilled promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending {
                    callbacks: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Creates an already-completed promise.
    pub fn ready(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Done(Ok(value))),
                cond: Condvar::new(),
            }),
        }
    }

    /// Completes the promise with a value.
    ///
    /// Returns [`RefError::AlreadyCompleted`] if the promise was already
    /// fulfilled or failed.
    pub fn complete(&self, value: T) -> Result<(), RefError> {
        self.finish(Ok(value))
    }

    /// Fails the promise. Every current and future waiter observes the
    /// error.
    pub fn fail(&self, error: RefError) -> Result<(), RefError> {
        self.finish(Err(error))
    }

    fn finish(&self, result: Result<T, RefError>) -> Result<(), RefError> {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return Err(RefError::AlreadyCompleted),
                State::Pending { callbacks } => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(result.clone());
                    self.inner.cond.notify_all();
                    callbacks
                }
            }
        };
        for callback in callbacks {
            callback(&result);
        }
        Ok(())
    }

    /// True once the promise has been completed or failed.
    pub fn is_complete(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    /// Blocks the calling thread until the promise completes.
    pub fn wait(&self) -> Result<T, RefError> {
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return result.clone();
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Blocks until the promise completes or `timeout` elapses.
    ///
    /// Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, RefError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return Some(result.clone());
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    State::Done(result) => Some(result.clone()),
                    State::Pending { .. } => None,
                };
            }
        }
    }

    /// Runs `f` with the result once available.
    ///
    /// If the promise is already complete, `f` runs immediately on the
    /// calling thread; otherwise it runs on the completing thread. The
    /// callback is dropped after it runs, so chained promises do not
    /// accumulate state across completions.
    pub fn then<F>(&self, f: F)
    where
        F: FnOnce(&Result<T, RefError>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending { callbacks } => {
                callbacks.push(Box::new(f));
            }
            State::Done(result) => {
                let result = result.clone();
                drop(state);
                f(&result);
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl Promise<()> {
    /// Combines `entries` into one promise that completes once every entry
    /// has completed (successfully or not).
    ///
    /// Returns an already-completed promise for an empty list. The entry
    /// promises are consumed; only a counter survives until the merged
    /// promise fires.
    pub fn join(entries: Vec<Promise<()>>) -> Promise<()> {
        if entries.is_empty() {
            return Promise::ready(());
        }
        let merged = Promise::new();
        let remaining = Arc::new(AtomicUsize::new(entries.len()));
        for entry in entries {
            let merged = merged.clone();
            let remaining = Arc::clone(&remaining);
            entry.then(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let _ = merged.complete(());
                }
            });
        }
        merged
    }
}
