//! Response barrier.
//!
//! A [`Barrier`] collects up to `expected` responses and invokes its
//! completion handler exactly once: either when the expected count has
//! arrived or when the timeout elapses, whichever comes first. Responses
//! offered after completion are dropped.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

type CompletionHandler<T> = Box<dyn FnOnce(Vec<T>) + Send>;

struct State<T> {
    expected: usize,
    responses: Vec<T>,
    on_complete: Option<CompletionHandler<T>>,
    timer: Option<JoinHandle<()>>,
}

impl<T> State<T> {
    /// Take the handler and collected responses if still pending.
    fn finish(&mut self) -> Option<(CompletionHandler<T>, Vec<T>)> {
        let handler = self.on_complete.take()?;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        Some((handler, std::mem::take(&mut self.responses)))
    }
}

/// Collects a bounded, time-limited set of responses.
///
/// Must be created inside a Tokio runtime: the timeout runs as a spawned task.
/// The timer holds its own reference, so dropping the barrier does not cancel
/// completion.
pub struct Barrier<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T: Send + 'static> Barrier<T> {
    /// Create a barrier expecting `expected` responses within `timeout`.
    ///
    /// With `expected == 0` the handler runs immediately with no responses.
    pub fn new<F>(expected: usize, timeout: Duration, on_complete: F) -> Self
    where
        F: FnOnce(Vec<T>) + Send + 'static,
    {
        let barrier = Self {
            state: Arc::new(Mutex::new(State {
                expected,
                responses: Vec::with_capacity(expected),
                on_complete: Some(Box::new(on_complete)),
                timer: None,
            })),
        };

        if expected == 0 {
            barrier.complete();
            return barrier;
        }

        let state = Arc::clone(&barrier.state);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let finished = {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                // Our own handle; nothing to abort.
                guard.timer.take();
                guard.finish()
            };
            if let Some((handler, responses)) = finished {
                handler(responses);
            }
        });

        let mut guard = barrier.lock();
        if guard.on_complete.is_some() {
            guard.timer = Some(timer);
        }
        drop(guard);

        barrier
    }

    /// Offer one response. Returns `false` if the barrier already completed
    /// and the response was dropped.
    pub fn offer(&self, response: T) -> bool {
        let finished = {
            let mut guard = self.lock();
            if guard.on_complete.is_none() {
                return false;
            }
            guard.responses.push(response);
            if guard.responses.len() >= guard.expected {
                guard.finish()
            } else {
                None
            }
        };
        if let Some((handler, responses)) = finished {
            handler(responses);
        }
        true
    }

    /// Whether the completion handler has run (or is running).
    pub fn is_complete(&self) -> bool {
        self.lock().on_complete.is_none()
    }

    /// Number of responses collected so far. Zero after completion.
    pub fn collected(&self) -> usize {
        self.lock().responses.len()
    }

    fn complete(&self) {
        let finished = self.lock().finish();
        if let Some((handler, responses)) = finished {
            handler(responses);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
