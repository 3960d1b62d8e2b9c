//! One-shot execution with a shared outcome
//!
//! The first caller runs the function; every concurrent and subsequent
//! caller observes the same outcome. An error outcome is sticky: the once
//! is done and the error replays to later callers. A panic inside the
//! function is captured and stored as `routine.panic`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::{panic_message, RuntimeError, RuntimeResult};

enum OnceState<T> {
    Idle,
    Running,
    Done(RuntimeResult<T>),
}

struct OnceInner<T> {
    state: parking_lot::Mutex<OnceState<T>>,
    notify: Notify,
}

/// Runs a function at most once; all callers share the outcome.
pub struct Once<T> {
    inner: Arc<OnceInner<T>>,
}

impl<T> Clone for Once<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for Once<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Once<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(OnceInner {
                state: parking_lot::Mutex::new(OnceState::Idle),
                notify: Notify::new(),
            }),
        }
    }

    /// Whether the function has finished (successfully or not).
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), OnceState::Done(_))
    }

    /// Run `f` if nobody has; otherwise wait for and share its outcome.
    pub async fn call<F, Fut>(&self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        enum Claim {
            Runner,
            Waiter,
        }

        let claim = {
            let mut state = self.inner.state.lock();
            match &*state {
                OnceState::Done(result) => return result.clone(),
                OnceState::Running => Claim::Waiter,
                OnceState::Idle => {
                    *state = OnceState::Running;
                    Claim::Runner
                }
            }
        };

        match claim {
            Claim::Runner => {
                let result = match std::panic::AssertUnwindSafe(f()).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(RuntimeError::RoutinePanic {
                        message: panic_message(payload),
                    }),
                };
                *self.inner.state.lock() = OnceState::Done(result.clone());
                self.inner.notify.notify_waiters();
                result
            }
            Claim::Waiter => loop {
                let mut notified: Pin<Box<Notified<'_>>> =
                    Box::pin(self.inner.notify.notified());
                notified.as_mut().enable();
                if let OnceState::Done(result) = &*self.inner.state.lock() {
                    return result.clone();
                }
                notified.await;
            },
        }
    }
}
