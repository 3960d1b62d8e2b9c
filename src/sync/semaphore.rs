//! Counting semaphore with strict FIFO admission
//!
//! Permits live in `[0, max]`. `release` hands a permit straight to the
//! eldest queued acquirer; only when nobody waits does the available count
//! grow. `reset` rejects every queued acquirer with `semaphore.reset` and
//! restores the full permit count.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::warn;

use crate::config::SemaphoreConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::validate::Timeout;

struct SemWaiter {
    ticket: u64,
    tx: oneshot::Sender<RuntimeResult<()>>,
}

struct SemState {
    available: usize,
    waiters: VecDeque<SemWaiter>,
    next_ticket: u64,
}

struct SemaphoreInner {
    max_permits: usize,
    default_timeout: Timeout,
    name: Option<String>,
    state: parking_lot::Mutex<SemState>,
}

/// A counting semaphore with timed acquisition and FIFO fairness.
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Clone for Semaphore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Semaphore {
    pub fn new(config: SemaphoreConfig) -> RuntimeResult<Self> {
        let (permits, default_timeout) = config.validate()?;
        Ok(Self {
            inner: Arc::new(SemaphoreInner {
                max_permits: permits,
                default_timeout,
                name: config.name,
                state: parking_lot::Mutex::new(SemState {
                    available: permits,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
            }),
        })
    }

    /// Acquire a permit with the default timeout.
    pub async fn acquire(&self) -> RuntimeResult<()> {
        self.acquire_timeout(self.inner.default_timeout).await
    }

    /// Acquire a permit, waiting at most `timeout`.
    pub async fn acquire_timeout(&self, timeout: Timeout) -> RuntimeResult<()> {
        if timeout == Timeout::NonBlocking {
            return if self.try_acquire() {
                Ok(())
            } else {
                Err(RuntimeError::SemaphoreTimeout { timeout_ms: 0 })
            };
        }

        let (ticket, rx) = {
            let mut state = self.inner.state.lock();
            if state.available > 0 {
                state.available -= 1;
                return Ok(());
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(SemWaiter { ticket, tx });
            (ticket, rx)
        };

        let outcome = match timeout.as_duration() {
            None => Some(rx.await),
            Some(duration) => tokio::time::timeout(duration, rx).await.ok(),
        };

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(RuntimeError::Internal(
                "semaphore waiter dropped without resolution".to_string(),
            )),
            None => {
                let mut state = self.inner.state.lock();
                let before = state.waiters.len();
                state.waiters.retain(|w| w.ticket != ticket);
                if state.waiters.len() == before {
                    // The grant raced the timer: hand the permit back.
                    Self::release_locked(&mut state, self.inner.max_permits);
                }
                Err(RuntimeError::SemaphoreTimeout {
                    timeout_ms: timeout.millis(),
                })
            }
        }
    }

    /// Take a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.available > 0 {
            state.available -= 1;
            true
        } else {
            false
        }
    }

    /// Return a permit, waking the eldest queued acquirer if any.
    pub fn release(&self) {
        let mut state = self.inner.state.lock();
        Self::release_locked(&mut state, self.inner.max_permits);
    }

    fn release_locked(state: &mut SemState, max_permits: usize) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(Ok(())).is_ok() {
                // Permit handed over directly; available is unchanged.
                return;
            }
        }
        if state.available < max_permits {
            state.available += 1;
        } else {
            warn!("semaphore release beyond max permits ignored");
        }
    }

    /// Reject all queued acquirers and restore the full permit count.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        let waiters = std::mem::take(&mut state.waiters);
        state.available = self.inner.max_permits;
        drop(state);
        for waiter in waiters {
            let _ = waiter.tx.send(Err(RuntimeError::SemaphoreReset));
        }
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Maximum permit count.
    pub fn max_permits(&self) -> usize {
        self.inner.max_permits
    }

    /// Debug name, if configured.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }
}
