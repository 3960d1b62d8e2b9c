//! Counter-based completion barrier
//!
//! `add` moves the counter, `wait` parks until it crosses zero. The counter
//! can never go negative; the offending `add`/`done` fails and leaves the
//! counter untouched. A drained group is immediately reusable.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{RuntimeError, RuntimeResult};
use crate::validate::Timeout;

struct WgWaiter {
    ticket: u64,
    tx: oneshot::Sender<()>,
}

struct WgState {
    counter: i64,
    waiters: VecDeque<WgWaiter>,
    next_ticket: u64,
}

/// A reusable wait group.
pub struct WaitGroup {
    inner: Arc<parking_lot::Mutex<WgState>>,
}

impl Clone for WaitGroup {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(WgState {
                counter: 0,
                waiters: VecDeque::new(),
                next_ticket: 0,
            })),
        }
    }

    /// Move the counter by `delta`. Reaching zero releases every waiter.
    pub fn add(&self, delta: i64) -> RuntimeResult<()> {
        let mut state = self.inner.lock();
        let next = state.counter + delta;
        if next < 0 {
            return Err(RuntimeError::WaitGroupNegative {
                counter: state.counter,
                delta,
            });
        }
        state.counter = next;
        if next == 0 {
            let waiters = std::mem::take(&mut state.waiters);
            drop(state);
            for waiter in waiters {
                let _ = waiter.tx.send(());
            }
        }
        Ok(())
    }

    /// Equivalent to `add(-1)`.
    pub fn done(&self) -> RuntimeResult<()> {
        self.add(-1)
    }

    /// Current counter value.
    pub fn count(&self) -> i64 {
        self.inner.lock().counter
    }

    /// Park until the counter reaches zero.
    pub async fn wait(&self) -> RuntimeResult<()> {
        self.wait_timeout(Timeout::Infinite).await
    }

    /// Park until the counter reaches zero, at most `timeout`.
    pub async fn wait_timeout(&self, timeout: Timeout) -> RuntimeResult<()> {
        let (ticket, rx) = {
            let mut state = self.inner.lock();
            if state.counter == 0 {
                return Ok(());
            }
            if timeout == Timeout::NonBlocking {
                return Err(RuntimeError::WaitGroupWaitTimeout { timeout_ms: 0 });
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(WgWaiter { ticket, tx });
            (ticket, rx)
        };

        let outcome = match timeout.as_duration() {
            None => Some(rx.await),
            Some(duration) => tokio::time::timeout(duration, rx).await.ok(),
        };

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(RuntimeError::Internal(
                "waitgroup waiter dropped without resolution".to_string(),
            )),
            None => {
                let mut state = self.inner.lock();
                state.waiters.retain(|w| w.ticket != ticket);
                Err(RuntimeError::WaitGroupWaitTimeout {
                    timeout_ms: timeout.millis(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_when_counter_drains() {
        let wg = WaitGroup::new();
        wg.add(2).unwrap();

        let wg_worker = wg.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            wg_worker.done().unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            wg_worker.done().unwrap();
        });

        wg.wait_timeout(Timeout::Millis(1000)).await.unwrap();
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    async fn wait_on_zero_counter_returns_immediately() {
        let wg = WaitGroup::new();
        wg.wait().await.unwrap();
    }

    #[tokio::test]
    async fn negative_counter_is_rejected() {
        let wg = WaitGroup::new();
        let err = wg.done().unwrap_err();
        assert_eq!(err.code(), "waitgroup.negative");
        assert_eq!(wg.count(), 0);

        wg.add(1).unwrap();
        let err = wg.add(-2).unwrap_err();
        assert_eq!(err.code(), "waitgroup.negative");
        assert_eq!(wg.count(), 1);
        wg.done().unwrap();
    }

    #[tokio::test]
    async fn wait_timeout_fires() {
        let wg = WaitGroup::new();
        wg.add(1).unwrap();
        let err = wg.wait_timeout(Timeout::Millis(20)).await.unwrap_err();
        assert_eq!(err.code(), "waitgroup.wait-timeout");
        wg.done().unwrap();
    }

    #[tokio::test]
    async fn group_is_reusable_after_draining() {
        let wg = WaitGroup::new();
        wg.add(1).unwrap();
        wg.done().unwrap();
        wg.wait().await.unwrap();

        wg.add(1).unwrap();
        let wg_worker = wg.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            wg_worker.done().unwrap();
        });
        wg.wait_timeout(Timeout::Millis(1000)).await.unwrap();
    }
}
