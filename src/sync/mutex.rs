//! Mutual exclusion with timed acquisition
//!
//! [`Mutex`] permits barging: `unlock` wakes the eldest waiter, but the
//! waiter re-attempts acquisition and can lose to a fresh `lock` call that
//! slipped in between. Callers that need strict FIFO handoff use
//! [`FairMutex`], which transfers ownership directly to the eldest waiter
//! on unlock.
//!
//! Neither type tracks an owner: `unlock` is valid from any routine, and
//! unlocking an unlocked mutex fails with `mutex.not-locked`.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::config::MutexConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::validate::Timeout;

struct LockWaiter {
    ticket: u64,
    tx: oneshot::Sender<()>,
}

struct MutexState {
    locked: bool,
    waiters: VecDeque<LockWaiter>,
    next_ticket: u64,
}

impl MutexState {
    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    /// Wake the eldest live waiter, skipping any whose receiver is gone.
    fn wake_next(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(()).is_ok() {
                break;
            }
        }
    }
}

struct MutexInner {
    default_timeout: Timeout,
    state: parking_lot::Mutex<MutexState>,
}

/// A barging mutex with timed acquisition.
pub struct Mutex {
    inner: Arc<MutexInner>,
}

impl Clone for Mutex {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Mutex {
    pub fn new(config: MutexConfig) -> RuntimeResult<Self> {
        let default_timeout = config.validate()?;
        Ok(Self {
            inner: Arc::new(MutexInner {
                default_timeout,
                state: parking_lot::Mutex::new(MutexState {
                    locked: false,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
            }),
        })
    }

    /// Lock with the configured default timeout.
    pub async fn lock(&self) -> RuntimeResult<()> {
        self.lock_timeout(self.inner.default_timeout).await
    }

    /// Lock, waiting at most `timeout`.
    pub async fn lock_timeout(&self, timeout: Timeout) -> RuntimeResult<()> {
        if timeout == Timeout::NonBlocking {
            return if self.try_lock() {
                Ok(())
            } else {
                Err(RuntimeError::MutexLockTimeout { timeout_ms: 0 })
            };
        }
        let deadline = timeout
            .as_duration()
            .map(|d| tokio::time::Instant::now() + d);

        loop {
            let (ticket, rx) = {
                let mut state = self.inner.state.lock();
                if !state.locked {
                    state.locked = true;
                    return Ok(());
                }
                let ticket = state.take_ticket();
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(LockWaiter { ticket, tx });
                (ticket, rx)
            };

            let woken = match deadline {
                None => rx.await.is_ok(),
                Some(at) => matches!(tokio::time::timeout_at(at, rx).await, Ok(Ok(()))),
            };

            if !woken {
                let mut state = self.inner.state.lock();
                let before = state.waiters.len();
                state.waiters.retain(|w| w.ticket != ticket);
                if state.waiters.len() == before && !state.locked {
                    // Our wakeup was consumed by the timer race; pass it on.
                    state.wake_next();
                }
                return Err(RuntimeError::MutexLockTimeout {
                    timeout_ms: timeout.millis(),
                });
            }
            // Woken, but barging is allowed: re-attempt from the top.
        }
    }

    /// Non-blocking acquisition.
    pub fn try_lock(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }

    /// Release the mutex and wake the eldest waiter.
    pub fn unlock(&self) -> RuntimeResult<()> {
        let mut state = self.inner.state.lock();
        if !state.locked {
            return Err(RuntimeError::MutexNotLocked);
        }
        state.locked = false;
        state.wake_next();
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().locked
    }
}

struct FairMutexState {
    locked: bool,
    waiters: VecDeque<LockWaiter>,
    next_ticket: u64,
}

impl FairMutexState {
    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    /// Hand the lock straight to the eldest live waiter; unlock if none.
    fn hand_off_or_unlock(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(()).is_ok() {
                // Ownership transferred; the lock stays held.
                return;
            }
        }
        self.locked = false;
    }
}

struct FairMutexInner {
    default_timeout: Timeout,
    state: parking_lot::Mutex<FairMutexState>,
}

/// A strict-FIFO mutex: unlock transfers ownership to the eldest waiter.
pub struct FairMutex {
    inner: Arc<FairMutexInner>,
}

impl Clone for FairMutex {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl FairMutex {
    pub fn new(config: MutexConfig) -> RuntimeResult<Self> {
        let default_timeout = config.validate()?;
        Ok(Self {
            inner: Arc::new(FairMutexInner {
                default_timeout,
                state: parking_lot::Mutex::new(FairMutexState {
                    locked: false,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
            }),
        })
    }

    pub async fn lock(&self) -> RuntimeResult<()> {
        self.lock_timeout(self.inner.default_timeout).await
    }

    pub async fn lock_timeout(&self, timeout: Timeout) -> RuntimeResult<()> {
        if timeout == Timeout::NonBlocking {
            return if self.try_lock() {
                Ok(())
            } else {
                Err(RuntimeError::MutexLockTimeout { timeout_ms: 0 })
            };
        }

        let (ticket, rx) = {
            let mut state = self.inner.state.lock();
            if !state.locked {
                state.locked = true;
                return Ok(());
            }
            let ticket = state.take_ticket();
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(LockWaiter { ticket, tx });
            (ticket, rx)
        };

        let granted = match timeout.as_duration() {
            None => rx.await.is_ok(),
            Some(duration) => matches!(
                tokio::time::timeout(duration, rx).await,
                Ok(Ok(()))
            ),
        };

        if granted {
            return Ok(());
        }

        let mut state = self.inner.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.ticket != ticket);
        if state.waiters.len() == before {
            // The grant raced the timer: we own the lock but have already
            // timed out, so pass ownership on.
            state.hand_off_or_unlock();
        }
        Err(RuntimeError::MutexLockTimeout {
            timeout_ms: timeout.millis(),
        })
    }

    pub fn try_lock(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }

    pub fn unlock(&self) -> RuntimeResult<()> {
        let mut state = self.inner.state.lock();
        if !state.locked {
            return Err(RuntimeError::MutexNotLocked);
        }
        state.hand_off_or_unlock();
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mutex() -> Mutex {
        Mutex::new(MutexConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn lock_unlock_balance() {
        let m = mutex();
        m.lock().await.unwrap();
        assert!(m.is_locked());
        m.unlock().unwrap();
        assert!(!m.is_locked());
    }

    #[tokio::test]
    async fn unlock_without_lock_fails() {
        let m = mutex();
        assert_eq!(m.unlock().unwrap_err().code(), "mutex.not-locked");
    }

    #[tokio::test]
    async fn try_lock_respects_holder() {
        let m = mutex();
        assert!(m.try_lock());
        assert!(!m.try_lock());
        m.unlock().unwrap();
        assert!(m.try_lock());
        m.unlock().unwrap();
    }

    #[tokio::test]
    async fn lock_timeout_fires() {
        let m = mutex();
        m.lock().await.unwrap();
        let err = m.lock_timeout(Timeout::Millis(20)).await.unwrap_err();
        assert_eq!(err.code(), "mutex.lock-timeout");
        assert!(m.is_locked());
    }

    #[tokio::test]
    async fn contended_lock_eventually_acquires() {
        let m = mutex();
        m.lock().await.unwrap();

        let m2 = m.clone();
        let waiter = tokio::spawn(async move {
            m2.lock_timeout(Timeout::Millis(500)).await.unwrap();
            m2.unlock().unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        m.unlock().unwrap();
        waiter.await.unwrap();
        assert!(!m.is_locked());
    }

    #[tokio::test]
    async fn fair_mutex_hands_off_in_fifo_order() {
        let m = FairMutex::new(MutexConfig::default()).unwrap();
        m.lock().await.unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let m = m.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                m.lock_timeout(Timeout::Millis(1000)).await.unwrap();
                order.lock().push(i);
                m.unlock().unwrap();
            }));
            // Queue them in a deterministic order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        m.unlock().unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn fair_mutex_timeout_leaves_lock_usable() {
        let m = FairMutex::new(MutexConfig::default()).unwrap();
        m.lock().await.unwrap();
        let err = m.lock_timeout(Timeout::Millis(20)).await.unwrap_err();
        assert_eq!(err.code(), "mutex.lock-timeout");
        m.unlock().unwrap();
        assert!(!m.is_locked());
        assert!(m.try_lock());
        m.unlock().unwrap();
    }
}
