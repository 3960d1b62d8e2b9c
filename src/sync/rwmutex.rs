//! Read-write mutex with writer priority
//!
//! Readers share the lock up to `max_readers`; writers are exclusive. The
//! moment a writer queues, new readers queue behind it, so a steady stream
//! of readers cannot starve a writer. When a writer unlocks, every pending
//! reader is granted as a batch before the next writer runs.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::config::RwMutexConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::validate::Timeout;

struct RwWaiter {
    ticket: u64,
    tx: oneshot::Sender<()>,
}

struct RwState {
    readers: usize,
    writer: bool,
    reader_queue: VecDeque<RwWaiter>,
    writer_queue: VecDeque<RwWaiter>,
    next_ticket: u64,
}

impl RwState {
    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    fn writer_waiting(&self) -> bool {
        !self.writer_queue.is_empty()
    }

    /// Admit queued readers up to the cap. Valid only with no writer held.
    /// Returns whether anyone was admitted.
    fn grant_reader_batch(&mut self, max_readers: usize) -> bool {
        let mut granted = false;
        while !self.reader_queue.is_empty() && self.readers < max_readers {
            let Some(waiter) = self.reader_queue.pop_front() else {
                break;
            };
            self.readers += 1;
            if waiter.tx.send(()).is_ok() {
                granted = true;
            } else {
                self.readers -= 1;
            }
        }
        granted
    }

    /// Hand the lock to the eldest live writer. Requires an idle lock.
    fn grant_writer(&mut self) -> bool {
        while let Some(waiter) = self.writer_queue.pop_front() {
            self.writer = true;
            if waiter.tx.send(()).is_ok() {
                return true;
            }
            self.writer = false;
        }
        false
    }

    /// Grant whoever runs next. After a writer unlock the pending readers
    /// go first as a batch; after the reader count drains the eldest
    /// writer goes first. Queued readers only bypass the writer queue when
    /// it is empty (a waiting writer timed out and left).
    fn grant_next(&mut self, max_readers: usize, prefer_readers: bool) {
        if self.writer {
            return;
        }
        if prefer_readers {
            if self.grant_reader_batch(max_readers) {
                return;
            }
            if self.readers == 0 {
                self.grant_writer();
            }
        } else {
            if self.readers == 0 && self.grant_writer() {
                return;
            }
            if self.writer_queue.is_empty() {
                self.grant_reader_batch(max_readers);
            }
        }
    }
}

struct RwMutexInner {
    default_timeout: Timeout,
    max_readers: usize,
    state: parking_lot::Mutex<RwState>,
}

/// A shared/exclusive lock with writer priority and timed acquisition.
pub struct RwMutex {
    inner: Arc<RwMutexInner>,
}

impl Clone for RwMutex {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Grant {
    Immediate,
    TooManyReaders,
    Queued(u64, oneshot::Receiver<()>),
}

impl RwMutex {
    pub fn new(config: RwMutexConfig) -> RuntimeResult<Self> {
        let default_timeout = config.validate()?;
        Ok(Self {
            inner: Arc::new(RwMutexInner {
                default_timeout,
                max_readers: config.max_readers,
                state: parking_lot::Mutex::new(RwState {
                    readers: 0,
                    writer: false,
                    reader_queue: VecDeque::new(),
                    writer_queue: VecDeque::new(),
                    next_ticket: 0,
                }),
            }),
        })
    }

    /// Acquire a shared lock with the default timeout.
    pub async fn read_lock(&self) -> RuntimeResult<()> {
        self.read_lock_timeout(self.inner.default_timeout).await
    }

    /// Acquire a shared lock, waiting at most `timeout`.
    pub async fn read_lock_timeout(&self, timeout: Timeout) -> RuntimeResult<()> {
        if timeout == Timeout::NonBlocking {
            return if self.try_read_lock() {
                Ok(())
            } else {
                Err(RuntimeError::RwMutexReadLockTimeout { timeout_ms: 0 })
            };
        }

        let grant = {
            let mut state = self.inner.state.lock();
            if !state.writer && !state.writer_waiting() {
                if state.readers >= self.inner.max_readers {
                    Grant::TooManyReaders
                } else {
                    state.readers += 1;
                    Grant::Immediate
                }
            } else {
                let ticket = state.take_ticket();
                let (tx, rx) = oneshot::channel();
                state.reader_queue.push_back(RwWaiter { ticket, tx });
                Grant::Queued(ticket, rx)
            }
        };

        let (ticket, rx) = match grant {
            Grant::Immediate => return Ok(()),
            Grant::TooManyReaders => {
                return Err(RuntimeError::RwMutexTooManyReaders {
                    max_readers: self.inner.max_readers,
                })
            }
            Grant::Queued(ticket, rx) => (ticket, rx),
        };

        let granted = match timeout.as_duration() {
            None => rx.await.is_ok(),
            Some(duration) => matches!(tokio::time::timeout(duration, rx).await, Ok(Ok(()))),
        };
        if granted {
            return Ok(());
        }

        let mut state = self.inner.state.lock();
        let before = state.reader_queue.len();
        state.reader_queue.retain(|w| w.ticket != ticket);
        if state.reader_queue.len() == before {
            // Granted concurrently with the timer: give the read lock back.
            state.readers = state.readers.saturating_sub(1);
            state.grant_next(self.inner.max_readers, false);
        }
        Err(RuntimeError::RwMutexReadLockTimeout {
            timeout_ms: timeout.millis(),
        })
    }

    /// Shared lock without waiting.
    pub fn try_read_lock(&self) -> bool {
        let mut state = self.inner.state.lock();
        if !state.writer && !state.writer_waiting() && state.readers < self.inner.max_readers {
            state.readers += 1;
            true
        } else {
            false
        }
    }

    /// Release a shared lock.
    pub fn read_unlock(&self) -> RuntimeResult<()> {
        let mut state = self.inner.state.lock();
        if state.readers == 0 {
            return Err(RuntimeError::RwMutexNotReadLocked);
        }
        state.readers -= 1;
        if state.readers == 0 {
            state.grant_next(self.inner.max_readers, false);
        }
        Ok(())
    }

    /// Acquire the exclusive lock with the default timeout.
    pub async fn write_lock(&self) -> RuntimeResult<()> {
        self.write_lock_timeout(self.inner.default_timeout).await
    }

    /// Acquire the exclusive lock, waiting at most `timeout`.
    pub async fn write_lock_timeout(&self, timeout: Timeout) -> RuntimeResult<()> {
        if timeout == Timeout::NonBlocking {
            return if self.try_write_lock() {
                Ok(())
            } else {
                Err(RuntimeError::RwMutexWriteLockTimeout { timeout_ms: 0 })
            };
        }

        let (ticket, rx) = {
            let mut state = self.inner.state.lock();
            if !state.writer && state.readers == 0 {
                state.writer = true;
                return Ok(());
            }
            let ticket = state.take_ticket();
            let (tx, rx) = oneshot::channel();
            state.writer_queue.push_back(RwWaiter { ticket, tx });
            (ticket, rx)
        };

        let granted = match timeout.as_duration() {
            None => rx.await.is_ok(),
            Some(duration) => matches!(tokio::time::timeout(duration, rx).await, Ok(Ok(()))),
        };
        if granted {
            return Ok(());
        }

        let mut state = self.inner.state.lock();
        let before = state.writer_queue.len();
        state.writer_queue.retain(|w| w.ticket != ticket);
        if state.writer_queue.len() == before {
            // Granted concurrently with the timer: release and pass on.
            state.writer = false;
        }
        // Leaving the queue may unblock readers parked behind this writer.
        state.grant_next(self.inner.max_readers, false);
        Err(RuntimeError::RwMutexWriteLockTimeout {
            timeout_ms: timeout.millis(),
        })
    }

    /// Exclusive lock without waiting.
    pub fn try_write_lock(&self) -> bool {
        let mut state = self.inner.state.lock();
        if !state.writer && state.readers == 0 {
            state.writer = true;
            true
        } else {
            false
        }
    }

    /// Release the exclusive lock; pending readers are granted as a batch.
    pub fn write_unlock(&self) -> RuntimeResult<()> {
        let mut state = self.inner.state.lock();
        if !state.writer {
            return Err(RuntimeError::RwMutexNotWriteLocked);
        }
        state.writer = false;
        state.grant_next(self.inner.max_readers, true);
        Ok(())
    }

    /// Number of readers currently holding the lock.
    pub fn reader_count(&self) -> usize {
        self.inner.state.lock().readers
    }

    pub fn is_write_locked(&self) -> bool {
        self.inner.state.lock().writer
    }

    /// Whether any party holds the lock.
    pub fn is_locked(&self) -> bool {
        let state = self.inner.state.lock();
        state.writer || state.readers > 0
    }
}
