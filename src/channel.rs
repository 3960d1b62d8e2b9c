//! Bounded MPMC channel with close and timeout semantics
//!
//! A channel is a FIFO buffer plus two waiter queues. Senders and receivers
//! park in arrival order; a receiver always drains the buffer before taking
//! from a parked sender, so delivery order equals send-completion order.
//! Direct handoff to a parked receiver wins over buffering, which keeps
//! receivers from starving behind a full buffer.
//!
//! Every state change pulses a readiness notifier that the selector
//! subscribes to, so multi-way waits ride on wakeups instead of polling.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::ChannelConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::validate::Timeout;

/// Error returned by [`Channel::try_send`], handing the rejected value back.
#[derive(Debug)]
pub struct TrySendError<T> {
    /// The value that was not sent.
    pub value: T,
    /// Why it was not sent.
    pub error: RuntimeError,
}

impl<T> From<TrySendError<T>> for RuntimeError {
    fn from(err: TrySendError<T>) -> Self {
        err.error
    }
}

struct SendWaiter<T> {
    ticket: u64,
    value: Option<T>,
    tx: oneshot::Sender<RuntimeResult<()>>,
}

struct RecvWaiter<T> {
    ticket: u64,
    tx: oneshot::Sender<RuntimeResult<T>>,
}

struct ChannelState<T> {
    buffer: VecDeque<T>,
    closed: bool,
    senders: VecDeque<SendWaiter<T>>,
    receivers: VecDeque<RecvWaiter<T>>,
    next_ticket: u64,
}

impl<T> ChannelState<T> {
    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }
}

struct ChannelInner<T> {
    capacity: usize,
    default_timeout: Timeout,
    name: Option<String>,
    state: Mutex<ChannelState<T>>,
    readiness: Arc<Notify>,
}

/// A bounded multi-producer multi-consumer FIFO channel.
///
/// Cloning shares the same underlying channel. Capacity 0 is a rendezvous
/// channel: a send completes only when a receiver takes the value.
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("len", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Channel<T> {
    /// Create a channel from a validated config.
    pub fn new(config: ChannelConfig) -> RuntimeResult<Self> {
        let (capacity, default_timeout) = config.validate()?;
        Ok(Self {
            inner: Arc::new(ChannelInner {
                capacity,
                default_timeout,
                name: config.name,
                state: Mutex::new(ChannelState {
                    buffer: VecDeque::new(),
                    closed: false,
                    senders: VecDeque::new(),
                    receivers: VecDeque::new(),
                    next_ticket: 0,
                }),
                readiness: Arc::new(Notify::new()),
            }),
        })
    }

    /// Rendezvous channel with default options.
    pub fn unbuffered() -> Self {
        // Default config is always valid.
        Self::new(ChannelConfig::default()).unwrap_or_else(|_| unreachable!())
    }

    /// Buffered channel with the given capacity and default options.
    pub fn buffered(capacity: usize) -> RuntimeResult<Self> {
        Self::new(ChannelConfig::buffered(capacity))
    }

    /// Number of buffered elements. Always 0 for a rendezvous channel.
    pub fn len(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub(crate) fn readiness(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.readiness)
    }

    fn pulse(&self) {
        self.inner.readiness.notify_waiters();
    }

    /// Send with the channel's default timeout.
    pub async fn send(&self, value: T) -> RuntimeResult<()> {
        self.send_timeout(value, self.inner.default_timeout).await
    }

    /// Send, waiting at most `timeout` for buffer space or a receiver.
    pub async fn send_timeout(&self, value: T, timeout: Timeout) -> RuntimeResult<()> {
        if timeout == Timeout::NonBlocking {
            return self.try_send(value).map_err(RuntimeError::from);
        }

        let (ticket, rx) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(RuntimeError::ChannelClosed);
            }
            // Direct handoff beats buffering so parked receivers are never
            // starved by a full buffer.
            if let Some(receiver) = state.receivers.pop_front() {
                let _ = receiver.tx.send(Ok(value));
                drop(state);
                self.pulse();
                return Ok(());
            }
            if state.buffer.len() < self.inner.capacity {
                state.buffer.push_back(value);
                drop(state);
                self.pulse();
                return Ok(());
            }
            let ticket = state.take_ticket();
            let (tx, rx) = oneshot::channel();
            state.senders.push_back(SendWaiter {
                ticket,
                value: Some(value),
                tx,
            });
            (ticket, rx)
        };

        // A parked sender is new readiness for anyone waiting to receive.
        self.pulse();
        self.await_send(ticket, rx, timeout).await
    }

    async fn await_send(
        &self,
        ticket: u64,
        mut rx: oneshot::Receiver<RuntimeResult<()>>,
        timeout: Timeout,
    ) -> RuntimeResult<()> {
        let outcome = match timeout.as_duration() {
            None => Some(rx.await),
            Some(duration) => match tokio::time::timeout(duration, &mut rx).await {
                Ok(result) => Some(result),
                Err(_) => {
                    // The timer fired. If the waiter is still queued the send
                    // failed; if not, a receiver matched it concurrently and the
                    // handoff must stand.
                    let removed = {
                        let mut state = self.inner.state.lock();
                        let before = state.senders.len();
                        state.senders.retain(|w| w.ticket != ticket);
                        state.senders.len() != before
                    };
                    if removed {
                        return Err(RuntimeError::ChannelSendTimeout {
                            timeout_ms: timeout.millis(),
                        });
                    } else {
                        Some(rx.await)
                    }
                }
            },
        };

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(RuntimeError::Internal(
                "send waiter dropped without resolution".to_string(),
            )),
            None => unreachable!(),
        }
    }

    /// Receive with the channel's default timeout.
    pub async fn receive(&self) -> RuntimeResult<T> {
        self.receive_timeout(self.inner.default_timeout).await
    }

    /// Receive, waiting at most `timeout` for a value.
    pub async fn receive_timeout(&self, timeout: Timeout) -> RuntimeResult<T> {
        if timeout == Timeout::NonBlocking {
            return self.try_receive();
        }

        let (ticket, rx) = {
            let mut state = self.inner.state.lock();
            if let Some(value) = self.pop_front_locked(&mut state) {
                drop(state);
                self.pulse();
                return Ok(value);
            }
            if state.closed {
                return Err(RuntimeError::ChannelClosedEmpty);
            }
            let ticket = state.take_ticket();
            let (tx, rx) = oneshot::channel();
            state.receivers.push_back(RecvWaiter { ticket, tx });
            (ticket, rx)
        };

        // A parked receiver is new readiness for anyone waiting to send.
        self.pulse();
        self.await_receive(ticket, rx, timeout).await
    }

    async fn await_receive(
        &self,
        ticket: u64,
        mut rx: oneshot::Receiver<RuntimeResult<T>>,
        timeout: Timeout,
    ) -> RuntimeResult<T> {
        let outcome = match timeout.as_duration() {
            None => Some(rx.await),
            Some(duration) => match tokio::time::timeout(duration, &mut rx).await {
                Ok(result) => Some(result),
                Err(_) => {
                    let removed = {
                        let mut state = self.inner.state.lock();
                        let before = state.receivers.len();
                        state.receivers.retain(|w| w.ticket != ticket);
                        state.receivers.len() != before
                    };
                    if removed {
                        return Err(RuntimeError::ChannelReceiveTimeout {
                            timeout_ms: timeout.millis(),
                        });
                    } else {
                        Some(rx.await)
                    }
                }
            },
        };

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(RuntimeError::Internal(
                "receive waiter dropped without resolution".to_string(),
            )),
            None => unreachable!(),
        }
    }

    /// Take the next value in FIFO order, promoting a parked sender into the
    /// freed buffer slot. Caller holds the state lock.
    fn pop_front_locked(&self, state: &mut ChannelState<T>) -> Option<T> {
        if let Some(value) = state.buffer.pop_front() {
            // Buffered values were sent before any parked sender queued, so
            // the buffer drains first and the eldest sender moves up.
            if let Some(mut sender) = state.senders.pop_front() {
                if let Some(pending) = sender.value.take() {
                    state.buffer.push_back(pending);
                }
                let _ = sender.tx.send(Ok(()));
            }
            return Some(value);
        }
        // Rendezvous: no buffer, take straight from the eldest sender.
        if let Some(mut sender) = state.senders.pop_front() {
            let value = sender.value.take();
            let _ = sender.tx.send(Ok(()));
            return value;
        }
        None
    }

    /// Non-blocking send. Succeeds only on a fast path: a parked receiver or
    /// free buffer space. The rejected value travels back in the error.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(TrySendError {
                value,
                error: RuntimeError::ChannelClosed,
            });
        }
        if let Some(receiver) = state.receivers.pop_front() {
            let _ = receiver.tx.send(Ok(value));
            drop(state);
            self.pulse();
            return Ok(());
        }
        if state.buffer.len() < self.inner.capacity {
            state.buffer.push_back(value);
            drop(state);
            self.pulse();
            return Ok(());
        }
        Err(TrySendError {
            value,
            error: RuntimeError::ChannelBufferFull,
        })
    }

    /// Non-blocking receive. Succeeds only on a fast path: a buffered value
    /// or a parked sender.
    pub fn try_receive(&self) -> RuntimeResult<T> {
        let mut state = self.inner.state.lock();
        if let Some(value) = self.pop_front_locked(&mut state) {
            drop(state);
            self.pulse();
            return Ok(value);
        }
        if state.closed {
            return Err(RuntimeError::ChannelClosedEmpty);
        }
        Err(RuntimeError::ChannelEmpty)
    }

    /// Close the channel.
    ///
    /// Parked senders fail with `channel.closed`, parked receivers with
    /// `channel.closed-empty`. Buffered values stay drainable. Closing twice
    /// fails with `channel.already-closed` and changes nothing.
    pub fn close(&self) -> RuntimeResult<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(RuntimeError::ChannelAlreadyClosed);
        }
        state.closed = true;
        let senders = std::mem::take(&mut state.senders);
        let receivers = std::mem::take(&mut state.receivers);
        debug!(
            name = self.inner.name.as_deref().unwrap_or(""),
            rejected_senders = senders.len(),
            rejected_receivers = receivers.len(),
            "channel closed"
        );
        drop(state);
        for sender in senders {
            let _ = sender.tx.send(Err(RuntimeError::ChannelClosed));
        }
        for receiver in receivers {
            let _ = receiver.tx.send(Err(RuntimeError::ChannelClosedEmpty));
        }
        self.pulse();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_send_receive_in_order() {
        let chan = Channel::buffered(3).unwrap();
        chan.send(1).await.unwrap();
        chan.send(2).await.unwrap();
        chan.send(3).await.unwrap();
        assert_eq!(chan.len(), 3);
        assert_eq!(chan.receive().await.unwrap(), 1);
        assert_eq!(chan.receive().await.unwrap(), 2);
        assert_eq!(chan.receive().await.unwrap(), 3);
        assert_eq!(chan.len(), 0);
    }

    #[tokio::test]
    async fn rendezvous_send_completes_only_on_match() {
        let chan: Channel<&str> = Channel::unbuffered();
        let tx = chan.clone();
        let sender = tokio::spawn(async move { tx.send("hello").await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(chan.len(), 0);
        assert_eq!(chan.receive().await.unwrap(), "hello");
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn full_buffer_parks_sender_until_space() {
        let chan = Channel::buffered(1).unwrap();
        chan.send(1).await.unwrap();

        let tx = chan.clone();
        let sender = tokio::spawn(async move { tx.send(2).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(chan.receive().await.unwrap(), 1);
        sender.await.unwrap().unwrap();
        assert_eq!(chan.receive().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn send_timeout_on_full_buffer() {
        let chan = Channel::buffered(1).unwrap();
        chan.send(1).await.unwrap();
        let err = chan
            .send_timeout(2, Timeout::Millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "channel.send-timeout");
        // The failed send consumed no buffer space.
        assert_eq!(chan.len(), 1);
        assert_eq!(chan.receive().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn receive_timeout_on_empty_channel() {
        let chan: Channel<u8> = Channel::buffered(1).unwrap();
        let err = chan.receive_timeout(Timeout::Millis(20)).await.unwrap_err();
        assert_eq!(err.code(), "channel.receive-timeout");
    }

    #[tokio::test]
    async fn try_paths() {
        let chan = Channel::buffered(1).unwrap();
        assert_eq!(chan.try_receive().unwrap_err().code(), "channel.empty");
        chan.try_send(7).unwrap();
        let rejected = chan.try_send(8).unwrap_err();
        assert_eq!(rejected.value, 8);
        assert_eq!(rejected.error.code(), "channel.buffer-full");
        assert_eq!(chan.try_receive().unwrap(), 7);
    }

    #[tokio::test]
    async fn close_rejects_parked_sender() {
        let chan: Channel<u8> = Channel::unbuffered();
        let tx = chan.clone();
        let sender =
            tokio::spawn(async move { tx.send_timeout(1, Timeout::Infinite).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        chan.close().unwrap();
        assert_eq!(
            sender.await.unwrap().unwrap_err().code(),
            "channel.closed"
        );
    }

    #[tokio::test]
    async fn close_rejects_parked_receiver() {
        let chan: Channel<u8> = Channel::unbuffered();
        let rx = chan.clone();
        let receiver =
            tokio::spawn(async move { rx.receive_timeout(Timeout::Infinite).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        chan.close().unwrap();
        assert_eq!(
            receiver.await.unwrap().unwrap_err().code(),
            "channel.closed-empty"
        );
    }

    #[tokio::test]
    async fn close_drains_buffer_then_fails_empty() {
        let chan = Channel::buffered(2).unwrap();
        chan.send(1).await.unwrap();
        chan.send(2).await.unwrap();
        chan.close().unwrap();

        assert_eq!(chan.send(3).await.unwrap_err().code(), "channel.closed");
        assert_eq!(chan.receive().await.unwrap(), 1);
        assert_eq!(chan.receive().await.unwrap(), 2);
        assert_eq!(
            chan.receive().await.unwrap_err().code(),
            "channel.closed-empty"
        );
    }

    #[tokio::test]
    async fn double_close_fails_and_changes_nothing() {
        let chan = Channel::buffered(1).unwrap();
        chan.send(9).await.unwrap();
        chan.close().unwrap();
        assert_eq!(chan.close().unwrap_err().code(), "channel.already-closed");
        assert_eq!(chan.len(), 1);
        assert_eq!(chan.receive().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn handoff_is_fifo_on_both_sides() {
        let chan: Channel<u8> = Channel::unbuffered();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let rx = chan.clone();
            receivers.push(tokio::spawn(async move {
                rx.receive_timeout(Timeout::Infinite).await
            }));
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        for v in [10, 20, 30] {
            chan.send(v).await.unwrap();
        }
        let mut got = Vec::new();
        for handle in receivers {
            got.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(got, vec![10, 20, 30]);
    }
}
