//! Multi-way wait across channel operations
//!
//! A selector probes its cases in declaration order with the non-blocking
//! channel ops. If nothing is ready it parks on the readiness notifiers of
//! every case channel and re-probes after each pulse, so no polling loop
//! burns cycles while every channel is idle. Ties always go to the lowest
//! declaration index.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::channel::Channel;
use crate::error::{RuntimeError, RuntimeResult};
use crate::validate::Timeout;

enum ArmProbe<R> {
    Ready(R),
    NotReady,
    /// This case can never become ready (closed channel, missing value).
    Dead(RuntimeError),
}

trait SelectArm<R>: Send {
    fn probe(&mut self) -> ArmProbe<R>;
    fn readiness(&self) -> Arc<Notify>;
}

struct ReceiveArm<T, R, F> {
    chan: Channel<T>,
    handler: Option<F>,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<T, R, F> SelectArm<R> for ReceiveArm<T, R, F>
where
    T: Send,
    F: FnOnce(T) -> R + Send,
{
    fn probe(&mut self) -> ArmProbe<R> {
        match self.chan.try_receive() {
            Ok(value) => match self.handler.take() {
                Some(handler) => ArmProbe::Ready(handler(value)),
                None => ArmProbe::Dead(RuntimeError::Internal(
                    "receive handler already consumed".to_string(),
                )),
            },
            Err(RuntimeError::ChannelEmpty) => ArmProbe::NotReady,
            Err(err) => ArmProbe::Dead(err),
        }
    }

    fn readiness(&self) -> Arc<Notify> {
        self.chan.readiness()
    }
}

struct SendArm<T, R, F> {
    chan: Channel<T>,
    value: Option<T>,
    handler: Option<F>,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<T, R, F> SelectArm<R> for SendArm<T, R, F>
where
    T: Send,
    F: FnOnce() -> R + Send,
{
    fn probe(&mut self) -> ArmProbe<R> {
        let value = match self.value.take() {
            Some(value) => value,
            None => return ArmProbe::Dead(RuntimeError::SelectBadSend),
        };
        match self.chan.try_send(value) {
            Ok(()) => match self.handler.take() {
                Some(handler) => ArmProbe::Ready(handler()),
                None => ArmProbe::Dead(RuntimeError::Internal(
                    "send handler already consumed".to_string(),
                )),
            },
            Err(rejected) => {
                let crate::channel::TrySendError { value, error } = rejected;
                self.value = Some(value);
                if matches!(error, RuntimeError::ChannelBufferFull) {
                    ArmProbe::NotReady
                } else {
                    ArmProbe::Dead(error)
                }
            }
        }
    }

    fn readiness(&self) -> Arc<Notify> {
        self.chan.readiness()
    }
}

/// Builder for a multi-way channel wait.
///
/// Cases are tried in the order they were added. Handlers run synchronously
/// before [`run`](Self::run) returns.
pub struct Selector<R> {
    arms: Vec<Box<dyn SelectArm<R>>>,
    default_case: Option<Box<dyn FnOnce() -> R + Send>>,
    timeout: Timeout,
}

impl<R: 'static> Default for Selector<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: 'static> Selector<R> {
    pub fn new() -> Self {
        Self {
            arms: Vec::new(),
            default_case: None,
            timeout: Timeout::Infinite,
        }
    }

    /// Add a receive case; the handler gets the received value.
    pub fn receive<T, F>(mut self, chan: &Channel<T>, handler: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.arms.push(Box::new(ReceiveArm {
            chan: chan.clone(),
            handler: Some(handler),
            _marker: std::marker::PhantomData,
        }));
        self
    }

    /// Add a send case; the handler runs once the value is accepted.
    pub fn send<T, F>(mut self, chan: &Channel<T>, value: T, handler: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.arms.push(Box::new(SendArm {
            chan: chan.clone(),
            value: Some(value),
            handler: Some(handler),
            _marker: std::marker::PhantomData,
        }));
        self
    }

    /// Run this case when no channel case is immediately ready.
    pub fn default_case<F>(mut self, handler: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
    {
        self.default_case = Some(Box::new(handler));
        self
    }

    /// Give up after `timeout` with `select.timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Timeout::from(timeout);
        self
    }

    /// Millisecond form of [`timeout`](Self::timeout): `-1` waits forever,
    /// `0` makes `run` a single immediate pass.
    pub fn timeout_ms(mut self, millis: i64) -> RuntimeResult<Self> {
        self.timeout = Timeout::from_millis(millis)?;
        Ok(self)
    }

    /// Resolve the selector.
    pub async fn run(mut self) -> RuntimeResult<R> {
        if self.arms.is_empty() && self.default_case.is_none() {
            return Err(RuntimeError::Internal(
                "selector has no cases".to_string(),
            ));
        }

        let deadline = self
            .timeout
            .as_duration()
            .map(|d| tokio::time::Instant::now() + d);
        let notifiers: Vec<Arc<Notify>> =
            self.arms.iter().map(|arm| arm.readiness()).collect();

        loop {
            // Subscribe before probing so a pulse between the probe and the
            // park cannot be missed.
            let mut subscriptions: Vec<Pin<Box<Notified<'_>>>> =
                notifiers.iter().map(|n| Box::pin(n.notified())).collect();
            for sub in subscriptions.iter_mut() {
                sub.as_mut().enable();
            }

            let mut dead = 0usize;
            let mut first_dead: Option<RuntimeError> = None;
            for arm in self.arms.iter_mut() {
                match arm.probe() {
                    ArmProbe::Ready(result) => return Ok(result),
                    ArmProbe::NotReady => {}
                    ArmProbe::Dead(err) => {
                        dead += 1;
                        if first_dead.is_none() {
                            first_dead = Some(err);
                        }
                    }
                }
            }

            if let Some(handler) = self.default_case.take() {
                return Ok(handler());
            }

            // Every case is permanently unready; waiting would hang forever.
            if dead == self.arms.len() {
                return Err(first_dead.unwrap_or(RuntimeError::SelectBadSend));
            }

            if self.timeout == Timeout::NonBlocking {
                return Err(RuntimeError::SelectTimeout { timeout_ms: 0 });
            }

            let any_pulse = futures::future::select_all(subscriptions);
            match deadline {
                None => {
                    any_pulse.await;
                }
                Some(at) => {
                    if tokio::time::timeout_at(at, any_pulse).await.is_err() {
                        return Err(RuntimeError::SelectTimeout {
                            timeout_ms: self.timeout.millis(),
                        });
                    }
                }
            }
        }
    }
}
