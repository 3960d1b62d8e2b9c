//! Routine executor
//!
//! `go` schedules a user function as a routine and returns a handle that
//! resolves to the function's outcome. The call is deferred by one
//! scheduling tick, so `go` itself never runs user code inline. Timeouts,
//! context cancellation, and panics all resolve the handle with a tagged
//! error; an `on_error` hook observes the failure before the handle does.
//!
//! `go_all`, `go_race`, and `go_with_retry` compose routines: ordered
//! fan-out, first-settled, and exponential-backoff retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::context::Context;
use crate::error::{panic_message, RuntimeError, RuntimeResult};
use crate::validate::Timeout;

/// Routine identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutineId(pub Uuid);

impl std::fmt::Display for RoutineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a routine. Transitions only move forward; the last three
/// states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RoutineState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Hook observing a routine failure before the handle resolves.
pub type OnErrorHook = Arc<dyn Fn(&RuntimeError) + Send + Sync>;

/// Options for [`go`].
#[derive(Clone, Default)]
pub struct GoOptions {
    /// Debug tag carried by the handle and log lines.
    pub name: Option<String>,
    /// Overall timeout in milliseconds; `None` waits forever.
    pub timeout_ms: Option<i64>,
    /// Cancelling this context cancels the routine.
    pub context: Option<Context>,
    /// Runs with the failure before the handle fails.
    pub on_error: Option<OnErrorHook>,
    /// Consulted by the scheduler's registered-function dispatch; a plain
    /// closure always runs in-process.
    pub use_worker_threads: bool,
}

impl GoOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }
}

type StateCell = Arc<parking_lot::Mutex<RoutineState>>;

fn advance(state: &StateCell, next: RoutineState) {
    let mut current = state.lock();
    if !current.is_terminal() {
        *current = next;
    }
}

/// Handle to a scheduled routine, resolving to its outcome.
pub struct RoutineHandle<T> {
    id: RoutineId,
    name: Option<String>,
    state: StateCell,
    started_at: std::time::Instant,
    rx: oneshot::Receiver<RuntimeResult<T>>,
    abort: tokio::task::AbortHandle,
}

impl<T> RoutineHandle<T> {
    pub fn id(&self) -> RoutineId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> RoutineState {
        *self.state.lock()
    }

    pub fn started_at(&self) -> std::time::Instant {
        self.started_at
    }

    /// Cancel the routine. Terminal routines are unaffected.
    pub fn cancel(&self) {
        let mut current = self.state.lock();
        if !current.is_terminal() {
            *current = RoutineState::Cancelled;
            self.abort.abort();
        }
    }

    pub(crate) fn abort_handle(&self) -> tokio::task::AbortHandle {
        self.abort.clone()
    }

    /// Await the routine's outcome.
    pub async fn join(self) -> RuntimeResult<T> {
        match self.rx.await {
            Ok(result) => result,
            // The task was aborted before it could resolve the handle.
            Err(_) => {
                advance(&self.state, RoutineState::Cancelled);
                Err(RuntimeError::ContextCancelled)
            }
        }
    }
}

/// Schedule `f` as a routine.
///
/// Never fails synchronously: malformed options resolve the returned
/// handle with the validation error.
pub fn go<F, Fut, T>(f: F, options: GoOptions) -> RoutineHandle<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = RuntimeResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let id = RoutineId(Uuid::new_v4());
    let name = options.name.clone();
    let state: StateCell = Arc::new(parking_lot::Mutex::new(RoutineState::Pending));
    let (tx, rx) = oneshot::channel();

    let task_state = Arc::clone(&state);
    let task = tokio::spawn(async move {
        // One scheduling tick of deferral keeps `go` non-blocking even for
        // synchronous-looking bodies.
        tokio::task::yield_now().await;

        let timeout = match options.timeout_ms.map(Timeout::from_millis).transpose() {
            Ok(t) => t.unwrap_or(Timeout::Infinite),
            Err(err) => {
                if let Some(hook) = &options.on_error {
                    hook(&err);
                }
                advance(&task_state, RoutineState::Failed);
                let _ = tx.send(Err(err));
                return;
            }
        };

        advance(&task_state, RoutineState::Running);

        let context = options.context.clone();
        let work = async move {
            let fut = f();
            match &context {
                Some(ctx) => {
                    tokio::select! {
                        result = fut => result,
                        () = ctx.cancelled() => {
                            Err(ctx.err().unwrap_or(RuntimeError::ContextCancelled))
                        }
                    }
                }
                None => fut.await,
            }
        };

        let timed = async {
            let duration = match timeout {
                Timeout::Infinite => None,
                Timeout::NonBlocking => Some(Duration::ZERO),
                Timeout::Millis(m) => Some(Duration::from_millis(m)),
            };
            match duration {
                Some(d) => match tokio::time::timeout(d, work).await {
                    Ok(result) => result,
                    Err(_) => Err(RuntimeError::RoutineTimeout {
                        timeout_ms: timeout.millis(),
                    }),
                },
                None => work.await,
            }
        };

        let outcome = match std::panic::AssertUnwindSafe(timed).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(RuntimeError::RoutinePanic {
                message: panic_message(payload),
            }),
        };

        match outcome {
            Ok(value) => {
                advance(&task_state, RoutineState::Completed);
                let _ = tx.send(Ok(value));
            }
            Err(err) => {
                if let Some(hook) = &options.on_error {
                    hook(&err);
                }
                debug!(code = err.code(), "routine failed");
                let next = match err {
                    RuntimeError::ContextCancelled | RuntimeError::ContextDeadlineExceeded => {
                        RoutineState::Cancelled
                    }
                    _ => RoutineState::Failed,
                };
                advance(&task_state, next);
                let _ = tx.send(Err(err));
            }
        }
    });

    RoutineHandle {
        id,
        name,
        state,
        started_at: std::time::Instant::now(),
        rx,
        abort: task.abort_handle(),
    }
}

/// Options for [`go_all`].
#[derive(Clone, Default)]
pub struct AllOptions {
    /// Base options applied to each routine.
    pub go: GoOptions,
    /// Abort the routines still running when one fails. Off by default:
    /// a failure reports immediately while siblings run to completion.
    pub cancel_remaining: bool,
}

/// Run every function as a routine; resolve with their results in
/// declaration order, or with the first failure.
pub async fn go_all<F, Fut, T>(fns: Vec<F>, options: AllOptions) -> RuntimeResult<Vec<T>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = RuntimeResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<RoutineHandle<T>> = fns
        .into_iter()
        .map(|f| go(f, options.go.clone()))
        .collect();
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

    let result =
        futures::future::try_join_all(handles.into_iter().map(RoutineHandle::join)).await;
    if result.is_err() && options.cancel_remaining {
        for abort in aborts {
            abort.abort();
        }
    }
    result
}

/// Run every function as a routine; resolve (or fail) with the first one
/// to settle. The losers are aborted.
pub async fn go_race<F, Fut, T>(fns: Vec<F>, options: GoOptions) -> RuntimeResult<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = RuntimeResult<T>> + Send + 'static,
    T: Send + 'static,
{
    if fns.is_empty() {
        return Err(RuntimeError::Internal("race over zero routines".to_string()));
    }
    let handles: Vec<RoutineHandle<T>> =
        fns.into_iter().map(|f| go(f, options.clone())).collect();
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

    let joins: Vec<_> = handles
        .into_iter()
        .map(|h| Box::pin(h.join()))
        .collect();
    let (result, _index, _rest) = futures::future::select_all(joins).await;
    for abort in aborts {
        abort.abort();
    }
    result
}

/// Run `f` with up to `retry.max_retries` retries and exponential backoff.
///
/// The delay before the k-th retry (1-indexed) is
/// `base_delay_ms * 2^(k-1)`. The first success wins; the last failure is
/// propagated.
pub async fn go_with_retry<F, Fut, T>(
    f: F,
    retry: RetryConfig,
    options: GoOptions,
) -> RuntimeResult<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RuntimeResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    let mut last_error = None;

    for attempt in 0..=retry.max_retries {
        if attempt > 0 {
            let delay = retry.base_delay_ms.saturating_mul(1 << (attempt - 1));
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let call = Arc::clone(&f);
        match go(move || call(), options.clone()).join().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                debug!(attempt, code = err.code(), "retry attempt failed");
                last_error = Some(err);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| RuntimeError::Internal("retry exhausted without error".to_string())))
}
