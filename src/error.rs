//! Error types for the concurrency runtime
//!
//! Every failure surfaced by this crate carries a stable dotted code (see
//! [`RuntimeError::code`]) that callers can branch on, plus whatever
//! structured fields the failure produced. [`RuntimeError::context`] renders
//! those fields as a string map for telemetry sinks.

use std::collections::HashMap;

use thiserror::Error;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Comprehensive error taxonomy for the concurrency runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Send attempted on a closed channel
    #[error("channel is closed")]
    ChannelClosed,

    /// Receive attempted on a closed channel with an empty buffer
    #[error("channel is closed and empty")]
    ChannelClosedEmpty,

    /// Close attempted on an already-closed channel
    #[error("channel is already closed")]
    ChannelAlreadyClosed,

    /// Blocking send did not complete within its timeout
    #[error("send timed out after {timeout_ms}ms")]
    ChannelSendTimeout { timeout_ms: u64 },

    /// Blocking receive did not complete within its timeout
    #[error("receive timed out after {timeout_ms}ms")]
    ChannelReceiveTimeout { timeout_ms: u64 },

    /// Non-blocking send would have blocked
    #[error("channel buffer is full")]
    ChannelBufferFull,

    /// Non-blocking receive found nothing to take
    #[error("channel is empty")]
    ChannelEmpty,

    /// Context was explicitly cancelled
    #[error("context cancelled")]
    ContextCancelled,

    /// Context deadline elapsed
    #[error("context deadline exceeded")]
    ContextDeadlineExceeded,

    /// Unlock attempted on a mutex that is not held
    #[error("mutex is not locked")]
    MutexNotLocked,

    /// Mutex acquisition did not complete within its timeout
    #[error("mutex lock timed out after {timeout_ms}ms")]
    MutexLockTimeout { timeout_ms: u64 },

    /// Read-unlock attempted with no read lock held
    #[error("rwmutex is not read-locked")]
    RwMutexNotReadLocked,

    /// Write-unlock attempted with no write lock held
    #[error("rwmutex is not write-locked")]
    RwMutexNotWriteLocked,

    /// Read-lock acquisition did not complete within its timeout
    #[error("read lock timed out after {timeout_ms}ms")]
    RwMutexReadLockTimeout { timeout_ms: u64 },

    /// Write-lock acquisition did not complete within its timeout
    #[error("write lock timed out after {timeout_ms}ms")]
    RwMutexWriteLockTimeout { timeout_ms: u64 },

    /// Concurrent reader cap reached
    #[error("too many concurrent readers (max {max_readers})")]
    RwMutexTooManyReaders { max_readers: usize },

    /// Semaphore acquisition did not complete within its timeout
    #[error("semaphore acquire timed out after {timeout_ms}ms")]
    SemaphoreTimeout { timeout_ms: u64 },

    /// Semaphore was reset while the acquirer was queued
    #[error("semaphore was reset")]
    SemaphoreReset,

    /// WaitGroup counter would have gone negative
    #[error("waitgroup counter cannot go negative (counter {counter}, delta {delta})")]
    WaitGroupNegative { counter: i64, delta: i64 },

    /// WaitGroup wait did not complete within its timeout
    #[error("waitgroup wait timed out after {timeout_ms}ms")]
    WaitGroupWaitTimeout { timeout_ms: u64 },

    /// No select case became ready within the selector timeout
    #[error("select timed out after {timeout_ms}ms")]
    SelectTimeout { timeout_ms: u64 },

    /// A send case was constructed without a value
    #[error("select send case has no value")]
    SelectBadSend,

    /// Timeout value failed validation
    #[error("invalid timeout: {reason}")]
    InvalidTimeout { reason: String },

    /// Buffer size failed validation
    #[error("invalid buffer size: {reason}")]
    InvalidBufferSize { reason: String },

    /// Concurrency parameter failed validation
    #[error("invalid concurrency parameter: {reason}")]
    InvalidConcurrency { reason: String },

    /// Worker did not respond within the execute timeout
    #[error("worker execution timed out after {timeout_ms}ms")]
    WorkerTimeout { timeout_ms: u64 },

    /// Worker died with the request in flight
    #[error("worker {worker_id} died")]
    WorkerDied { worker_id: usize },

    /// Worker received a message it does not understand
    #[error("worker received unknown message: {message}")]
    WorkerUnknownMessage { message: String },

    /// A synchronization primitive was asked to mutate across the thread boundary
    #[error("synchronization primitives cannot be mutated across the worker boundary")]
    CrossThreadSyncUnsupported,

    /// Duplicate function id at registration
    #[error("function {function_id} is already registered")]
    DuplicateFunctionId { function_id: String },

    /// Function id not present in the registry
    #[error("function {function_id} is not registered")]
    UnknownFunctionId { function_id: String },

    /// Routine body did not complete within its timeout
    #[error("routine timed out after {timeout_ms}ms")]
    RoutineTimeout { timeout_ms: u64 },

    /// Routine or job body panicked
    #[error("routine panicked: {message}")]
    RoutinePanic { message: String },

    /// Scheduler is not in a state that accepts dispatch
    #[error("scheduler is {state} and cannot dispatch")]
    SchedulerUnavailable { state: String },

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Stable code for this error, suitable for branching and telemetry.
    ///
    /// Codes never change across releases; new variants get new codes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChannelClosed => "channel.closed",
            Self::ChannelClosedEmpty => "channel.closed-empty",
            Self::ChannelAlreadyClosed => "channel.already-closed",
            Self::ChannelSendTimeout { .. } => "channel.send-timeout",
            Self::ChannelReceiveTimeout { .. } => "channel.receive-timeout",
            Self::ChannelBufferFull => "channel.buffer-full",
            Self::ChannelEmpty => "channel.empty",
            Self::ContextCancelled => "context.cancelled",
            Self::ContextDeadlineExceeded => "context.deadline-exceeded",
            Self::MutexNotLocked => "mutex.not-locked",
            Self::MutexLockTimeout { .. } => "mutex.lock-timeout",
            Self::RwMutexNotReadLocked => "rwmutex.not-read-locked",
            Self::RwMutexNotWriteLocked => "rwmutex.not-write-locked",
            Self::RwMutexReadLockTimeout { .. } => "rwmutex.rlock-timeout",
            Self::RwMutexWriteLockTimeout { .. } => "rwmutex.wlock-timeout",
            Self::RwMutexTooManyReaders { .. } => "rwmutex.too-many-readers",
            Self::SemaphoreTimeout { .. } => "semaphore.timeout",
            Self::SemaphoreReset => "semaphore.reset",
            Self::WaitGroupNegative { .. } => "waitgroup.negative",
            Self::WaitGroupWaitTimeout { .. } => "waitgroup.wait-timeout",
            Self::SelectTimeout { .. } => "select.timeout",
            Self::SelectBadSend => "select.bad-send",
            Self::InvalidTimeout { .. } => "validation.timeout",
            Self::InvalidBufferSize { .. } => "validation.buffer-size",
            Self::InvalidConcurrency { .. } => "validation.concurrency",
            Self::WorkerTimeout { .. } => "worker.timeout",
            Self::WorkerDied { .. } => "worker.died",
            Self::WorkerUnknownMessage { .. } => "worker.unknown-message",
            Self::CrossThreadSyncUnsupported => "worker.cross-thread-sync-unsupported",
            Self::DuplicateFunctionId { .. } => "registry.duplicate-id",
            Self::UnknownFunctionId { .. } => "registry.unknown-function",
            Self::RoutineTimeout { .. } => "routine.timeout",
            Self::RoutinePanic { .. } => "routine.panic",
            Self::SchedulerUnavailable { .. } => "scheduler.unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Structured fields of this error rendered as a context map.
    ///
    /// Empty for variants that carry no data beyond the code.
    pub fn context(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        match self {
            Self::ChannelSendTimeout { timeout_ms }
            | Self::ChannelReceiveTimeout { timeout_ms }
            | Self::MutexLockTimeout { timeout_ms }
            | Self::RwMutexReadLockTimeout { timeout_ms }
            | Self::RwMutexWriteLockTimeout { timeout_ms }
            | Self::SemaphoreTimeout { timeout_ms }
            | Self::WaitGroupWaitTimeout { timeout_ms }
            | Self::SelectTimeout { timeout_ms }
            | Self::WorkerTimeout { timeout_ms }
            | Self::RoutineTimeout { timeout_ms } => {
                ctx.insert("timeout_ms".into(), timeout_ms.to_string());
            }
            Self::RwMutexTooManyReaders { max_readers } => {
                ctx.insert("max_readers".into(), max_readers.to_string());
            }
            Self::WaitGroupNegative { counter, delta } => {
                ctx.insert("counter".into(), counter.to_string());
                ctx.insert("delta".into(), delta.to_string());
            }
            Self::InvalidTimeout { reason }
            | Self::InvalidBufferSize { reason }
            | Self::InvalidConcurrency { reason } => {
                ctx.insert("reason".into(), reason.clone());
            }
            Self::WorkerDied { worker_id } => {
                ctx.insert("worker_id".into(), worker_id.to_string());
            }
            Self::WorkerUnknownMessage { message } => {
                ctx.insert("message".into(), message.clone());
            }
            Self::DuplicateFunctionId { function_id }
            | Self::UnknownFunctionId { function_id } => {
                ctx.insert("function_id".into(), function_id.clone());
            }
            Self::RoutinePanic { message } => {
                ctx.insert("message".into(), message.clone());
            }
            Self::SchedulerUnavailable { state } => {
                ctx.insert("state".into(), state.clone());
            }
            Self::Internal(message) => {
                ctx.insert("message".into(), message.clone());
            }
            _ => {}
        }
        ctx
    }

    /// Whether this error is one of the timeout family.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ChannelSendTimeout { .. }
                | Self::ChannelReceiveTimeout { .. }
                | Self::MutexLockTimeout { .. }
                | Self::RwMutexReadLockTimeout { .. }
                | Self::RwMutexWriteLockTimeout { .. }
                | Self::SemaphoreTimeout { .. }
                | Self::WaitGroupWaitTimeout { .. }
                | Self::SelectTimeout { .. }
                | Self::WorkerTimeout { .. }
                | Self::RoutineTimeout { .. }
                | Self::ContextDeadlineExceeded
        )
    }
}

/// Best-effort message extraction from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
