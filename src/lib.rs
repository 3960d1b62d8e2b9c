//! Go-style structured concurrency runtime
//!
//! This crate provides the concurrency toolkit of a Go program inside a
//! tokio process, plus true parallelism through OS worker threads:
//! - `go`, `go_all`, `go_race`, `go_with_retry` routine scheduling
//! - bounded MPMC channels with close and timeout semantics
//! - a multi-way `Selector` with default and timeout cases
//! - mutex, fair mutex, rwmutex, semaphore, waitgroup, once
//! - a cancellation-propagating `Context` tree with deadlines and values
//! - a parallel scheduler dispatching registered functions over a pool of
//!   worker threads, with load balancing, health tracking, and recovery
//!
//! Synchronization primitives never cross the worker boundary; workers see
//! read-only snapshots and typed job arguments only.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod routine;
pub mod scheduler;
pub mod select;
pub mod sync;
pub mod time;
pub mod validate;

pub use channel::{Channel, TrySendError};
pub use config::{
    BalancingStrategy, ChannelConfig, MutexConfig, RetryConfig, RwMutexConfig, SchedulerConfig,
    SemaphoreConfig,
};
pub use context::{
    clear_cancellation_hook, set_cancellation_hook, CancelHandle, Context, ContextId,
};
pub use error::{RuntimeError, RuntimeResult};
pub use pool::{PoolStats, WorkerHealthSnapshot, WorkerPool};
pub use proxy::{ChannelSnapshot, ContextSnapshot, MutexSnapshot, SnapshotBoard, SyncProxy};
pub use registry::{FunctionRegistry, JobArgs, JobFn, RegisteredFunction};
pub use routine::{
    go, go_all, go_race, go_with_retry, AllOptions, GoOptions, RoutineHandle, RoutineId,
    RoutineState,
};
pub use scheduler::{
    get_parallel_scheduler, go_registered, initialize_parallel_scheduler,
    shutdown_parallel_scheduler, Scheduler, SchedulerState, SchedulerStats,
};
pub use select::Selector;
pub use sync::{FairMutex, Mutex, Once, RwMutex, Semaphore, WaitGroup};
pub use time::{sleep, sleep_ms};
pub use validate::Timeout;
