//! Parallel scheduler façade
//!
//! The scheduler owns the function registry and, when worker threads are
//! enabled, a [`WorkerPool`]. Registered functions dispatch either to a
//! balancer-selected worker or onto a blocking task in-process; plain
//! closures always stay in-process via [`go`](crate::routine::go) — code
//! never crosses the thread boundary, only ids and JSON values do.
//!
//! A process-wide singleton is managed by
//! [`initialize_parallel_scheduler`] / [`get_parallel_scheduler`] /
//! [`shutdown_parallel_scheduler`]; independent instances remain
//! constructible for tests. While the singleton lives, the context
//! cancellation hook republishes terminal context state onto the pool's
//! snapshot board, which is how worker-side jobs observe cancellation.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::context::{self, Context};
use crate::error::{RuntimeError, RuntimeResult};
use crate::pool::{PoolStats, WorkerHealthSnapshot, WorkerPool};
use crate::proxy::{ContextSnapshot, SnapshotBoard};
use crate::registry::{FunctionRegistry, JobArgs};
use crate::routine::{go, GoOptions, RoutineHandle};
use crate::validate::Timeout;

/// Lifecycle of a scheduler instance. The "uninitialized" state of the
/// state machine is the absence of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Initialized,
    ShuttingDown,
    Terminated,
}

impl SchedulerState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        }
    }
}

/// Aggregated scheduler statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub workers: usize,
    pub pending_requests: usize,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub worker_health: Vec<WorkerHealthSnapshot>,
}

/// Dispatches registered functions in-process or across the worker pool.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<FunctionRegistry>,
    board: Arc<SnapshotBoard>,
    pool: Option<WorkerPool>,
    state: parking_lot::Mutex<SchedulerState>,
}

impl Scheduler {
    /// Build a scheduler; spins up the worker pool when enabled.
    pub fn new(config: SchedulerConfig) -> RuntimeResult<Self> {
        config.validate()?;
        let registry = Arc::new(FunctionRegistry::new());
        let board = Arc::new(SnapshotBoard::new());
        let pool = if config.use_worker_threads {
            Some(WorkerPool::new(
                config.clone(),
                Arc::clone(&registry),
                Arc::clone(&board),
            )?)
        } else {
            None
        };
        info!(
            use_worker_threads = config.use_worker_threads,
            workers = pool.as_ref().map(WorkerPool::worker_count).unwrap_or(0),
            "scheduler initialized"
        );
        Ok(Self {
            config,
            registry,
            board,
            pool,
            state: parking_lot::Mutex::new(SchedulerState::Initialized),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Register a job callable under a process-unique id.
    pub fn register<F>(&self, id: impl Into<String>, func: F) -> RuntimeResult<()>
    where
        F: Fn(JobArgs) -> RuntimeResult<Value> + Send + Sync + 'static,
    {
        self.registry.register(id, func)
    }

    /// Publish a context snapshot so worker-side jobs can observe it.
    pub fn track_context(&self, ctx: &Context) {
        self.board.publish(ContextSnapshot::of(ctx));
    }

    /// Route every future cancellation onto this scheduler's snapshot
    /// board. Installed automatically for the global singleton.
    pub fn install_cancellation_hook(&self) {
        let board = Arc::clone(&self.board);
        context::set_cancellation_hook(Arc::new(move |id, err| {
            board.update_err(id, err.code());
        }));
    }

    fn ensure_dispatchable(&self) -> RuntimeResult<()> {
        let state = self.state();
        if state == SchedulerState::Initialized {
            Ok(())
        } else {
            Err(RuntimeError::SchedulerUnavailable {
                state: state.as_str().to_string(),
            })
        }
    }

    fn resolve_timeout(&self, timeout_ms: Option<i64>) -> RuntimeResult<Timeout> {
        Timeout::from_millis(timeout_ms.unwrap_or(self.config.timeout_ms))
    }

    /// Execute a registered function and await its result.
    ///
    /// With worker threads enabled the job runs on a balancer-selected
    /// worker; otherwise it runs on a blocking task in this process.
    pub async fn execute(
        &self,
        function_id: &str,
        args: JobArgs,
        timeout_ms: Option<i64>,
    ) -> RuntimeResult<Value> {
        self.ensure_dispatchable()?;
        let timeout = self.resolve_timeout(timeout_ms)?;
        match &self.pool {
            Some(pool) => pool.execute(function_id, args, timeout).await,
            None => self.execute_in_process(function_id, args, timeout).await,
        }
    }

    async fn execute_in_process(
        &self,
        function_id: &str,
        args: JobArgs,
        timeout: Timeout,
    ) -> RuntimeResult<Value> {
        let entry = self.registry.lookup(function_id)?;
        let job = tokio::task::spawn_blocking(move || entry.invoke(args));
        let outcome = match timeout.as_duration() {
            None => job.await,
            Some(duration) => match tokio::time::timeout(duration, job).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(RuntimeError::RoutineTimeout {
                        timeout_ms: timeout.millis(),
                    })
                }
            },
        };
        match outcome {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(RuntimeError::RoutinePanic {
                message: crate::error::panic_message(join_err.into_panic()),
            }),
            Err(join_err) => Err(RuntimeError::Internal(format!("job join: {join_err}"))),
        }
    }

    /// Probe worker health; no-op without a pool.
    pub async fn heartbeat(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.heartbeat_all().await,
            None => 0,
        }
    }

    /// Aggregated statistics.
    pub fn stats(&self) -> SchedulerStats {
        let (workers, pending, pool_stats, health) = match &self.pool {
            Some(pool) => (
                pool.worker_count(),
                pool.pending_requests(),
                Some(pool.stats()),
                pool.worker_health(),
            ),
            None => (0, 0, None, Vec::new()),
        };
        let (dispatched, completed, failed) = pool_stats
            .as_ref()
            .map(|s: &Arc<PoolStats>| (s.dispatched(), s.completed(), s.failed()))
            .unwrap_or((0, 0, 0));
        SchedulerStats {
            workers,
            pending_requests: pending,
            dispatched,
            completed,
            failed,
            worker_health: health,
        }
    }

    /// Terminate the pool. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                SchedulerState::Initialized => *state = SchedulerState::ShuttingDown,
                SchedulerState::ShuttingDown | SchedulerState::Terminated => return,
            }
        }
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        *self.state.lock() = SchedulerState::Terminated;
        debug!("scheduler terminated");
    }
}

static GLOBAL_SCHEDULER: parking_lot::RwLock<Option<Arc<Scheduler>>> =
    parking_lot::RwLock::new(None);

/// Initialize the process-wide scheduler. A second call is a no-op that
/// returns the existing instance.
pub fn initialize_parallel_scheduler(config: SchedulerConfig) -> RuntimeResult<Arc<Scheduler>> {
    let mut global = GLOBAL_SCHEDULER.write();
    if let Some(existing) = global.as_ref() {
        return Ok(Arc::clone(existing));
    }
    let scheduler = Arc::new(Scheduler::new(config.with_env_overrides())?);
    scheduler.install_cancellation_hook();
    *global = Some(Arc::clone(&scheduler));
    Ok(scheduler)
}

/// The process-wide scheduler, if initialized.
pub fn get_parallel_scheduler() -> Option<Arc<Scheduler>> {
    GLOBAL_SCHEDULER.read().clone()
}

/// Tear down the process-wide scheduler. Idempotent.
pub async fn shutdown_parallel_scheduler() {
    let taken = GLOBAL_SCHEDULER.write().take();
    if let Some(scheduler) = taken {
        scheduler.shutdown().await;
        context::clear_cancellation_hook();
    }
}

/// Schedule a registered function as a routine.
///
/// With `use_worker_threads` set and a global scheduler present, the job is
/// dispatched to the pool; otherwise it runs in-process through the global
/// scheduler. The handle fails with `scheduler.unavailable` when no global
/// scheduler exists.
pub fn go_registered(
    function_id: impl Into<String>,
    args: JobArgs,
    options: GoOptions,
) -> RoutineHandle<Value> {
    let function_id = function_id.into();
    let use_workers = options.use_worker_threads;
    let timeout_ms = options.timeout_ms;
    // The execute path owns the timeout; the routine wrapper only carries
    // the name, context, and error hook.
    let wrapper_options = GoOptions {
        timeout_ms: None,
        ..options
    };
    go(
        move || async move {
            let Some(scheduler) = get_parallel_scheduler() else {
                return Err(RuntimeError::SchedulerUnavailable {
                    state: "uninitialized".to_string(),
                });
            };
            if use_workers {
                scheduler.execute(&function_id, args, timeout_ms).await
            } else {
                scheduler.ensure_dispatchable()?;
                let timeout = scheduler.resolve_timeout(timeout_ms)?;
                scheduler
                    .execute_in_process(&function_id, args, timeout)
                    .await
            }
        },
        wrapper_options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    fn sum_config(threads: usize) -> SchedulerConfig {
        SchedulerConfig {
            thread_count: Some(threads),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn in_process_scheduler_executes_without_a_pool() {
        let scheduler = Scheduler::new(SchedulerConfig {
            use_worker_threads: false,
            ..Default::default()
        })
        .unwrap();
        scheduler
            .register("triple", |args| {
                let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(n * 3))
            })
            .unwrap();

        let result = scheduler
            .execute("triple", vec![json!(14)], None)
            .await
            .unwrap();
        assert_eq!(result, json!(42));
        assert_eq!(scheduler.stats().workers, 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn pooled_scheduler_executes_on_workers() {
        let scheduler = Scheduler::new(sum_config(2)).unwrap();
        scheduler
            .register("square", |args| {
                let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(n * n))
            })
            .unwrap();

        let result = scheduler
            .execute("square", vec![json!(9)], None)
            .await
            .unwrap();
        assert_eq!(result, json!(81));

        let stats = scheduler.stats();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.dispatched, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_is_rejected() {
        let scheduler = Scheduler::new(sum_config(1)).unwrap();
        scheduler.register("noop", |_| Ok(Value::Null)).unwrap();
        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Terminated);

        let err = scheduler.execute("noop", vec![], None).await.unwrap_err();
        assert_eq!(err.code(), "scheduler.unavailable");

        // Shutting down again changes nothing.
        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Terminated);
    }

    #[tokio::test]
    #[serial]
    async fn global_lifecycle_is_idempotent() {
        shutdown_parallel_scheduler().await;
        assert!(get_parallel_scheduler().is_none());

        let first = initialize_parallel_scheduler(sum_config(2)).unwrap();
        let second = initialize_parallel_scheduler(sum_config(8)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.stats().workers, 2);

        shutdown_parallel_scheduler().await;
        assert!(get_parallel_scheduler().is_none());
        shutdown_parallel_scheduler().await;
    }

    #[tokio::test]
    #[serial]
    async fn go_registered_runs_through_the_global_scheduler() {
        shutdown_parallel_scheduler().await;
        let scheduler = initialize_parallel_scheduler(sum_config(2)).unwrap();
        scheduler
            .register("concat", |args| {
                let joined: String = args
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("-");
                Ok(json!(joined))
            })
            .unwrap();

        let options = GoOptions {
            use_worker_threads: true,
            ..Default::default()
        };
        let handle = go_registered("concat", vec![json!("a"), json!("b")], options);
        assert_eq!(handle.join().await.unwrap(), json!("a-b"));
        shutdown_parallel_scheduler().await;
    }

    #[tokio::test]
    #[serial]
    async fn go_registered_without_a_global_scheduler_fails() {
        shutdown_parallel_scheduler().await;
        let handle = go_registered("anything", vec![], GoOptions::default());
        let err = handle.join().await.unwrap_err();
        assert_eq!(err.code(), "scheduler.unavailable");
    }
}
