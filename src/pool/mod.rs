//! Worker pool: OS threads, request correlation, recovery, shutdown
//!
//! The pool owns N worker threads and a dispatcher thread that routes
//! responses back to waiting callers. Every outgoing request carries a
//! fresh correlation id held in a pending map; a response resolves its
//! entry, a timeout removes it, and anything unmatched is dropped on the
//! floor. Workers that die (thread gone, or repeated worker-level errors)
//! reject their in-flight requests with `worker.died` and are restarted
//! under the same id when auto-restart is on.

pub mod balancer;
pub mod protocol;
pub mod worker;

pub use protocol::{RequestKind, WorkerRequest, WorkerResponse};
pub use worker::{WorkerHealth, WorkerState, ERROR_THRESHOLD};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::SchedulerConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::proxy::SnapshotBoard;
use crate::registry::FunctionRegistry;
use crate::validate::Timeout;

use balancer::LoadBalancer;
use worker::{decode_error, encode_error, spawn_worker, WorkerRuntime};

/// How long shutdown waits for workers before detaching them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// How long a heartbeat probe waits for an answer.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(500);

struct PendingRequest {
    tx: oneshot::Sender<WorkerResponse>,
    worker_id: usize,
}

struct WorkerSlot {
    id: usize,
    sender: Sender<WorkerRequest>,
    health: Arc<WorkerHealth>,
    /// Function ids already replicated to this worker.
    known_functions: parking_lot::Mutex<HashSet<String>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Counters across the pool's lifetime.
#[derive(Default)]
pub struct PoolStats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl PoolStats {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Point-in-time health view of one worker.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerHealthSnapshot {
    pub worker_id: usize,
    pub state: String,
    pub load: usize,
    pub error_count: usize,
    pub last_heartbeat_ms: u64,
}

/// Fixed-size pool of worker threads executing registered functions.
pub struct WorkerPool {
    config: SchedulerConfig,
    registry: Arc<FunctionRegistry>,
    board: Arc<SnapshotBoard>,
    workers: parking_lot::RwLock<Vec<WorkerSlot>>,
    pending: Arc<DashMap<String, PendingRequest>>,
    healths: Arc<DashMap<usize, Arc<WorkerHealth>>>,
    balancer: LoadBalancer,
    response_tx: parking_lot::Mutex<Option<Sender<WorkerResponse>>>,
    dispatcher: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
    shutting_down: AtomicBool,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Start the pool with its worker threads and response dispatcher.
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<FunctionRegistry>,
        board: Arc<SnapshotBoard>,
    ) -> RuntimeResult<Self> {
        config.validate()?;
        let thread_count = config.resolved_thread_count()?;
        let (response_tx, response_rx) = unbounded::<WorkerResponse>();
        let pending: Arc<DashMap<String, PendingRequest>> = Arc::new(DashMap::new());
        let healths: Arc<DashMap<usize, Arc<WorkerHealth>>> = Arc::new(DashMap::new());

        let mut workers = Vec::with_capacity(thread_count);
        for worker_id in 0..thread_count {
            let slot = Self::start_slot(
                worker_id,
                &registry,
                &board,
                response_tx.clone(),
            )?;
            healths.insert(worker_id, Arc::clone(&slot.health));
            workers.push(slot);
        }

        // Response dispatcher: correlate by id; drop anything unmatched.
        let dispatcher_pending = Arc::clone(&pending);
        let dispatcher_healths = Arc::clone(&healths);
        let dispatcher = std::thread::Builder::new()
            .name("routines-dispatch".to_string())
            .spawn(move || {
                while let Ok(response) = response_rx.recv() {
                    match dispatcher_pending.remove(&response.id) {
                        Some((_, entry)) => {
                            if let Some(health) = dispatcher_healths.get(&response.worker_id) {
                                health.sub_load();
                            }
                            let _ = entry.tx.send(response);
                        }
                        None => {
                            // Late or duplicate: the caller is gone.
                            trace!(id = %response.id, "unmatched response dropped");
                        }
                    }
                }
            })
            .map_err(|e| RuntimeError::Internal(format!("spawning dispatcher: {e}")))?;

        debug!(thread_count, "worker pool started");
        let balancer = LoadBalancer::new(config.strategy);
        Ok(Self {
            config,
            registry,
            board,
            workers: parking_lot::RwLock::new(workers),
            pending,
            healths,
            balancer,
            response_tx: parking_lot::Mutex::new(Some(response_tx)),
            dispatcher: parking_lot::Mutex::new(Some(dispatcher)),
            shutting_down: AtomicBool::new(false),
            stats: Arc::new(PoolStats::default()),
        })
    }

    fn start_slot(
        worker_id: usize,
        registry: &Arc<FunctionRegistry>,
        board: &Arc<SnapshotBoard>,
        response_tx: Sender<WorkerResponse>,
    ) -> RuntimeResult<WorkerSlot> {
        let (request_tx, request_rx) = unbounded::<WorkerRequest>();
        let health = Arc::new(WorkerHealth::new());
        let thread = spawn_worker(WorkerRuntime {
            id: worker_id,
            requests: request_rx,
            responses: response_tx,
            registry: Arc::clone(registry),
            board: Arc::clone(board),
            health: Arc::clone(&health),
        })?;

        // Prime the worker with everything registered so far.
        let mut known = HashSet::new();
        for function_id in registry.ids() {
            let _ = request_tx.send(WorkerRequest::register_function(&function_id));
            known.insert(function_id);
        }

        Ok(WorkerSlot {
            id: worker_id,
            sender: request_tx,
            health,
            known_functions: parking_lot::Mutex::new(known),
            thread: Some(thread),
        })
    }

    /// Execute a registered function on a balancer-selected worker.
    pub async fn execute(
        &self,
        function_id: &str,
        args: Vec<Value>,
        timeout: Timeout,
    ) -> RuntimeResult<Value> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RuntimeError::SchedulerUnavailable {
                state: "shutting-down".to_string(),
            });
        }
        if !self.registry.has(function_id) {
            return Err(RuntimeError::UnknownFunctionId {
                function_id: function_id.to_string(),
            });
        }

        // Snapshot the chosen worker under the lock, then release it before
        // any await point.
        let (worker_id, sender, health) = {
            let workers = self.workers.read();
            let healths: Vec<Arc<WorkerHealth>> =
                workers.iter().map(|s| Arc::clone(&s.health)).collect();
            let index = self.balancer.pick(&healths).ok_or_else(|| {
                RuntimeError::Internal("worker pool has no workers".to_string())
            })?;
            let slot = &workers[index];

            // Replicate on demand before the first call targeting this id;
            // the FIFO queue guarantees registration lands first.
            let mut known = slot.known_functions.lock();
            if !known.contains(function_id) {
                let _ = slot
                    .sender
                    .send(WorkerRequest::register_function(function_id));
                known.insert(function_id.to_string());
            }
            (slot.id, slot.sender.clone(), Arc::clone(&slot.health))
        };

        let request = WorkerRequest::execute(
            function_id,
            args,
            timeout.as_duration().map(|d| d.as_millis() as u64),
        );
        let request_id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                tx,
                worker_id,
            },
        );
        health.add_load();
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);

        if sender.send(request).is_err() {
            self.pending.remove(&request_id);
            health.sub_load();
            health.transition(WorkerState::Dead);
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(RuntimeError::WorkerDied { worker_id });
        }

        // The caller's timer and the worker's answer race; first one wins
        // and the loser is discarded.
        let wait = match timeout {
            Timeout::Infinite => None,
            Timeout::NonBlocking => Some(Duration::ZERO),
            Timeout::Millis(m) => Some(Duration::from_millis(m)),
        };
        let response = match wait {
            None => rx.await.ok(),
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(result) => result.ok(),
                Err(_) => {
                    if self.pending.remove(&request_id).is_some() {
                        health.sub_load();
                    }
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(RuntimeError::WorkerTimeout {
                        timeout_ms: timeout.millis(),
                    });
                }
            },
        };

        let Some(response) = response else {
            // Pending entry cleared underneath us: the worker died.
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(RuntimeError::WorkerDied { worker_id });
        };

        if response.success {
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            let err = decode_error(response.error.as_deref().unwrap_or("worker error"));
            if matches!(err, RuntimeError::RoutinePanic { .. })
                && health.record_error() >= ERROR_THRESHOLD
            {
                warn!(worker_id, "worker exceeded error threshold");
                health.transition(WorkerState::Dying);
                if self.config.auto_restart {
                    self.restart_worker(worker_id)?;
                }
            }
            Err(err)
        }
    }

    /// Probe every worker; restart the dead ones when auto-restart is on.
    /// Returns the number of workers that answered.
    pub async fn heartbeat_all(&self) -> usize {
        let probes: Vec<(usize, Sender<WorkerRequest>, Arc<WorkerHealth>, bool)> = {
            let workers = self.workers.read();
            workers
                .iter()
                .map(|slot| {
                    let finished = slot
                        .thread
                        .as_ref()
                        .map(|t| t.is_finished())
                        .unwrap_or(true);
                    (
                        slot.id,
                        slot.sender.clone(),
                        Arc::clone(&slot.health),
                        finished,
                    )
                })
                .collect()
        };

        let mut responsive = 0;
        for (worker_id, sender, health, finished) in probes {
            if finished {
                health.transition(WorkerState::Dead);
            }
            if !health.is_alive() {
                if self.config.auto_restart && !self.shutting_down.load(Ordering::Acquire) {
                    let _ = self.restart_worker(worker_id);
                }
                continue;
            }

            let request = WorkerRequest::heartbeat();
            let request_id = request.id.clone();
            let (tx, rx) = oneshot::channel();
            self.pending
                .insert(request_id.clone(), PendingRequest { tx, worker_id });
            health.add_load();
            if sender.send(request).is_err() {
                self.pending.remove(&request_id);
                health.sub_load();
                health.transition(WorkerState::Dead);
                continue;
            }
            match tokio::time::timeout(HEARTBEAT_TIMEOUT, rx).await {
                Ok(Ok(response)) if response.success => responsive += 1,
                _ => {
                    if self.pending.remove(&request_id).is_some() {
                        health.sub_load();
                    }
                    if health.record_error() >= ERROR_THRESHOLD {
                        health.transition(WorkerState::Dying);
                        if self.config.auto_restart {
                            let _ = self.restart_worker(worker_id);
                        }
                    }
                }
            }
        }
        responsive
    }

    /// Replace a dead worker under the same id. In-flight requests against
    /// it are rejected with `worker.died`.
    fn restart_worker(&self, worker_id: usize) -> RuntimeResult<()> {
        let response_tx = {
            let guard = self.response_tx.lock();
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                // Shutdown already took the channel: nothing to restart onto.
                None => return Ok(()),
            }
        };

        // Reject everything still pending on the dead worker.
        let doomed: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.worker_id == worker_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in doomed {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.tx.send(WorkerResponse::err(
                    id,
                    worker_id,
                    encode_error(&RuntimeError::WorkerDied { worker_id }),
                ));
            }
        }

        let slot = Self::start_slot(worker_id, &self.registry, &self.board, response_tx)?;
        self.healths.insert(worker_id, Arc::clone(&slot.health));
        let mut workers = self.workers.write();
        if let Some(existing) = workers.iter_mut().find(|s| s.id == worker_id) {
            debug!(worker_id, "worker restarted");
            *existing = slot;
        }
        Ok(())
    }

    /// Stop all workers. Idempotent; waits up to the grace period before
    /// detaching stragglers.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("worker pool shutting down");

        {
            let workers = self.workers.read();
            for slot in workers.iter() {
                slot.health.transition(WorkerState::Dying);
                let _ = slot.sender.send(WorkerRequest::shutdown());
            }
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            let all_done = {
                let workers = self.workers.read();
                workers.iter().all(|slot| {
                    slot.thread
                        .as_ref()
                        .map(|t| t.is_finished())
                        .unwrap_or(true)
                })
            };
            if all_done || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        {
            let mut workers = self.workers.write();
            for slot in workers.iter_mut() {
                slot.health.transition(WorkerState::Dead);
                match slot.thread.take() {
                    Some(thread) if thread.is_finished() => {
                        let _ = thread.join();
                    }
                    Some(_) => {
                        warn!(worker_id = slot.id, "worker did not exit in time, detaching");
                    }
                    None => {}
                }
            }
        }

        // Reject whatever is still pending, then let the dispatcher drain.
        let remaining: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in remaining {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let worker_id = entry.worker_id;
                let _ = entry.tx.send(WorkerResponse::err(
                    id,
                    worker_id,
                    encode_error(&RuntimeError::WorkerDied { worker_id }),
                ));
            }
        }
        self.response_tx.lock().take();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            // Once the exited workers' sender clones are gone the dispatcher
            // loop ends. A detached worker keeps its clone alive, so join
            // only when the loop has actually finished.
            let drain_deadline = tokio::time::Instant::now() + Duration::from_millis(200);
            while !dispatcher.is_finished() && tokio::time::Instant::now() < drain_deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if dispatcher.is_finished() {
                let _ = dispatcher.join();
            }
        }
        debug!("worker pool stopped");
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn snapshot_board(&self) -> Arc<SnapshotBoard> {
        Arc::clone(&self.board)
    }

    /// Health view across all workers.
    pub fn worker_health(&self) -> Vec<WorkerHealthSnapshot> {
        let workers = self.workers.read();
        workers
            .iter()
            .map(|slot| WorkerHealthSnapshot {
                worker_id: slot.id,
                state: format!("{:?}", slot.health.state()).to_lowercase(),
                load: slot.health.load(),
                error_count: slot.health.error_count(),
                last_heartbeat_ms: slot.health.last_heartbeat_ms(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool_with(thread_count: usize) -> (WorkerPool, Arc<FunctionRegistry>) {
        let registry = Arc::new(FunctionRegistry::new());
        let config = SchedulerConfig {
            thread_count: Some(thread_count),
            ..Default::default()
        };
        let pool = WorkerPool::new(
            config,
            Arc::clone(&registry),
            Arc::new(SnapshotBoard::new()),
        )
        .unwrap();
        (pool, registry)
    }

    #[tokio::test]
    async fn executes_on_a_worker_thread() {
        let (pool, registry) = pool_with(2);
        registry
            .register("thread_name", |_args| {
                let name = std::thread::current()
                    .name()
                    .unwrap_or("unnamed")
                    .to_string();
                Ok(json!(name))
            })
            .unwrap();

        let result = pool
            .execute("thread_name", vec![], Timeout::Millis(2000))
            .await
            .unwrap();
        let name = result.as_str().unwrap_or("").to_string();
        assert!(name.starts_with("routines-worker-"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_function_fails_before_dispatch() {
        let (pool, _registry) = pool_with(1);
        let err = pool
            .execute("missing", vec![], Timeout::Millis(1000))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "registry.unknown-function");
        assert_eq!(pool.stats().dispatched(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn late_registration_replicates_on_demand() {
        let (pool, registry) = pool_with(2);
        // Registered after the pool started.
        registry
            .register("late", |_args| Ok(json!("late-ok")))
            .unwrap();

        for _ in 0..4 {
            let result = pool
                .execute("late", vec![], Timeout::Millis(2000))
                .await
                .unwrap();
            assert_eq!(result, json!("late-ok"));
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn slow_job_times_out_and_late_response_is_dropped() {
        let (pool, registry) = pool_with(1);
        registry
            .register("slow", |_args| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(json!("done"))
            })
            .unwrap();

        let err = pool
            .execute("slow", vec![], Timeout::Millis(30))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "worker.timeout");

        // Give the worker time to post the now-orphaned response; the
        // dispatcher must drop it and leave no pending entry behind.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.pending_requests(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_counts_live_workers() {
        let (pool, _registry) = pool_with(3);
        assert_eq!(pool.heartbeat_all().await, 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (pool, _registry) = pool_with(2);
        pool.shutdown().await;
        pool.shutdown().await;
        let err = pool
            .execute("anything", vec![], Timeout::Millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "scheduler.unavailable");
    }

    #[tokio::test]
    async fn stats_track_outcomes() {
        let (pool, registry) = pool_with(2);
        registry.register("ok", |_args| Ok(json!(1))).unwrap();
        registry
            .register("bad", |_args| {
                Err(RuntimeError::Internal("nope".to_string()))
            })
            .unwrap();

        pool.execute("ok", vec![], Timeout::Millis(2000))
            .await
            .unwrap();
        pool.execute("bad", vec![], Timeout::Millis(2000))
            .await
            .unwrap_err();

        let stats = pool.stats();
        assert_eq!(stats.dispatched(), 2);
        assert_eq!(stats.completed(), 1);
        assert_eq!(stats.failed(), 1);
        pool.shutdown().await;
    }
}
