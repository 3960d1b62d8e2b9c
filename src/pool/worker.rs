//! Worker thread: message loop, job execution, health
//!
//! A worker is one OS thread with a FIFO request queue and a local cache of
//! registered functions. Jobs run inside `catch_unwind`, so a panicking job
//! produces an error response instead of killing the thread. Requests are
//! processed strictly in order; a `register_function` sent before an
//! `execute` is therefore always applied first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{panic_message, RuntimeError};
use crate::proxy::{self, SnapshotBoard};
use crate::registry::{FunctionRegistry, RegisteredFunction};
use crate::time;

use super::protocol::{RequestKind, WorkerRequest, WorkerResponse};

/// Consecutive worker-level errors before the worker is considered dead.
pub const ERROR_THRESHOLD: usize = 3;

/// Lifecycle of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Alive,
    Dying,
    Dead,
}

/// Shared health record for one worker, updated from both sides of the
/// boundary.
pub struct WorkerHealth {
    alive: AtomicBool,
    state: parking_lot::Mutex<WorkerState>,
    last_heartbeat_ms: AtomicU64,
    error_count: AtomicUsize,
    load: AtomicUsize,
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            state: parking_lot::Mutex::new(WorkerState::Alive),
            last_heartbeat_ms: AtomicU64::new(time::epoch_ms()),
            error_count: AtomicUsize::new(0),
            load: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Forward-only transition.
    pub fn transition(&self, next: WorkerState) {
        let mut state = self.state.lock();
        let allowed = matches!(
            (*state, next),
            (WorkerState::Alive, WorkerState::Dying)
                | (WorkerState::Alive, WorkerState::Dead)
                | (WorkerState::Dying, WorkerState::Dead)
        );
        if allowed {
            *state = next;
            if next == WorkerState::Dead {
                self.alive.store(false, Ordering::Release);
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Healthy workers are alive with an error count under the threshold.
    pub fn is_healthy(&self) -> bool {
        self.is_alive() && self.error_count() < ERROR_THRESHOLD
    }

    pub fn beat(&self) {
        self.last_heartbeat_ms
            .store(time::epoch_ms(), Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    pub fn record_error(&self) -> usize {
        self.error_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn add_load(&self) {
        self.load.fetch_add(1, Ordering::AcqRel);
    }

    pub fn sub_load(&self) {
        let _ = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }
}

pub(crate) struct WorkerRuntime {
    pub id: usize,
    pub requests: Receiver<WorkerRequest>,
    pub responses: Sender<WorkerResponse>,
    pub registry: Arc<FunctionRegistry>,
    pub board: Arc<SnapshotBoard>,
    pub health: Arc<WorkerHealth>,
}

impl WorkerRuntime {
    /// Message loop. Runs until shutdown or channel disconnect.
    fn run(self) {
        proxy::install_board(Arc::clone(&self.board));
        let mut local: HashMap<String, RegisteredFunction> = HashMap::new();
        debug!(worker_id = self.id, "worker started");

        while let Ok(request) = self.requests.recv() {
            self.health.beat();
            match request.kind {
                RequestKind::RegisterFunction => {
                    let response = self.handle_register(&request, &mut local);
                    self.respond(response);
                }
                RequestKind::Execute => {
                    let response = self.handle_execute(&request, &mut local);
                    self.respond(response);
                }
                RequestKind::Heartbeat => {
                    self.respond(WorkerResponse::ok(
                        request.id,
                        self.id,
                        json!({ "worker_id": self.id, "ts": time::epoch_ms() }),
                    ));
                }
                RequestKind::Shutdown => {
                    self.health.transition(WorkerState::Dying);
                    self.respond(WorkerResponse::ok(
                        request.id,
                        self.id,
                        json!({ "shutdown": true }),
                    ));
                    // Let the ack drain before the loop exits.
                    std::thread::sleep(Duration::from_millis(10));
                    break;
                }
            }
        }

        self.health.transition(WorkerState::Dying);
        self.health.transition(WorkerState::Dead);
        debug!(worker_id = self.id, "worker stopped");
    }

    /// Prime the local cache from the shared registry.
    fn handle_register(
        &self,
        request: &WorkerRequest,
        local: &mut HashMap<String, RegisteredFunction>,
    ) -> WorkerResponse {
        let Some(function_id) = request.function_id.as_deref() else {
            return self.malformed(request, "register_function without function_id");
        };
        match self.registry.lookup(function_id) {
            Ok(entry) => {
                local.insert(function_id.to_string(), entry);
                WorkerResponse::ok(request.id.clone(), self.id, json!({ "registered": true }))
            }
            Err(err) => self.failure(request, &err),
        }
    }

    fn handle_execute(
        &self,
        request: &WorkerRequest,
        local: &mut HashMap<String, RegisteredFunction>,
    ) -> WorkerResponse {
        let Some(function_id) = request.function_id.as_deref() else {
            return self.malformed(request, "execute without function_id");
        };
        // Local cache first; fall back to the shared registry for a
        // function registered after this worker was primed.
        let entry = match local.get(function_id) {
            Some(entry) => entry.clone(),
            None => match self.registry.lookup(function_id) {
                Ok(entry) => {
                    local.insert(function_id.to_string(), entry.clone());
                    entry
                }
                Err(err) => return self.failure(request, &err),
            },
        };

        let args = request.args.clone().unwrap_or_default();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            entry.invoke(args)
        }));

        match outcome {
            Ok(Ok(result)) => WorkerResponse::ok(request.id.clone(), self.id, result),
            Ok(Err(err)) => self.failure(request, &err),
            Err(payload) => {
                let err = RuntimeError::RoutinePanic {
                    message: panic_message(payload),
                };
                warn!(worker_id = self.id, function_id, "job panicked");
                self.failure(request, &err)
            }
        }
    }

    fn malformed(&self, request: &WorkerRequest, detail: &str) -> WorkerResponse {
        let err = RuntimeError::WorkerUnknownMessage {
            message: detail.to_string(),
        };
        self.failure(request, &err)
    }

    fn failure(&self, request: &WorkerRequest, err: &RuntimeError) -> WorkerResponse {
        WorkerResponse::err(request.id.clone(), self.id, encode_error(err))
    }

    fn respond(&self, response: WorkerResponse) {
        if self.responses.send(response).is_err() {
            // Dispatcher gone; the pool is tearing down.
            debug!(worker_id = self.id, "response channel closed");
        }
    }
}

/// Spawn the worker thread.
pub(crate) fn spawn_worker(
    runtime: WorkerRuntime,
) -> crate::error::RuntimeResult<std::thread::JoinHandle<()>> {
    let id = runtime.id;
    std::thread::Builder::new()
        .name(format!("routines-worker-{id}"))
        .spawn(move || runtime.run())
        .map_err(|e| RuntimeError::Internal(format!("spawning worker thread {id}: {e}")))
}

/// Encode an error for the wire: stable code, then the display form.
pub(crate) fn encode_error(err: &RuntimeError) -> String {
    format!("{}: {}", err.code(), err)
}

/// Decode a wire error back into the taxonomy. Codes that carry no fields
/// map to their variant; everything else surfaces as `Internal` with the
/// original text preserved.
pub(crate) fn decode_error(wire: &str) -> RuntimeError {
    let code = wire.split(':').next().unwrap_or("");
    let detail = wire
        .split_once(':')
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_else(|| wire.to_string());
    match code {
        "registry.unknown-function" => RuntimeError::UnknownFunctionId {
            function_id: detail,
        },
        "registry.duplicate-id" => RuntimeError::DuplicateFunctionId {
            function_id: detail,
        },
        "routine.panic" => RuntimeError::RoutinePanic { message: detail },
        "worker.unknown-message" => RuntimeError::WorkerUnknownMessage { message: detail },
        "worker.cross-thread-sync-unsupported" => RuntimeError::CrossThreadSyncUnsupported,
        "context.cancelled" => RuntimeError::ContextCancelled,
        "context.deadline-exceeded" => RuntimeError::ContextDeadlineExceeded,
        _ => RuntimeError::Internal(wire.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn start_worker(
        registry: Arc<FunctionRegistry>,
    ) -> (
        Sender<WorkerRequest>,
        Receiver<WorkerResponse>,
        Arc<WorkerHealth>,
        std::thread::JoinHandle<()>,
    ) {
        let (req_tx, req_rx) = unbounded();
        let (resp_tx, resp_rx) = unbounded();
        let health = Arc::new(WorkerHealth::new());
        let handle = spawn_worker(WorkerRuntime {
            id: 0,
            requests: req_rx,
            responses: resp_tx,
            registry,
            board: Arc::new(SnapshotBoard::new()),
            health: Arc::clone(&health),
        })
        .unwrap();
        (req_tx, resp_rx, health, handle)
    }

    #[test]
    fn executes_a_registered_function() {
        let registry = Arc::new(FunctionRegistry::new());
        registry
            .register("add", |args| {
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(json!(sum))
            })
            .unwrap();
        let (req_tx, resp_rx, _health, handle) = start_worker(registry);

        let request = WorkerRequest::execute("add", vec![json!(20), json!(22)], None);
        let id = request.id.clone();
        req_tx.send(request).unwrap();

        let response = resp_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(response.id, id);
        assert!(response.success);
        assert_eq!(response.result, Some(json!(42)));

        req_tx.send(WorkerRequest::shutdown()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn unknown_function_produces_a_typed_error() {
        let registry = Arc::new(FunctionRegistry::new());
        let (req_tx, resp_rx, _health, handle) = start_worker(registry);

        req_tx
            .send(WorkerRequest::execute("nope", vec![], None))
            .unwrap();
        let response = resp_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!response.success);
        let err = decode_error(response.error.as_deref().unwrap_or(""));
        assert_eq!(err.code(), "registry.unknown-function");

        req_tx.send(WorkerRequest::shutdown()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn job_panic_becomes_an_error_response_and_the_worker_survives() {
        let registry = Arc::new(FunctionRegistry::new());
        registry
            .register("boom", |_args| -> crate::error::RuntimeResult<Value> {
                panic!("job exploded")
            })
            .unwrap();
        registry.register("ok", |_args| Ok(json!(1))).unwrap();
        let (req_tx, resp_rx, health, handle) = start_worker(registry);

        req_tx
            .send(WorkerRequest::execute("boom", vec![], None))
            .unwrap();
        let response = resp_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!response.success);
        assert_eq!(
            decode_error(response.error.as_deref().unwrap_or("")).code(),
            "routine.panic"
        );

        // Same thread keeps serving requests.
        req_tx
            .send(WorkerRequest::execute("ok", vec![], None))
            .unwrap();
        let response = resp_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(response.success);
        assert!(health.is_alive());

        req_tx.send(WorkerRequest::shutdown()).unwrap();
        handle.join().unwrap();
        assert_eq!(health.state(), WorkerState::Dead);
    }

    #[test]
    fn heartbeat_responds_and_refreshes_the_record() {
        let registry = Arc::new(FunctionRegistry::new());
        let (req_tx, resp_rx, health, handle) = start_worker(registry);
        let before = health.last_heartbeat_ms();

        std::thread::sleep(Duration::from_millis(5));
        req_tx.send(WorkerRequest::heartbeat()).unwrap();
        let response = resp_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(response.success);
        assert!(health.last_heartbeat_ms() >= before);

        req_tx.send(WorkerRequest::shutdown()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn error_threshold_flips_health() {
        let health = WorkerHealth::new();
        assert!(health.is_healthy());
        for _ in 0..ERROR_THRESHOLD {
            health.record_error();
        }
        assert!(!health.is_healthy());
        assert!(health.is_alive());
    }
}
