//! Function registry
//!
//! Workers execute *registered* functions only: a stable string id mapped
//! to a typed job callable. The registry replaces any scheme that ships
//! source text to workers; every admissible function is known to the
//! process up front, and only the id plus JSON arguments travel on the
//! wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};
use crate::time;

/// Arguments handed to a registered function.
pub type JobArgs = Vec<Value>;

/// A registered job callable. Jobs are synchronous by design: they run on a
/// dedicated worker thread and may burn CPU freely.
pub type JobFn = Arc<dyn Fn(JobArgs) -> RuntimeResult<Value> + Send + Sync>;

/// Usage statistics for one registered function.
#[derive(Debug)]
pub struct JobStats {
    registered_at_ms: u64,
    last_used_ms: AtomicU64,
    call_count: AtomicU64,
}

impl JobStats {
    fn new() -> Self {
        Self {
            registered_at_ms: time::epoch_ms(),
            last_used_ms: AtomicU64::new(0),
            call_count: AtomicU64::new(0),
        }
    }

    pub fn registered_at_ms(&self) -> u64 {
        self.registered_at_ms
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }
}

/// One registry entry: callable plus usage stats.
#[derive(Clone)]
pub struct RegisteredFunction {
    pub id: String,
    pub func: JobFn,
    pub stats: Arc<JobStats>,
}

impl std::fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("id", &self.id)
            .field("func", &"<fn>")
            .field("stats", &self.stats)
            .finish()
    }
}

impl RegisteredFunction {
    /// Invoke the callable, updating usage stats.
    pub fn invoke(&self, args: JobArgs) -> RuntimeResult<Value> {
        self.stats.call_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_used_ms
            .store(time::epoch_ms(), Ordering::Relaxed);
        (self.func)(args)
    }
}

/// Process-wide index of registered functions, shared with every worker.
#[derive(Default)]
pub struct FunctionRegistry {
    entries: DashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a callable under a process-unique id.
    pub fn register<F>(&self, id: impl Into<String>, func: F) -> RuntimeResult<()>
    where
        F: Fn(JobArgs) -> RuntimeResult<Value> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.entries.contains_key(&id) {
            return Err(RuntimeError::DuplicateFunctionId { function_id: id });
        }
        debug!(function_id = %id, "function registered");
        self.entries.insert(
            id.clone(),
            RegisteredFunction {
                id,
                func: Arc::new(func),
                stats: Arc::new(JobStats::new()),
            },
        );
        Ok(())
    }

    /// Fetch an entry by id.
    pub fn lookup(&self, id: &str) -> RuntimeResult<RegisteredFunction> {
        self.entries
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| RuntimeError::UnknownFunctionId {
                function_id: id.to_string(),
            })
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove an entry; other ids are unaffected.
    pub fn unregister(&self, id: &str) -> RuntimeResult<()> {
        self.entries
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::UnknownFunctionId {
                function_id: id.to_string(),
            })
    }

    /// Usage stats for an id.
    pub fn stats(&self, id: &str) -> RuntimeResult<Arc<JobStats>> {
        self.lookup(id).map(|entry| entry.stats)
    }

    /// All registered ids, for pool-start replication.
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
