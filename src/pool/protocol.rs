//! Main ↔ worker wire records
//!
//! Messages are JSON-shaped with stable field names. Only data crosses the
//! boundary: a function travels as its registry id, never as code. The
//! `serialized_fn` and `dependencies` fields exist for wire-format
//! compatibility and are never populated by this crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time;

/// Request kinds a worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    RegisterFunction,
    Execute,
    Heartbeat,
    Shutdown,
}

/// A request from the scheduler to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Correlation id, unique per process.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serialized_fn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    /// Execute timeout in milliseconds. The caller's timer governs; this
    /// field travels so the worker can log and account for it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl WorkerRequest {
    pub fn register_function(function_id: impl Into<String>) -> Self {
        Self {
            id: next_message_id(),
            kind: RequestKind::RegisterFunction,
            function_id: Some(function_id.into()),
            serialized_fn: None,
            dependencies: None,
            args: None,
            timeout: None,
        }
    }

    pub fn execute(
        function_id: impl Into<String>,
        args: Vec<Value>,
        timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            id: next_message_id(),
            kind: RequestKind::Execute,
            function_id: Some(function_id.into()),
            serialized_fn: None,
            dependencies: None,
            args: Some(args),
            timeout: timeout_ms,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            id: next_message_id(),
            kind: RequestKind::Heartbeat,
            function_id: None,
            serialized_fn: None,
            dependencies: None,
            args: None,
            timeout: None,
        }
    }

    pub fn shutdown() -> Self {
        Self {
            id: next_message_id(),
            kind: RequestKind::Shutdown,
            function_id: None,
            serialized_fn: None,
            dependencies: None,
            args: None,
            timeout: None,
        }
    }
}

/// A worker's answer to one request, matched back by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub worker_id: usize,
}

impl WorkerResponse {
    pub fn ok(id: impl Into<String>, worker_id: usize, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
            worker_id,
        }
    }

    pub fn err(id: impl Into<String>, worker_id: usize, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            worker_id,
        }
    }
}

/// Fresh correlation id: `msg_<epoch-millis>_<random>`.
pub fn next_message_id() -> String {
    format!("msg_{}_{:08x}", time::epoch_ms(), fastrand::u32(..))
}
