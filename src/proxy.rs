//! Read-only views of primitives across the worker boundary
//!
//! Synchronization primitives live in exactly one address space. What
//! crosses to a worker is a snapshot: plain serializable state with no
//! handle back to the live object, so mutation from the worker side is not
//! expressible. The one dynamic escape hatch, [`SyncProxy::mutate`], exists
//! for callers porting from looser runtimes and always fails with
//! `worker.cross-thread-sync-unsupported`.
//!
//! The scheduler keeps a [`SnapshotBoard`] per pool and republishes context
//! state through the cancellation hook, so a long-running job can poll
//! [`context_err`] and observe cancellation without re-entering the
//! original context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::Channel;
use crate::context::{Context, ContextId};
use crate::error::{RuntimeError, RuntimeResult};
use crate::sync::Mutex;
use crate::time;

/// Immutable view of a context at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: ContextId,
    /// Deadline as epoch milliseconds, if one is set.
    pub deadline_epoch_ms: Option<u64>,
    /// Stable error code once the context is terminal.
    pub err_code: Option<String>,
    /// All key/value pairs visible from the context.
    pub values: HashMap<String, Value>,
}

impl ContextSnapshot {
    pub fn of(ctx: &Context) -> Self {
        let deadline_epoch_ms = ctx.deadline().map(|deadline| {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            time::epoch_ms() + remaining.as_millis() as u64
        });
        Self {
            id: ctx.id(),
            deadline_epoch_ms,
            err_code: ctx.err().map(|e| e.code().to_string()),
            values: ctx.values(),
        }
    }
}

/// Immutable view of a channel's observable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub len: usize,
    pub capacity: usize,
    pub closed: bool,
}

impl ChannelSnapshot {
    pub fn of<T>(chan: &Channel<T>) -> Self {
        Self {
            len: chan.len(),
            capacity: chan.capacity(),
            closed: chan.is_closed(),
        }
    }
}

/// Immutable view of a mutex's observable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutexSnapshot {
    pub locked: bool,
}

impl MutexSnapshot {
    pub fn of(mutex: &Mutex) -> Self {
        Self {
            locked: mutex.is_locked(),
        }
    }
}

/// Wire descriptor for a primitive crossing the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "proxy", rename_all = "snake_case")]
pub enum SyncProxy {
    Context(ContextSnapshot),
    Channel(ChannelSnapshot),
    Mutex(MutexSnapshot),
}

impl SyncProxy {
    /// Serialize for the job-argument path.
    pub fn to_value(&self) -> RuntimeResult<Value> {
        serde_json::to_value(self)
            .map_err(|e| RuntimeError::Internal(format!("proxy serialization: {e}")))
    }

    /// Every mutating operation on a proxied primitive fails: the live
    /// object is unreachable from this side of the boundary.
    pub fn mutate(&self, _operation: &str) -> RuntimeResult<Value> {
        Err(RuntimeError::CrossThreadSyncUnsupported)
    }
}

/// Context snapshots shared between the scheduler and its workers.
#[derive(Default)]
pub struct SnapshotBoard {
    entries: DashMap<ContextId, ContextSnapshot>,
}

impl SnapshotBoard {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Publish or refresh a snapshot.
    pub fn publish(&self, snapshot: ContextSnapshot) {
        self.entries.insert(snapshot.id, snapshot);
    }

    /// Record a terminal error for a tracked context.
    pub fn update_err(&self, id: ContextId, code: &str) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.err_code = Some(code.to_string());
        }
    }

    pub fn get(&self, id: &ContextId) -> Option<ContextSnapshot> {
        self.entries.get(id).map(|e| e.clone())
    }

    pub fn remove(&self, id: &ContextId) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

thread_local! {
    static CURRENT_BOARD: RefCell<Option<Arc<SnapshotBoard>>> = const { RefCell::new(None) };
}

/// Bind a board to the current worker thread.
pub(crate) fn install_board(board: Arc<SnapshotBoard>) {
    CURRENT_BOARD.with(|slot| *slot.borrow_mut() = Some(board));
}

/// Snapshot of a tracked context, readable from inside a running job.
pub fn context_snapshot(id: &ContextId) -> Option<ContextSnapshot> {
    CURRENT_BOARD.with(|slot| slot.borrow().as_ref().and_then(|board| board.get(id)))
}

/// Terminal error code of a tracked context, readable from inside a
/// running job. `None` while the context is live.
pub fn context_err(id: &ContextId) -> Option<String> {
    context_snapshot(id).and_then(|snapshot| snapshot.err_code)
}
