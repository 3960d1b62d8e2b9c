//! Cancellation-propagating context tree
//!
//! A context carries an optional deadline, a cancellation error, and
//! key/value pairs, rooted at [`Context::background`]. Cancelling a context
//! cancels its whole subtree; a deadline arms a timer that cancels with
//! `context.deadline-exceeded`. Parents hold strong references to children
//! for the cascade; children hold weak back-references, so dropping every
//! user handle reclaims the subtree.
//!
//! A process-wide cancellation hook observes every cancelled context id so
//! the parallel scheduler can push state updates to its workers.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::RuntimeError;

/// Context identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub Uuid);

impl ContextId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Hook invoked with every cancelled context id and its terminal error.
pub type CancellationHook = Arc<dyn Fn(ContextId, &RuntimeError) + Send + Sync>;

static CANCELLATION_HOOK: OnceLock<parking_lot::RwLock<Option<CancellationHook>>> =
    OnceLock::new();

fn hook_slot() -> &'static parking_lot::RwLock<Option<CancellationHook>> {
    CANCELLATION_HOOK.get_or_init(|| parking_lot::RwLock::new(None))
}

/// Install the process-wide cancellation hook, replacing any previous one.
pub fn set_cancellation_hook(hook: CancellationHook) {
    *hook_slot().write() = Some(hook);
}

/// Remove the process-wide cancellation hook.
pub fn clear_cancellation_hook() {
    *hook_slot().write() = None;
}

struct CtxState {
    err: Option<RuntimeError>,
    children: Vec<Arc<ContextInner>>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

struct ContextInner {
    id: ContextId,
    parent: Option<Weak<ContextInner>>,
    /// Effective deadline: the earliest along the parent chain.
    deadline: Option<Instant>,
    /// Key/value pair contributed by this node, if any.
    value: Option<(String, Value)>,
    /// Present only on cancellable nodes; closed on cancellation.
    done: Option<Channel<()>>,
    state: parking_lot::Mutex<CtxState>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }
}

/// A node in the cancellation tree. Cloning shares the node.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

/// Cancels the context it was derived with. Inert when the derivation
/// collapsed into the parent (deadline later than the parent's).
pub struct CancelHandle {
    target: Option<Context>,
}

impl CancelHandle {
    /// Cancel the associated context with `context.cancelled`.
    pub fn cancel(&self) {
        if let Some(ctx) = &self.target {
            ctx.cancel_with(RuntimeError::ContextCancelled);
        }
    }
}

static BACKGROUND: OnceLock<Context> = OnceLock::new();

impl Context {
    /// The uncancellable root context.
    pub fn background() -> Self {
        BACKGROUND
            .get_or_init(|| Self {
                inner: Arc::new(ContextInner {
                    id: ContextId::new(),
                    parent: None,
                    deadline: None,
                    value: None,
                    done: None,
                    state: parking_lot::Mutex::new(CtxState {
                        err: None,
                        children: Vec::new(),
                        timer: None,
                    }),
                }),
            })
            .clone()
    }

    /// Derive a cancellable child.
    pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
        let child = Self::derive(parent, None, None, true);
        let handle = CancelHandle {
            target: Some(child.clone()),
        };
        (child, handle)
    }

    /// Derive a child that cancels itself at `deadline`.
    ///
    /// When the parent's effective deadline is already earlier, no new node
    /// is created: the parent comes back with an inert cancel handle.
    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelHandle) {
        if let Some(parent_deadline) = parent.deadline() {
            if parent_deadline <= deadline {
                return (parent.clone(), CancelHandle { target: None });
            }
        }
        let child = Self::derive(parent, Some(deadline), None, true);
        child.arm_deadline_timer(deadline);
        let handle = CancelHandle {
            target: Some(child.clone()),
        };
        (child, handle)
    }

    /// Derive a child that cancels itself after `duration`.
    pub fn with_timeout(parent: &Context, duration: Duration) -> (Context, CancelHandle) {
        Self::with_deadline(parent, Instant::now() + duration)
    }

    /// Derive a child carrying one key/value pair.
    pub fn with_value(
        parent: &Context,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Context {
        Self::derive(parent, None, Some((key.into(), value.into())), false)
    }

    fn derive(
        parent: &Context,
        deadline: Option<Instant>,
        value: Option<(String, Value)>,
        cancellable: bool,
    ) -> Context {
        let effective_deadline = match (parent.deadline(), deadline) {
            (Some(p), Some(d)) => Some(p.min(d)),
            (p, d) => p.or(d),
        };
        let child = Context {
            inner: Arc::new(ContextInner {
                id: ContextId::new(),
                parent: Some(Arc::downgrade(&parent.inner)),
                deadline: effective_deadline,
                value,
                done: if cancellable {
                    Some(Channel::unbuffered())
                } else {
                    None
                },
                state: parking_lot::Mutex::new(CtxState {
                    err: None,
                    children: Vec::new(),
                    timer: None,
                }),
            }),
        };

        // Register with the nearest cancellable ancestor so the cascade can
        // reach this node. Uncancellable ancestors never cascade, so
        // attaching there would only accumulate garbage.
        let mut ancestor = Some(Arc::clone(&parent.inner));
        while let Some(node) = ancestor {
            if node.done.is_some() {
                let already_failed = {
                    let mut state = node.state.lock();
                    match &state.err {
                        Some(err) => Some(err.clone()),
                        None => {
                            state.children.push(Arc::clone(&child.inner));
                            None
                        }
                    }
                };
                // Derived from a context that is already over: the child is
                // born cancelled.
                if let Some(err) = already_failed {
                    child.cancel_with(err);
                }
                break;
            }
            ancestor = node.parent.as_ref().and_then(Weak::upgrade);
        }
        child
    }

    fn arm_deadline_timer(&self, deadline: Instant) {
        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                Context { inner }.cancel_with(RuntimeError::ContextDeadlineExceeded);
            }
        });
        self.inner.state.lock().timer = Some(timer);
    }

    /// Unique id of this node.
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Effective deadline, if any along the chain.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Terminal error: `None` until cancelled or expired.
    pub fn err(&self) -> Option<RuntimeError> {
        let own = self.inner.state.lock().err.clone();
        if own.is_some() {
            return own;
        }
        // A value-only node reports the nearest cancellable ancestor.
        if self.inner.done.is_none() {
            let mut ancestor = self.inner.parent.as_ref().and_then(Weak::upgrade);
            while let Some(node) = ancestor {
                if node.done.is_some() {
                    return node.state.lock().err.clone();
                }
                ancestor = node.parent.as_ref().and_then(Weak::upgrade);
            }
        }
        None
    }

    /// Whether this context has been cancelled or has expired.
    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// The done channel: closed on cancellation. `None` for contexts that
    /// can never be cancelled.
    pub fn done(&self) -> Option<Channel<()>> {
        if let Some(done) = &self.inner.done {
            return Some(done.clone());
        }
        let mut ancestor = self.inner.parent.as_ref().and_then(Weak::upgrade);
        while let Some(node) = ancestor {
            if let Some(done) = &node.done {
                return Some(done.clone());
            }
            ancestor = node.parent.as_ref().and_then(Weak::upgrade);
        }
        None
    }

    /// Suspend until this context is cancelled. Never resolves for an
    /// uncancellable context.
    pub async fn cancelled(&self) {
        match self.done() {
            Some(done) => {
                // The done channel only ever closes; any receive outcome
                // means cancellation has happened.
                let _ = done
                    .receive_timeout(crate::validate::Timeout::Infinite)
                    .await;
            }
            None => futures::future::pending::<()>().await,
        }
    }

    /// Look up a value on this node or the nearest ancestor carrying `key`.
    pub fn value(&self, key: &str) -> Option<Value> {
        if let Some((k, v)) = &self.inner.value {
            if k == key {
                return Some(v.clone());
            }
        }
        let mut ancestor = self.inner.parent.as_ref().and_then(Weak::upgrade);
        while let Some(node) = ancestor {
            if let Some((k, v)) = &node.value {
                if k == key {
                    return Some(v.clone());
                }
            }
            ancestor = node.parent.as_ref().and_then(Weak::upgrade);
        }
        None
    }

    /// All key/value pairs visible from this node, outermost shadowed by
    /// innermost. Used to snapshot a context for the worker boundary.
    pub fn values(&self) -> std::collections::HashMap<String, Value> {
        let mut chain = Vec::new();
        if let Some(pair) = &self.inner.value {
            chain.push(pair.clone());
        }
        let mut ancestor = self.inner.parent.as_ref().and_then(Weak::upgrade);
        while let Some(node) = ancestor {
            if let Some(pair) = &node.value {
                chain.push(pair.clone());
            }
            ancestor = node.parent.as_ref().and_then(Weak::upgrade);
        }
        // Innermost wins: walk outermost-first and overwrite.
        let mut map = std::collections::HashMap::new();
        for (k, v) in chain.into_iter().rev() {
            map.insert(k, v);
        }
        map
    }

    pub(crate) fn cancel_with(&self, err: RuntimeError) {
        let mut cancelled_ids = Vec::new();
        cancel_subtree(&self.inner, &err, &mut cancelled_ids);
        if cancelled_ids.is_empty() {
            return;
        }
        debug!(
            root = %self.inner.id,
            cancelled = cancelled_ids.len(),
            code = err.code(),
            "context cancelled"
        );
        let hook = hook_slot().read().clone();
        if let Some(hook) = hook {
            for id in cancelled_ids {
                hook(id, &err);
            }
        }
    }
}

/// Mark the subtree cancelled, close done channels, and collect the ids.
fn cancel_subtree(node: &Arc<ContextInner>, err: &RuntimeError, out: &mut Vec<ContextId>) {
    let children = {
        let mut state = node.state.lock();
        if state.err.is_some() {
            // Already terminal; the subtree below was handled then.
            return;
        }
        state.err = Some(err.clone());
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        // Dropping the strong child refs here lets the subtree be reclaimed
        // once user handles go away.
        std::mem::take(&mut state.children)
    };
    if let Some(done) = &node.done {
        let _ = done.close();
    }
    out.push(node.id);
    for child in children {
        cancel_subtree(&child, err, out);
    }
}
