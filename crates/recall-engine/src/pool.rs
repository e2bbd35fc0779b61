use std::sync::Arc;

use dashmap::DashMap;
use recall_core::ids::{SessionId, TurnKey};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancellation handles of in-flight turns, keyed by turn.
///
/// Every terminal transition must call [`ControllerPool::remove`]; a handle
/// left behind would keep reporting the turn as active.
#[derive(Clone, Default)]
pub struct ControllerPool {
    handles: Arc<DashMap<TurnKey, CancellationToken>>,
}

impl ControllerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: TurnKey, handle: CancellationToken) {
        if let Some(previous) = self.handles.insert(key, handle) {
            // A key is only ever registered once; cancel a stray handle
            // rather than orphan it.
            previous.cancel();
        }
    }

    /// Release the handle without cancelling it.
    pub fn remove(&self, key: TurnKey) -> bool {
        self.handles.remove(&key).is_some()
    }

    /// Cancel an in-flight turn. Unknown or finished keys are a no-op.
    pub fn cancel(&self, key: TurnKey) -> bool {
        match self.handles.get(&key) {
            Some(handle) => {
                debug!(turn = %key, "cancelling turn");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight turn of one session.
    pub fn cancel_session(&self, session_id: SessionId) -> usize {
        let mut cancelled = 0;
        for entry in self.handles.iter() {
            if entry.key().session_id == session_id {
                entry.value().cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn cancel_all(&self) {
        for entry in self.handles.iter() {
            entry.value().cancel();
        }
    }

    pub fn is_active(&self, key: TurnKey) -> bool {
        self.handles.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
