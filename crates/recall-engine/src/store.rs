//! Process-wide collection of sessions.
//!
//! Every mutation goes through [`SessionStore::update`] (or a helper built on
//! it): the closure runs under a short `parking_lot` lock, indices are
//! clamped, the session revision is bumped and a [`SessionEvent`] is
//! broadcast. The lock is never held across an `.await`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use recall_core::config::ModelConfig;
use recall_core::ids::{SequenceId, SessionId};
use recall_core::messages::ChatMessage;
use recall_core::session::Session;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEventKind {
    Created,
    Updated,
    Deleted,
}

/// Change notification for observers (UI, persistence).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub revision: u64,
    pub kind: SessionEventKind,
}

#[derive(Default)]
struct StoreInner {
    sessions: BTreeMap<SessionId, Session>,
    next_id: u64,
}

impl StoreInner {
    fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId::new(self.next_id)
    }
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<StoreInner>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Change events as a stream. Events missed by a slow consumer are
    /// skipped.
    pub fn changes(&self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| async move { event.ok() })
    }

    fn emit(&self, session_id: SessionId, revision: u64, kind: SessionEventKind) {
        // No subscribers is normal for headless use.
        let _ = self.events.send(SessionEvent {
            session_id,
            revision,
            kind,
        });
    }

    pub fn create(&self, model_config: ModelConfig) -> SessionId {
        self.create_with_prompts(model_config, Vec::new())
    }

    /// Create a session seeded with context prompts (a "mask"). Seeded
    /// prompts replace the synthesized system prompt in every request.
    pub fn create_with_prompts(
        &self,
        model_config: ModelConfig,
        context_prompts: Vec<ChatMessage>,
    ) -> SessionId {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.allocate_id();
            let mut session = Session::new(id, model_config, Utc::now());
            session.context_prompts = context_prompts;
            let _ = inner.sessions.insert(id, session);
            id
        };
        debug!(session_id = %id, "session created");
        self.emit(id, 0, SessionEventKind::Created);
        id
    }

    /// Insert a fully-formed session, e.g. one restored from disk. An
    /// existing session with the same id is replaced.
    pub fn insert(&self, session: Session) {
        let id = session.id;
        let revision = session.revision;
        {
            let mut inner = self.inner.lock();
            inner.next_id = inner.next_id.max(id.get());
            if inner.sessions.insert(id, session).is_some() {
                warn!(session_id = %id, "replacing existing session");
            }
        }
        self.emit(id, revision, SessionEventKind::Created);
    }

    /// Snapshot of one session.
    pub fn get(&self, id: SessionId) -> Result<Session> {
        self.read(id, Session::clone)
    }

    /// Run `f` against a session without cloning it.
    pub fn read<R>(&self, id: SessionId, f: impl FnOnce(&Session) -> R) -> Result<R> {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(&id)
            .map(f)
            .ok_or(EngineError::SessionNotFound(id))
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.lock().sessions.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.inner.lock().sessions.keys().copied().collect()
    }

    /// Snapshots of every session, ordered by id.
    pub fn sessions(&self) -> Vec<Session> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutate one session. Afterwards both indices are clamped, the revision
    /// is bumped and observers are notified.
    pub fn update<R>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> R) -> Result<R> {
        let (result, revision) = {
            let mut inner = self.inner.lock();
            let session = inner
                .sessions
                .get_mut(&id)
                .ok_or(EngineError::SessionNotFound(id))?;
            let result = f(session);
            session.clamp_indices();
            session.touch(Utc::now());
            (result, session.revision)
        };
        self.emit(id, revision, SessionEventKind::Updated);
        Ok(result)
    }

    pub fn delete(&self, id: SessionId) -> Result<Session> {
        let removed = self
            .inner
            .lock()
            .sessions
            .remove(&id)
            .ok_or(EngineError::SessionNotFound(id))?;
        debug!(session_id = %id, "session deleted");
        self.emit(id, removed.revision, SessionEventKind::Deleted);
        Ok(removed)
    }

    /// Clear messages and memory, keeping topic and statistics.
    pub fn reset_session(&self, id: SessionId) -> Result<()> {
        self.update(id, Session::reset)
    }

    /// Toggle the clear-context marker at the current end of the
    /// conversation. Returns the new marker.
    pub fn toggle_clear_context(&self, id: SessionId) -> Result<usize> {
        self.update(id, |session| {
            session.toggle_clear_context();
            session.clear_context_index
        })
    }

    pub fn delete_message(&self, id: SessionId, sequence_id: SequenceId) -> Result<()> {
        let deleted = self.update(id, |session| session.delete_message(sequence_id))?;
        if deleted {
            Ok(())
        } else {
            Err(EngineError::MessageNotFound {
                session_id: id,
                sequence_id,
            })
        }
    }

    /// Drop `messages[index..]`.
    pub fn reset_from_index(&self, id: SessionId, index: usize) -> Result<()> {
        self.update(id, |session| {
            let len = session.messages.len();
            if index > len {
                return Err(EngineError::InvalidIndex { index, len });
            }
            session.truncate_from(index);
            Ok(())
        })?
    }

    pub fn set_model_config(&self, id: SessionId, model_config: ModelConfig) -> Result<()> {
        self.update(id, |session| session.model_config = model_config)
    }

    pub fn set_topic(&self, id: SessionId, topic: impl Into<String>) -> Result<()> {
        let topic = topic.into();
        self.update(id, |session| session.topic = topic)
    }
}
