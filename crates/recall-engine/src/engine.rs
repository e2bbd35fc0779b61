use std::sync::Arc;

use recall_core::ids::{SequenceId, SessionId};
use recall_core::messages::ChatMessage;
use recall_core::template::{PlaceholderFiller, TemplateFiller};
use recall_core::tokens::{HeuristicEstimator, TokenEstimator};
use recall_core::transport::ChatTransport;
use recall_settings::RecallSettings;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::assembler::{ContextAssembler, ContextWindow};
use crate::compressor::{CompressionPolicy, MemoryCompressor};
use crate::controller::{TurnController, TurnHandle};
use crate::error::Result;
use crate::persist::PersistedState;
use crate::pool::ControllerPool;
use crate::store::SessionStore;

/// Wires the store, assembler, compressor and turn controller around one
/// transport.
pub struct ChatEngine {
    settings: RecallSettings,
    store: SessionStore,
    assembler: Arc<ContextAssembler>,
    compressor: Arc<MemoryCompressor>,
    controller: Arc<TurnController>,
    pool: ControllerPool,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl ChatEngine {
    pub fn new(settings: RecallSettings, transport: Arc<dyn ChatTransport>) -> Self {
        Self::with_components(
            settings,
            transport,
            Arc::new(HeuristicEstimator),
            Arc::new(PlaceholderFiller),
        )
    }

    pub fn with_components(
        settings: RecallSettings,
        transport: Arc<dyn ChatTransport>,
        estimator: Arc<dyn TokenEstimator>,
        filler: Arc<dyn TemplateFiller>,
    ) -> Self {
        let store = SessionStore::new();
        let pool = ControllerPool::new();
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let assembler = Arc::new(ContextAssembler::from_settings(
            &settings.engine,
            estimator.clone(),
            filler,
        ));
        let compressor = Arc::new(MemoryCompressor::new(
            store.clone(),
            transport.clone(),
            estimator,
            CompressionPolicy::from(&settings.engine),
            tasks.clone(),
            shutdown.clone(),
        ));
        let controller = Arc::new(TurnController::new(
            store.clone(),
            transport,
            assembler.clone(),
            compressor.clone(),
            pool.clone(),
            tasks.clone(),
        ));

        Self {
            settings,
            store,
            assembler,
            compressor,
            controller,
            pool,
            tasks,
            shutdown,
        }
    }

    pub fn settings(&self) -> &RecallSettings {
        &self.settings
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn compressor(&self) -> &Arc<MemoryCompressor> {
        &self.compressor
    }

    /// New session using the configured default model settings.
    pub fn create_session(&self) -> SessionId {
        self.store.create(self.settings.model.clone())
    }

    pub fn create_session_with_prompts(&self, context_prompts: Vec<ChatMessage>) -> SessionId {
        self.store
            .create_with_prompts(self.settings.model.clone(), context_prompts)
    }

    /// Submit user input as a new turn.
    pub fn on_user_input(&self, session_id: SessionId, content: &str) -> Result<TurnHandle> {
        self.controller.submit_turn(session_id, content, None)
    }

    pub fn submit_turn(
        &self,
        session_id: SessionId,
        content: &str,
        title: Option<&str>,
    ) -> Result<TurnHandle> {
        self.controller.submit_turn(session_id, content, title)
    }

    pub fn cancel_turn(&self, session_id: SessionId, sequence_id: SequenceId) -> bool {
        self.controller.cancel_turn(session_id, sequence_id)
    }

    pub fn active_turns(&self) -> usize {
        self.pool.len()
    }

    /// The context window the next turn of `session_id` would send.
    pub fn assemble(&self, session_id: SessionId) -> Result<ContextWindow> {
        self.store
            .read(session_id, |s| self.assembler.assemble(s, &s.model_config))
    }

    /// Cancel the session's turns and remove it.
    pub fn delete_session(&self, session_id: SessionId) -> Result<()> {
        let _ = self.pool.cancel_session(session_id);
        let _ = self.store.delete(session_id)?;
        Ok(())
    }

    pub fn snapshot(&self) -> PersistedState {
        PersistedState::capture(&self.store)
    }

    pub fn restore(&self, state: PersistedState) {
        info!(sessions = state.sessions.len(), "restoring sessions");
        state.restore_into(&self.store);
    }

    /// Wait until every turn and background memory task has settled.
    pub async fn wait_idle(&self) {
        // Tasks spawned while closed are still tracked, which covers
        // post-turn work started by finishing turns.
        let _ = self.tasks.close();
        self.tasks.wait().await;
        let _ = self.tasks.reopen();
    }

    /// Cancel everything in flight and wait for it to wind down.
    pub async fn shutdown(&self) {
        info!(active_turns = self.pool.len(), "shutting down");
        self.shutdown.cancel();
        self.pool.cancel_all();
        self.wait_idle().await;
    }
}
