//! Drives one user turn from submission to a terminal state.
//!
//! ```text
//! Pending ──accepted──▶ Streaming ──Done──▶ Finished
//!    │                      ├──Error─────▶ Errored
//!    └──rejected──▶ Errored └──cancel────▶ Cancelled
//! ```
//!
//! Each turn is keyed by its session and the sequence id of the assistant
//! message it streams into. The cancellation handle lives in the
//! [`ControllerPool`] from submission until the terminal transition.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use recall_core::errors::GatewayError;
use recall_core::ids::{SequenceId, SessionId, TurnKey};
use recall_core::messages::Role;
use recall_core::stream::{ChatStream, StreamEvent, TextAccumulator};
use recall_core::template::fill_input_template;
use recall_core::transport::{ChatRequest, ChatTransport};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use crate::assembler::ContextAssembler;
use crate::compressor::MemoryCompressor;
use crate::error::{EngineError, Result};
use crate::pool::ControllerPool;
use crate::prompts::trim_topic;
use crate::store::SessionStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Pending,
    Streaming,
    Finished,
    Errored,
    Cancelled,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Errored | Self::Cancelled)
    }
}

/// Observer for one submitted turn. Dropping it does not affect the turn.
#[derive(Debug)]
pub struct TurnHandle {
    key: TurnKey,
    user_sequence_id: SequenceId,
    state: watch::Receiver<TurnState>,
}

impl TurnHandle {
    pub fn key(&self) -> TurnKey {
        self.key
    }

    pub fn session_id(&self) -> SessionId {
        self.key.session_id
    }

    /// Sequence id of the assistant message the turn streams into.
    pub fn reply_sequence_id(&self) -> SequenceId {
        self.key.sequence_id
    }

    pub fn user_sequence_id(&self) -> SequenceId {
        self.user_sequence_id
    }

    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// Wait for the terminal state.
    pub async fn wait(mut self) -> TurnState {
        let terminal = self.state.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        terminal.unwrap_or_else(|_| *self.state.borrow())
    }
}

pub struct TurnController {
    store: SessionStore,
    transport: Arc<dyn ChatTransport>,
    assembler: Arc<ContextAssembler>,
    compressor: Arc<MemoryCompressor>,
    pool: ControllerPool,
    tasks: TaskTracker,
}

impl TurnController {
    pub fn new(
        store: SessionStore,
        transport: Arc<dyn ChatTransport>,
        assembler: Arc<ContextAssembler>,
        compressor: Arc<MemoryCompressor>,
        pool: ControllerPool,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            store,
            transport,
            assembler,
            compressor,
            pool,
            tasks,
        }
    }

    pub fn pool(&self) -> &ControllerPool {
        &self.pool
    }

    /// Start a turn: store the user message and an empty streaming reply,
    /// then drive the backend request in the background.
    ///
    /// The request carries the context window assembled from history before
    /// this turn, followed by the new user message.
    pub fn submit_turn(
        self: &Arc<Self>,
        session_id: SessionId,
        content: &str,
        title: Option<&str>,
    ) -> Result<TurnHandle> {
        let assembler = &self.assembler;
        let topic_max_chars = self.compressor.policy().topic_max_chars;

        let (request, user_sequence_id, reply_sequence_id) =
            self.store.update(session_id, |s| {
                let config = s.model_config.clone();
                let vars = assembler.template_vars(s, &config);
                let user_content = fill_input_template(
                    assembler.filler(),
                    config.template.as_deref(),
                    content,
                    &vars,
                );
                let window = assembler.assemble(s, &config);

                let now = Utc::now();
                let user_sequence_id = s.push_message(Role::User, user_content, now);
                let mut messages = window.messages;
                messages.extend(s.message(user_sequence_id).cloned());
                let reply_sequence_id = s.push_pending_reply(&config.model, now);

                if let Some(title) = title {
                    let title = trim_topic(title, topic_max_chars);
                    if !title.is_empty() && s.has_default_topic() {
                        s.topic = title;
                    }
                }

                let request = ChatRequest {
                    messages,
                    model: config.model,
                    temperature: config.temperature,
                    stream: true,
                };
                (request, user_sequence_id, reply_sequence_id)
            })?;

        let key = TurnKey::new(session_id, reply_sequence_id);
        let cancel = CancellationToken::new();
        self.pool.add(key, cancel.clone());
        let (state_tx, state_rx) = watch::channel(TurnState::Pending);
        debug!(turn = %key, messages = request.messages.len(), "turn submitted");

        let this = Arc::clone(self);
        let _ = self.tasks.spawn(async move {
            this.run_turn(key, user_sequence_id, request, cancel, state_tx)
                .await;
        });

        Ok(TurnHandle {
            key,
            user_sequence_id,
            state: state_rx,
        })
    }

    /// Cancel an in-flight turn. Unknown or finished turns are a no-op.
    pub fn cancel_turn(&self, session_id: SessionId, sequence_id: SequenceId) -> bool {
        self.pool.cancel(TurnKey::new(session_id, sequence_id))
    }

    #[instrument(skip_all, fields(turn = %key))]
    async fn run_turn(
        self: Arc<Self>,
        key: TurnKey,
        user_sequence_id: SequenceId,
        request: ChatRequest,
        cancel: CancellationToken,
        state: watch::Sender<TurnState>,
    ) {
        let outcome = match self.open_stream(&request, &cancel).await {
            Ok(stream) => {
                let _ = state.send_replace(TurnState::Streaming);
                self.drive_stream(key, stream, &cancel).await
            }
            Err(e) => Err(EngineError::Gateway(e)),
        };

        // Released on every terminal path.
        let _ = self.pool.remove(key);

        let terminal = match outcome {
            Ok(text) => self.finish_turn(key, text),
            Err(EngineError::Gateway(e)) if e.is_cancellation() => self.abort_turn(key),
            Err(EngineError::Gateway(e)) => self.fail_turn(key, user_sequence_id, &e),
            Err(e) => {
                warn!(error = %e, "turn abandoned");
                TurnState::Errored
            }
        };
        let _ = state.send_replace(terminal);
    }

    async fn open_stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ChatStream, GatewayError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = self.transport.stream(request, cancel.clone()) => result,
        }
    }

    async fn drive_stream(
        &self,
        key: TurnKey,
        mut stream: ChatStream,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut acc = TextAccumulator::default();
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(GatewayError::Cancelled.into()),
                event = stream.next() => event,
            };
            match event {
                Some(StreamEvent::Start) => {}
                Some(StreamEvent::TextDelta { delta }) => {
                    let partial = acc.push(&delta).to_string();
                    trace!(len = partial.len(), "delta");
                    self.apply_partial(key, partial)?;
                }
                Some(StreamEvent::Done { text }) => return Ok(acc.finish(text)),
                Some(StreamEvent::Error { error }) => return Err(error.into()),
                None => {
                    return Err(GatewayError::StreamInterrupted(
                        "stream ended without a terminal event".into(),
                    )
                    .into())
                }
            }
        }
    }

    fn apply_partial(&self, key: TurnKey, partial: String) -> Result<()> {
        self.store.update(key.session_id, |s| {
            let reply = s
                .message_mut(key.sequence_id)
                .ok_or(EngineError::MessageNotFound {
                    session_id: key.session_id,
                    sequence_id: key.sequence_id,
                })?;
            reply.set_content(partial);
            reply.set_streaming(true);
            Ok(())
        })?
    }

    fn finish_turn(&self, key: TurnKey, text: String) -> TurnState {
        let estimator = self.assembler.estimator();
        let finished = self.store.update(key.session_id, |s| {
            let Some(reply) = s.message_mut(key.sequence_id) else {
                return false;
            };
            if reply.content != text {
                reply.set_content(text);
            }
            reply.set_streaming(false);
            let tokens = estimator.estimate(&reply.content);
            let content = reply.content.clone();
            s.stat.record_reply(&content, tokens);
            true
        });

        match finished {
            Ok(true) => {
                info!("turn finished");
                self.compressor.after_turn(key.session_id);
                TurnState::Finished
            }
            Ok(false) => {
                warn!("reply removed before the turn finished");
                TurnState::Errored
            }
            Err(e) => {
                warn!(error = %e, "session removed before the turn finished");
                TurnState::Errored
            }
        }
    }

    fn fail_turn(&self, key: TurnKey, user_sequence_id: SequenceId, error: &GatewayError) -> TurnState {
        warn!(kind = error.error_kind(), error = %error, "turn failed");
        let block = error_block(error);
        let result = self.store.update(key.session_id, |s| {
            if let Some(reply) = s.message_mut(key.sequence_id) {
                reply.append_content(&block);
                reply.set_streaming(false);
                reply.mark_error();
            }
            if let Some(user) = s.message_mut(user_sequence_id) {
                user.mark_error();
            }
        });
        if let Err(e) = result {
            debug!(error = %e, "session removed before the failure was recorded");
        }
        TurnState::Errored
    }

    /// Cancellation keeps the partial content and leaves both messages
    /// usable in later context windows.
    fn abort_turn(&self, key: TurnKey) -> TurnState {
        info!("turn cancelled");
        let result = self.store.update(key.session_id, |s| {
            if let Some(reply) = s.message_mut(key.sequence_id) {
                reply.set_streaming(false);
            }
        });
        if let Err(e) = result {
            debug!(error = %e, "session removed before the cancellation was recorded");
        }
        TurnState::Cancelled
    }
}

/// Error details appended to a failed reply as a fenced JSON block.
fn error_block(error: &GatewayError) -> String {
    let body = serde_json::json!({
        "error": true,
        "kind": error.error_kind(),
        "message": error.to_string(),
    });
    let pretty = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
    format!("\n\n```json\n{pretty}\n```")
}
