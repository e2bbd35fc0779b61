//! Post-turn memory maintenance.
//!
//! After each finished turn the [`MemoryCompressor`] decides, per session,
//! whether to derive a topic label and whether to fold recent history into
//! the rolling summary. Both run as tracked background tasks and never block
//! the turn that triggered them.
//!
//! ## Summary algorithm
//!
//! 1. Candidates start at `max(last_summarize_index, clear_context_index)`,
//!    error messages excluded.
//! 2. Over-budget candidates are trimmed to the last `history_message_count`.
//! 3. The current summary is prepended as a system message.
//! 4. The backend is called only when `send_memory` is on and the untrimmed
//!    candidates exceed `compress_message_length_threshold`.
//! 5. Each streamed delta overwrites `memory_summary`. On success
//!    `last_summarize_index` moves to the message count captured at trigger
//!    time; on failure the old summary is restored.

use std::sync::Arc;

use dashmap::DashSet;
use futures::StreamExt;
use recall_core::errors::GatewayError;
use recall_core::ids::SessionId;
use recall_core::messages::ChatMessage;
use recall_core::session::Session;
use recall_core::stream::{collect_text, StreamEvent, TextAccumulator};
use recall_core::tokens::{estimate_messages, TokenEstimator};
use recall_core::transport::{ChatRequest, ChatTransport};
use recall_settings::EngineSettings;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::prompts::{memory_message_text, trim_topic, SUMMARIZE_INSTRUCTION, TOPIC_INSTRUCTION};
use crate::store::SessionStore;

/// Thresholds governing topic derivation and summary trimming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub auto_topic: bool,
    pub topic_min_tokens: u32,
    pub topic_max_chars: usize,
    /// Trim budget for sessions whose `max_tokens` is not positive.
    pub summary_fallback_max_tokens: u32,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for CompressionPolicy {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            auto_topic: settings.auto_topic,
            topic_min_tokens: settings.topic_min_tokens,
            topic_max_chars: settings.topic_max_chars,
            summary_fallback_max_tokens: settings.summary_fallback_max_tokens,
        }
    }
}

/// What a summary pass would send, computed from one session snapshot.
#[derive(Clone, Debug)]
pub struct SummaryPlan {
    pub request: ChatRequest,
    /// Estimated tokens of the untrimmed candidates.
    pub history_tokens: u32,
    /// `messages.len()` at trigger time.
    pub summarize_index: usize,
    /// Summary to restore if the request fails.
    pub previous_summary: String,
    /// `history_epoch` at trigger time. Results are dropped once it moves.
    pub history_epoch: u64,
    pub should_compress: bool,
}

pub struct MemoryCompressor {
    store: SessionStore,
    transport: Arc<dyn ChatTransport>,
    estimator: Arc<dyn TokenEstimator>,
    policy: CompressionPolicy,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    topic_inflight: DashSet<SessionId>,
    summary_inflight: DashSet<SessionId>,
}

impl MemoryCompressor {
    pub fn new(
        store: SessionStore,
        transport: Arc<dyn ChatTransport>,
        estimator: Arc<dyn TokenEstimator>,
        policy: CompressionPolicy,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            transport,
            estimator,
            policy,
            tasks,
            shutdown,
            topic_inflight: DashSet::new(),
            summary_inflight: DashSet::new(),
        }
    }

    pub fn policy(&self) -> &CompressionPolicy {
        &self.policy
    }

    pub fn is_summarizing(&self, session_id: SessionId) -> bool {
        self.summary_inflight.contains(&session_id)
    }

    /// The topic request for `session`, if derivation is due.
    pub fn plan_topic(&self, session: &Session) -> Option<ChatRequest> {
        if !self.policy.auto_topic || !session.has_default_topic() {
            return None;
        }
        let tokens = estimate_messages(self.estimator.as_ref(), &session.messages);
        if tokens < self.policy.topic_min_tokens {
            return None;
        }

        let config = &session.model_config;
        let mut messages = session.messages.clone();
        messages.push(ChatMessage::user(TOPIC_INSTRUCTION, session.last_update));
        Some(ChatRequest {
            messages,
            model: config.summarize_model().to_string(),
            temperature: config.temperature,
            stream: false,
        })
    }

    pub fn plan_summary(&self, session: &Session) -> SummaryPlan {
        let config = &session.model_config;
        let summarize_from = session
            .last_summarize_index
            .max(session.clear_context_index);

        let mut candidates: Vec<ChatMessage> = session
            .messages
            .get(summarize_from..)
            .unwrap_or_default()
            .iter()
            .filter(|m| !m.is_error)
            .cloned()
            .collect();
        let history_tokens = estimate_messages(self.estimator.as_ref(), &candidates);

        let trim_budget = if config.max_tokens > 0 {
            config.token_budget()
        } else {
            self.policy.summary_fallback_max_tokens
        };
        if history_tokens > trim_budget {
            let keep_from = candidates
                .len()
                .saturating_sub(config.history_message_count);
            let _ = candidates.drain(..keep_from);
        }

        let mut messages = Vec::with_capacity(candidates.len() + 2);
        if !session.memory_summary.is_empty() {
            messages.push(ChatMessage::system(
                memory_message_text(&session.memory_summary),
                session.last_update,
            ));
        }
        messages.extend(candidates);
        messages.push(ChatMessage::system(SUMMARIZE_INSTRUCTION, session.last_update));

        SummaryPlan {
            request: ChatRequest {
                messages,
                model: config.summarize_model().to_string(),
                temperature: config.temperature,
                stream: true,
            },
            history_tokens,
            summarize_index: session.messages.len(),
            previous_summary: session.memory_summary.clone(),
            history_epoch: session.history_epoch,
            should_compress: config.send_memory
                && history_tokens > config.compress_message_length_threshold,
        }
    }

    /// Schedule topic derivation and summary compression for a session
    /// whose turn just finished.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub fn after_turn(self: &Arc<Self>, session_id: SessionId) {
        let plans = self
            .store
            .read(session_id, |s| (self.plan_topic(s), self.plan_summary(s)));
        let (topic, summary) = match plans {
            Ok(plans) => plans,
            Err(e) => {
                debug!(error = %e, "session gone before post-turn maintenance");
                return;
            }
        };

        if let Some(request) = topic {
            if self.topic_inflight.insert(session_id) {
                let this = Arc::clone(self);
                let _ = self
                    .tasks
                    .spawn(async move { this.derive_topic(session_id, request).await });
            }
        }

        if summary.should_compress {
            if self.summary_inflight.insert(session_id) {
                info!(
                    history_tokens = summary.history_tokens,
                    summarize_index = summary.summarize_index,
                    "compressing history"
                );
                let this = Arc::clone(self);
                let _ = self
                    .tasks
                    .spawn(async move { this.compress(session_id, summary).await });
            } else {
                debug!("summary already in flight, skipping");
            }
        }
    }

    async fn derive_topic(self: Arc<Self>, session_id: SessionId, request: ChatRequest) {
        let result = self.request_topic(&request).await;
        let _ = self.topic_inflight.remove(&session_id);

        let text = match result {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "topic derivation failed");
                return;
            }
        };
        let topic = trim_topic(&text, self.policy.topic_max_chars);
        if topic.is_empty() {
            debug!(session_id = %session_id, "backend returned an empty topic");
            return;
        }

        let applied = self.store.update(session_id, |s| {
            if s.has_default_topic() {
                s.topic = topic.clone();
                true
            } else {
                false
            }
        });
        match applied {
            Ok(true) => info!(session_id = %session_id, topic = %topic, "topic derived"),
            Ok(false) => debug!(session_id = %session_id, "topic already set"),
            Err(e) => debug!(session_id = %session_id, error = %e, "session gone"),
        }
    }

    async fn request_topic(&self, request: &ChatRequest) -> std::result::Result<String, GatewayError> {
        let stream = self
            .transport
            .stream(request, self.shutdown.child_token())
            .await?;
        collect_text(stream).await
    }

    async fn compress(self: Arc<Self>, session_id: SessionId, plan: SummaryPlan) {
        let epoch = plan.history_epoch;
        let outcome = self.stream_summary(session_id, epoch, &plan.request).await;

        let applied = match outcome {
            Ok(summary) if !summary.trim().is_empty() => {
                let index = plan.summarize_index;
                self.store.update(session_id, |s| {
                    if s.history_epoch != epoch {
                        return false;
                    }
                    s.memory_summary = summary;
                    s.last_summarize_index = index.min(s.messages.len());
                    true
                })
            }
            Ok(_) => {
                warn!(session_id = %session_id, "empty summary, keeping previous");
                self.restore_summary(session_id, epoch, plan.previous_summary)
            }
            Err(EngineError::HistoryDiscarded) => Ok(false),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "summary compression failed");
                self.restore_summary(session_id, epoch, plan.previous_summary)
            }
        };
        match applied {
            Ok(true) => {}
            Ok(false) => {
                info!(session_id = %session_id, "history discarded during compression, result dropped");
            }
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "session gone after compression");
            }
        }

        let _ = self.summary_inflight.remove(&session_id);
    }

    fn restore_summary(&self, session_id: SessionId, epoch: u64, previous: String) -> Result<bool> {
        self.store.update(session_id, |s| {
            if s.history_epoch != epoch {
                return false;
            }
            s.memory_summary = previous;
            true
        })
    }

    /// Stream the summary into the session. Stops with
    /// [`EngineError::HistoryDiscarded`] once the session history is reset
    /// or truncated under it.
    async fn stream_summary(
        &self,
        session_id: SessionId,
        epoch: u64,
        request: &ChatRequest,
    ) -> Result<String> {
        let mut stream = self
            .transport
            .stream(request, self.shutdown.child_token())
            .await?;
        let mut acc = TextAccumulator::default();

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Start => {}
                StreamEvent::TextDelta { delta } => {
                    let partial = acc.push(&delta).to_string();
                    let current = self.store.update(session_id, |s| {
                        if s.history_epoch != epoch {
                            return false;
                        }
                        s.memory_summary = partial;
                        true
                    })?;
                    if !current {
                        return Err(EngineError::HistoryDiscarded);
                    }
                }
                StreamEvent::Done { text } => return Ok(acc.finish(text)),
                StreamEvent::Error { error } => return Err(error.into()),
            }
        }
        Err(EngineError::Gateway(GatewayError::StreamInterrupted(
            "summary stream ended without a terminal event".into(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use recall_core::config::ModelConfig;
    use recall_core::messages::Role;
    use recall_core::mock::{MockResponse, MockTransport};
    use recall_core::tokens::HeuristicEstimator;
    use recall_core::DEFAULT_TOPIC;
    use tokio::sync::Notify;

    struct Harness {
        store: SessionStore,
        transport: Arc<MockTransport>,
        compressor: Arc<MemoryCompressor>,
        tasks: TaskTracker,
    }

    impl Harness {
        fn new(responses: Vec<MockResponse>, policy: CompressionPolicy) -> Self {
            let store = SessionStore::new();
            let transport = Arc::new(MockTransport::new(responses));
            let tasks = TaskTracker::new();
            let compressor = Arc::new(MemoryCompressor::new(
                store.clone(),
                transport.clone(),
                Arc::new(HeuristicEstimator),
                policy,
                tasks.clone(),
                CancellationToken::new(),
            ));
            Self {
                store,
                transport,
                compressor,
                tasks,
            }
        }

        async fn idle(&self) {
            self.tasks.close();
            self.tasks.wait().await;
            let _ = self.tasks.reopen();
        }
    }

    fn no_topic() -> CompressionPolicy {
        CompressionPolicy {
            auto_topic: false,
            ..Default::default()
        }
    }

    fn config(threshold: u32, send_memory: bool) -> ModelConfig {
        ModelConfig {
            compress_message_length_threshold: threshold,
            send_memory,
            history_message_count: 2,
            ..Default::default()
        }
    }

    /// `pairs` exchanges of roughly 25 tokens each.
    fn seed(store: &SessionStore, config: ModelConfig, pairs: usize) -> SessionId {
        let id = store.create(config);
        store
            .update(id, |s| {
                for i in 0..pairs {
                    let _ = s.push_message(Role::User, format!("{i} {}", "q".repeat(48)), Utc::now());
                    let _ = s.push_message(Role::Assistant, format!("{i} {}", "a".repeat(48)), Utc::now());
                }
            })
            .unwrap();
        id
    }

    // ── planning ────────────────────────────────────────────────────

    #[test]
    fn summary_starts_after_markers_and_skips_errors() {
        let h = Harness::new(vec![], no_topic());
        let id = seed(&h.store, config(10, true), 3);
        h.store
            .update(id, |s| {
                s.last_summarize_index = 2;
                s.clear_context_index = 1;
                s.messages[3].mark_error();
                s.memory_summary = "earlier".into();
            })
            .unwrap();
        let plan = h.store.read(id, |s| h.compressor.plan_summary(s)).unwrap();

        let msgs = &plan.request.messages;
        assert_eq!(msgs[0].content, memory_message_text("earlier"));
        // messages 2, 4, 5 (3 is an error), then the instruction.
        assert_eq!(msgs.len(), 5);
        assert!(msgs[1].content.starts_with("1 q"));
        assert_eq!(msgs.last().unwrap().content, SUMMARIZE_INSTRUCTION);
        assert_eq!(plan.summarize_index, 6);
        assert!(plan.request.stream);
    }

    #[test]
    fn over_budget_candidates_keep_last_history_count() {
        let h = Harness::new(vec![], no_topic());
        let cfg = ModelConfig {
            max_tokens: 60,
            ..config(10, true)
        };
        let id = seed(&h.store, cfg, 4);
        let plan = h.store.read(id, |s| h.compressor.plan_summary(s)).unwrap();
        // 2 kept candidates + instruction; untrimmed cost still reported.
        assert_eq!(plan.request.messages.len(), 3);
        assert!(plan.history_tokens > 60);
        assert!(plan.should_compress);
    }

    #[test]
    fn non_positive_max_tokens_uses_fallback_budget() {
        let h = Harness::new(vec![], no_topic());
        let cfg = ModelConfig {
            max_tokens: 0,
            ..config(10, true)
        };
        let id = seed(&h.store, cfg, 4);
        let plan = h.store.read(id, |s| h.compressor.plan_summary(s)).unwrap();
        assert_eq!(plan.request.messages.len(), 9);
    }

    #[test]
    fn summarize_model_overrides_model() {
        let h = Harness::new(vec![], no_topic());
        let cfg = ModelConfig {
            summarize_model: Some("small-model".into()),
            ..config(10, true)
        };
        let id = seed(&h.store, cfg, 1);
        let plan = h.store.read(id, |s| h.compressor.plan_summary(s)).unwrap();
        assert_eq!(plan.request.model, "small-model");
    }

    #[test]
    fn topic_needs_enough_history() {
        let h = Harness::new(vec![], CompressionPolicy::default());
        let short = h.store.create(ModelConfig::default());
        h.store
            .update(short, |s| {
                let _ = s.push_message(Role::User, "hi", Utc::now());
            })
            .unwrap();
        assert!(h.store.read(short, |s| h.compressor.plan_topic(s)).unwrap().is_none());

        let long = seed(&h.store, ModelConfig::default(), 2);
        let request = h
            .store
            .read(long, |s| h.compressor.plan_topic(s))
            .unwrap()
            .unwrap();
        assert!(!request.stream);
        assert_eq!(request.messages.last().unwrap().content, TOPIC_INSTRUCTION);
        assert_eq!(request.messages.last().unwrap().role, Role::User);
    }

    // ── compression ─────────────────────────────────────────────────

    #[tokio::test]
    async fn compression_fires_above_threshold_with_memory_on() {
        let h = Harness::new(vec![MockResponse::deltas(&["Sum", "mary"])], no_topic());
        let id = seed(&h.store, config(50, true), 3);

        h.compressor.after_turn(id);
        h.idle().await;

        assert_eq!(h.transport.call_count(), 1);
        let s = h.store.get(id).unwrap();
        assert_eq!(s.memory_summary, "Summary");
        assert_eq!(s.last_summarize_index, 6);
    }

    #[tokio::test]
    async fn compression_never_fires_with_memory_off() {
        let h = Harness::new(vec![], no_topic());
        let id = seed(&h.store, config(1, false), 10);

        h.compressor.after_turn(id);
        h.idle().await;

        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(h.store.get(id).unwrap().last_summarize_index, 0);
    }

    #[tokio::test]
    async fn compression_below_threshold_is_skipped() {
        let h = Harness::new(vec![], no_topic());
        let id = seed(&h.store, config(10_000, true), 3);
        h.compressor.after_turn(id);
        h.idle().await;
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn failed_compression_restores_previous_summary() {
        let h = Harness::new(
            vec![MockResponse::fail_after(
                &["partial summ"],
                GatewayError::NetworkError("reset".into()),
            )],
            no_topic(),
        );
        let id = seed(&h.store, config(50, true), 3);
        h.store
            .update(id, |s| s.memory_summary = "old summary".into())
            .unwrap();

        h.compressor.after_turn(id);
        h.idle().await;

        let s = h.store.get(id).unwrap();
        assert_eq!(s.memory_summary, "old summary");
        assert_eq!(s.last_summarize_index, 0);
        assert!(!h.compressor.is_summarizing(id));
    }

    #[tokio::test]
    async fn summarize_index_is_trigger_time_snapshot() {
        let gate = Arc::new(Notify::new());
        let h = Harness::new(
            vec![MockResponse::gated(gate.clone(), MockResponse::text("folded"))],
            no_topic(),
        );
        let id = seed(&h.store, config(50, true), 3);

        h.compressor.after_turn(id);
        tokio::task::yield_now().await;
        h.store
            .update(id, |s| {
                let _ = s.push_message(Role::User, "arrived mid-compression", Utc::now());
            })
            .unwrap();
        gate.notify_one();
        h.idle().await;

        let s = h.store.get(id).unwrap();
        assert_eq!(s.memory_summary, "folded");
        assert_eq!(s.last_summarize_index, 6);
        assert_eq!(s.messages.len(), 7);
    }

    #[tokio::test]
    async fn summary_dropped_when_session_reset_mid_flight() {
        let gate = Arc::new(Notify::new());
        let h = Harness::new(
            vec![MockResponse::gated(gate.clone(), MockResponse::text("folded"))],
            no_topic(),
        );
        let id = seed(&h.store, config(50, true), 3);

        h.compressor.after_turn(id);
        tokio::task::yield_now().await;
        h.store.reset_session(id).unwrap();
        gate.notify_one();
        h.idle().await;

        let s = h.store.get(id).unwrap();
        assert!(s.messages.is_empty());
        assert!(s.memory_summary.is_empty());
        assert_eq!(s.last_summarize_index, 0);
        assert!(!h.compressor.is_summarizing(id));
    }

    #[tokio::test]
    async fn failed_summary_does_not_restore_into_reset_session() {
        let gate = Arc::new(Notify::new());
        let h = Harness::new(
            vec![MockResponse::gated(
                gate.clone(),
                MockResponse::fail_after(&[], GatewayError::NetworkError("reset".into())),
            )],
            no_topic(),
        );
        let id = seed(&h.store, config(50, true), 3);
        h.store
            .update(id, |s| s.memory_summary = "old summary".into())
            .unwrap();

        h.compressor.after_turn(id);
        tokio::task::yield_now().await;
        h.store.reset_session(id).unwrap();
        gate.notify_one();
        h.idle().await;

        assert!(h.store.get(id).unwrap().memory_summary.is_empty());
    }

    #[tokio::test]
    async fn summary_dropped_when_history_truncated_mid_flight() {
        let gate = Arc::new(Notify::new());
        let h = Harness::new(
            vec![MockResponse::gated(gate.clone(), MockResponse::deltas(&["fol", "ded"]))],
            no_topic(),
        );
        let id = seed(&h.store, config(50, true), 3);

        h.compressor.after_turn(id);
        tokio::task::yield_now().await;
        h.store.reset_from_index(id, 2).unwrap();
        gate.notify_one();
        h.idle().await;

        let s = h.store.get(id).unwrap();
        assert_eq!(s.messages.len(), 2);
        assert!(s.memory_summary.is_empty());
        assert_eq!(s.last_summarize_index, 0);
    }

    #[tokio::test]
    async fn one_summary_in_flight_per_session() {
        let gate = Arc::new(Notify::new());
        let h = Harness::new(
            vec![MockResponse::gated(gate.clone(), MockResponse::text("first"))],
            no_topic(),
        );
        let id = seed(&h.store, config(50, true), 3);

        h.compressor.after_turn(id);
        h.compressor.after_turn(id);
        assert!(h.compressor.is_summarizing(id));
        gate.notify_one();
        h.idle().await;

        assert_eq!(h.transport.call_count(), 1);
        assert_eq!(h.store.get(id).unwrap().memory_summary, "first");
    }

    // ── topic ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn topic_derived_exactly_once() {
        let h = Harness::new(
            vec![MockResponse::text("\"Letters And Numbers.\"")],
            CompressionPolicy::default(),
        );
        let id = seed(&h.store, config(100_000, true), 3);

        h.compressor.after_turn(id);
        h.idle().await;
        assert_eq!(h.store.get(id).unwrap().topic, "Letters And Numbers");

        h.store
            .update(id, |s| {
                let _ = s.push_message(Role::User, "x".repeat(400), Utc::now());
            })
            .unwrap();
        h.compressor.after_turn(id);
        h.idle().await;

        assert_eq!(h.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_topic_keeps_sentinel() {
        let h = Harness::new(vec![MockResponse::text("  \"\"  ")], CompressionPolicy::default());
        let id = seed(&h.store, config(100_000, true), 3);
        h.compressor.after_turn(id);
        h.idle().await;
        assert_eq!(h.store.get(id).unwrap().topic, DEFAULT_TOPIC);
    }

    #[tokio::test]
    async fn failed_topic_request_can_retry() {
        let h = Harness::new(
            vec![
                MockResponse::Error(GatewayError::RateLimited { retry_after: None }),
                MockResponse::text("Second Try"),
            ],
            CompressionPolicy::default(),
        );
        let id = seed(&h.store, config(100_000, true), 3);

        h.compressor.after_turn(id);
        h.idle().await;
        assert_eq!(h.store.get(id).unwrap().topic, DEFAULT_TOPIC);

        h.compressor.after_turn(id);
        h.idle().await;
        assert_eq!(h.store.get(id).unwrap().topic, "Second Try");
    }
}
