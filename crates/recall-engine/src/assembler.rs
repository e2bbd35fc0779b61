//! Builds the exact message list sent to the backend for a turn.

use std::sync::Arc;

use recall_core::config::ModelConfig;
use recall_core::messages::ChatMessage;
use recall_core::session::Session;
use recall_core::template::{PlaceholderFiller, TemplateFiller, TemplateVars};
use recall_core::tokens::{HeuristicEstimator, TokenEstimator};
use recall_settings::EngineSettings;

use crate::prompts::{memory_message_text, DEFAULT_SYSTEM_TEMPLATE};

/// Output of [`ContextAssembler::assemble`].
#[derive(Clone, Debug, PartialEq)]
pub struct ContextWindow {
    /// Ordered request messages: prompt(s), memory, recent history.
    pub messages: Vec<ChatMessage>,
    /// Lowest message index eligible for the recent window.
    pub window_start: usize,
    pub memory_included: bool,
    pub recent_count: usize,
    pub recent_tokens: u32,
    /// The token budget stopped the walk before `window_start`.
    pub budget_exhausted: bool,
}

impl ContextWindow {
    /// The recent-history tail of [`ContextWindow::messages`].
    pub fn recent(&self) -> &[ChatMessage] {
        &self.messages[self.messages.len() - self.recent_count..]
    }
}

/// Long-term memory goes out only while it does not cover anything the
/// clear-context marker has cut off.
pub fn memory_included(session: &Session, config: &ModelConfig) -> bool {
    config.send_memory
        && !session.memory_summary.is_empty()
        && session.last_summarize_index <= session.clear_context_index
}

/// Lowest message index the recent window may reach.
pub fn window_start(session: &Session, config: &ModelConfig) -> usize {
    let total = session.messages.len();
    let short_term_start = total.saturating_sub(config.history_message_count);
    let memory_start = if memory_included(session, config) {
        session.last_summarize_index.min(short_term_start)
    } else {
        short_term_start
    };
    session.clear_context_index.max(memory_start)
}

pub struct ContextAssembler {
    estimator: Arc<dyn TokenEstimator>,
    filler: Arc<dyn TemplateFiller>,
    system_template: String,
    provider: String,
    knowledge_cutoff: String,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::from_settings(
            &EngineSettings::default(),
            Arc::new(HeuristicEstimator),
            Arc::new(PlaceholderFiller),
        )
    }
}

impl ContextAssembler {
    pub fn from_settings(
        settings: &EngineSettings,
        estimator: Arc<dyn TokenEstimator>,
        filler: Arc<dyn TemplateFiller>,
    ) -> Self {
        Self {
            estimator,
            filler,
            system_template: settings
                .system_template
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_TEMPLATE.to_string()),
            provider: settings.provider_name.clone(),
            knowledge_cutoff: settings.knowledge_cutoff.clone(),
        }
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn filler(&self) -> &dyn TemplateFiller {
        self.filler.as_ref()
    }

    /// Variables available to system and input templates. Time comes from
    /// the session so assembly stays deterministic.
    pub fn template_vars(&self, session: &Session, config: &ModelConfig) -> TemplateVars {
        TemplateVars::new()
            .with("provider", self.provider.as_str())
            .with("cutoff", self.knowledge_cutoff.as_str())
            .with("model", config.model.as_str())
            .with(
                "time",
                session.last_update.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            )
    }

    pub fn system_prompt(&self, session: &Session, config: &ModelConfig) -> ChatMessage {
        let vars = self.template_vars(session, config);
        ChatMessage::system(
            self.filler.fill(&self.system_template, &vars),
            session.last_update,
        )
    }

    pub fn assemble(&self, session: &Session, config: &ModelConfig) -> ContextWindow {
        let mut messages = Vec::new();

        if session.context_prompts.is_empty() {
            messages.push(self.system_prompt(session, config));
        }

        let memory_included = memory_included(session, config);
        if memory_included {
            messages.push(ChatMessage::system(
                memory_message_text(&session.memory_summary),
                session.last_update,
            ));
        }

        messages.extend(session.context_prompts.iter().cloned());

        let window_start = window_start(session, config);
        let budget = config.token_budget();
        let mut recent = Vec::new();
        let mut recent_tokens = 0u32;
        let mut budget_exhausted = false;

        let eligible = session.messages.get(window_start..).unwrap_or_default();
        for message in eligible.iter().rev().filter(|m| !m.is_error) {
            let cost = self.estimator.estimate(&message.content);
            let next = recent_tokens.saturating_add(cost);
            if budget == 0 || next > budget {
                budget_exhausted = true;
                break;
            }
            recent_tokens = next;
            recent.push(message.clone());
        }
        recent.reverse();

        let recent_count = recent.len();
        messages.extend(recent);

        ContextWindow {
            messages,
            window_start,
            memory_included,
            recent_count,
            recent_tokens,
            budget_exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use recall_core::ids::SessionId;
    use recall_core::messages::Role;

    fn config(history: usize, max_tokens: i64, send_memory: bool) -> ModelConfig {
        ModelConfig {
            history_message_count: history,
            max_tokens,
            send_memory,
            ..Default::default()
        }
    }

    fn session_with_pairs(pairs: usize) -> Session {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let mut s = Session::new(SessionId::new(1), ModelConfig::default(), now);
        for i in 0..pairs {
            let _ = s.push_message(Role::User, format!("question {i}"), now);
            let _ = s.push_message(Role::Assistant, format!("answer {i}"), now);
        }
        s
    }

    fn contents(window: &ContextWindow) -> Vec<&str> {
        window.recent().iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn empty_session_gets_only_system_prompt() {
        let s = session_with_pairs(0);
        let window = ContextAssembler::default().assemble(&s, &config(10, 4000, true));
        assert_eq!(window.messages.len(), 1);
        assert_eq!(window.messages[0].role, Role::System);
        assert!(window.messages[0].content.contains("gpt-4o-mini"));
        assert!(window.messages[0].content.contains("2024-03-01 09:30:00 UTC"));
        assert_eq!(window.recent_count, 0);
    }

    #[test]
    fn history_count_limits_window_without_memory() {
        let s = session_with_pairs(5);
        let window = ContextAssembler::default().assemble(&s, &config(4, 4000, false));
        assert_eq!(window.messages.len(), 5);
        assert_eq!(window.window_start, 6);
        assert_eq!(
            contents(&window),
            vec!["question 3", "answer 3", "question 4", "answer 4"]
        );
    }

    #[test]
    fn memory_message_follows_system_prompt() {
        let mut s = session_with_pairs(5);
        s.memory_summary = "we talked about numbers".into();
        let window = ContextAssembler::default().assemble(&s, &config(4, 4000, true));

        assert!(window.memory_included);
        assert_eq!(window.messages[0].role, Role::System);
        assert_eq!(
            window.messages[1].content,
            "This is a summary of the chat history as a recap: we talked about numbers"
        );
        // Nothing summarized yet: the window reaches back to the first message.
        assert_eq!(window.window_start, 0);
        assert_eq!(window.recent_count, 10);
    }

    #[test]
    fn summarized_prefix_leaves_short_term_window() {
        let mut s = session_with_pairs(5);
        s.memory_summary = "recap".into();
        s.last_summarize_index = 6;
        s.clear_context_index = 6;
        let window = ContextAssembler::default().assemble(&s, &config(4, 4000, true));
        assert!(window.memory_included);
        assert_eq!(window.messages.len(), 6);
        assert_eq!(contents(&window)[0], "question 3");
    }

    #[test]
    fn memory_withheld_when_it_covers_cleared_history() {
        let mut s = session_with_pairs(5);
        s.memory_summary = "recap".into();
        s.last_summarize_index = 8;
        s.clear_context_index = 2;
        let window = ContextAssembler::default().assemble(&s, &config(4, 4000, true));
        assert!(!window.memory_included);
        assert!(window.messages.iter().all(|m| !m.content.contains("recap")));
    }

    #[test]
    fn context_prompts_replace_system_prompt() {
        let mut s = session_with_pairs(1);
        s.context_prompts = vec![ChatMessage::system("You are a pirate.", s.last_update)];
        s.memory_summary = "recap".into();
        let window = ContextAssembler::default().assemble(&s, &config(4, 4000, true));
        assert_eq!(window.messages[0].content, memory_message_text("recap"));
        assert_eq!(window.messages[1].content, "You are a pirate.");
        assert_eq!(window.recent_count, 2);
    }

    #[test]
    fn clear_context_marker_is_lower_bound() {
        let mut s = session_with_pairs(5);
        s.clear_context_index = 9;
        let window = ContextAssembler::default().assemble(&s, &config(10, 4000, false));
        assert_eq!(contents(&window), vec!["answer 4"]);
    }

    #[test]
    fn crossing_message_is_excluded_not_truncated() {
        let mut s = session_with_pairs(0);
        let now = s.last_update;
        let _ = s.push_message(Role::User, "a".repeat(40), now); // 10 tokens
        let _ = s.push_message(Role::Assistant, "b".repeat(20), now); // 5 tokens
        let window = ContextAssembler::default().assemble(&s, &config(10, 12, false));
        assert!(window.budget_exhausted);
        assert_eq!(window.recent_count, 1);
        assert_eq!(window.recent_tokens, 5);
        assert_eq!(window.recent()[0].content, "b".repeat(20));
    }

    #[test]
    fn non_positive_budget_sends_no_history() {
        let s = session_with_pairs(3);
        for max_tokens in [0, -10] {
            let window = ContextAssembler::default().assemble(&s, &config(10, max_tokens, false));
            assert_eq!(window.recent_count, 0);
            assert_eq!(window.messages.len(), 1);
        }
    }

    #[test]
    fn error_messages_never_sent() {
        let mut s = session_with_pairs(3);
        s.messages[4].mark_error();
        s.messages[5].mark_error();
        let window = ContextAssembler::default().assemble(&s, &config(10, 4000, false));
        assert_eq!(window.recent_count, 4);
        assert!(window.recent().iter().all(|m| !m.is_error));
    }

    #[test]
    fn custom_system_template() {
        let settings = EngineSettings {
            system_template: Some("Model {{model}} via {{provider}}".into()),
            provider_name: "Local".into(),
            ..Default::default()
        };
        let assembler = ContextAssembler::from_settings(
            &settings,
            Arc::new(HeuristicEstimator),
            Arc::new(PlaceholderFiller),
        );
        let s = session_with_pairs(0);
        let window = assembler.assemble(&s, &config(4, 4000, true));
        assert_eq!(window.messages[0].content, "Model gpt-4o-mini via Local");
    }

    fn arb_session() -> impl Strategy<Value = Session> {
        (
            prop::collection::vec(("[a-z ]{0,40}", any::<bool>()), 0..24),
            0usize..30,
            0usize..30,
            prop::option::of("[a-z]{1,20}"),
        )
            .prop_map(|(msgs, lsi, cci, summary)| {
                let mut s = session_with_pairs(0);
                let now = s.last_update;
                for (i, (text, is_error)) in msgs.into_iter().enumerate() {
                    let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                    let seq = s.push_message(role, text, now);
                    if is_error {
                        if let Some(m) = s.message_mut(seq) {
                            m.mark_error();
                        }
                    }
                }
                s.last_summarize_index = lsi;
                s.clear_context_index = cci;
                s.memory_summary = summary.unwrap_or_default();
                s.clamp_indices();
                s
            })
    }

    fn arb_config() -> impl Strategy<Value = ModelConfig> {
        (0usize..12, -5i64..200, any::<bool>())
            .prop_map(|(history, max_tokens, send_memory)| config(history, max_tokens, send_memory))
    }

    proptest! {
        #[test]
        fn window_respects_invariants(session in arb_session(), config in arb_config()) {
            let assembler = ContextAssembler::default();
            let window = assembler.assemble(&session, &config);

            // Errors never appear.
            prop_assert!(window.recent().iter().all(|m| !m.is_error));

            // Every recent message sits at or above the lower bound, in order.
            let indices: Vec<usize> = window
                .recent()
                .iter()
                .map(|m| session.message_index(m.sequence_id).unwrap())
                .collect();
            prop_assert!(indices.iter().all(|&i| i >= window.window_start));
            prop_assert!(indices.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(window.window_start >= session.clear_context_index);

            // Budget bound.
            let cost: u32 = window
                .recent()
                .iter()
                .map(|m| HeuristicEstimator.estimate(&m.content))
                .sum();
            prop_assert_eq!(cost, window.recent_tokens);
            prop_assert!(cost <= config.token_budget());

            // Deterministic.
            prop_assert_eq!(assembler.assemble(&session, &config), window);
        }
    }
}
