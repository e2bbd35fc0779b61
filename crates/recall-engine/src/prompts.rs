//! Fixed instruction texts sent alongside conversation history.

/// Default system prompt template. Variables: `provider`, `cutoff`,
/// `model`, `time`.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = include_str!("../prompts/system.txt");

/// Prefix of the system message carrying the rolling summary.
pub const MEMORY_PREFIX: &str = "This is a summary of the chat history as a recap: ";

/// Appended as a user message when asking for a topic label.
pub const TOPIC_INSTRUCTION: &str = "Please generate a four to five word title summarizing our \
conversation without any lead-in, punctuation, quotation marks, periods, symbols, bold text, \
or additional text. Remove enclosing quotation marks.";

/// Appended as a system message when asking for a summary.
pub const SUMMARIZE_INSTRUCTION: &str = "Summarize the discussion briefly in 200 words or less \
to use as a prompt for future context.";

/// Wrap the rolling summary for inclusion in a request.
pub fn memory_message_text(summary: &str) -> String {
    format!("{MEMORY_PREFIX}{summary}")
}

/// Clean up a model-produced topic: strip wrapping quotes and emphasis,
/// trailing punctuation, and bound the length in characters.
pub fn trim_topic(raw: &str, max_chars: usize) -> String {
    const WRAPPERS: &[char] = &['"', '\'', '“', '”', '‘', '’', '*', '`', '#'];
    const TRAILING: &[char] = &[
        '.', ',', '!', '?', ';', ':', '，', '。', '！', '？', '、', '"', '“', '”', '*',
    ];

    let first_line = raw.trim().lines().next().unwrap_or_default();
    let unwrapped = first_line.trim_matches(|c: char| WRAPPERS.contains(&c) || c.is_whitespace());
    let cleaned = unwrapped.trim_end_matches(|c: char| TRAILING.contains(&c) || c.is_whitespace());

    let bounded: String = cleaned.chars().take(max_chars).collect();
    bounded.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_template_has_placeholders() {
        assert!(DEFAULT_SYSTEM_TEMPLATE.contains("{{model}}"));
        assert!(DEFAULT_SYSTEM_TEMPLATE.contains("{{time}}"));
    }

    #[test]
    fn memory_text_is_prefixed() {
        assert_eq!(
            memory_message_text("we discussed rust"),
            "This is a summary of the chat history as a recap: we discussed rust"
        );
    }

    #[test]
    fn trim_topic_strips_quotes_and_punctuation() {
        assert_eq!(trim_topic("\"Rust Borrow Checker Basics.\"", 50), "Rust Borrow Checker Basics");
        assert_eq!(trim_topic("**Async Streams**", 50), "Async Streams");
        assert_eq!(trim_topic("“旅行计划”。", 50), "旅行计划");
    }

    #[test]
    fn trim_topic_takes_first_line_and_bounds_length() {
        assert_eq!(trim_topic("Title here\nextra chatter", 50), "Title here");
        assert_eq!(trim_topic("abcdefghij", 4), "abcd");
    }

    #[test]
    fn trim_topic_of_blank_is_empty() {
        assert_eq!(trim_topic("  \"\"  ", 50), "");
    }
}
