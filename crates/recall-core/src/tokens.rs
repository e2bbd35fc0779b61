use crate::messages::ChatMessage;

/// Approximate token cost of a piece of text. Must be pure and deterministic.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

/// Character-class heuristic: ASCII letters cost a quarter token, other
/// ASCII half a token, everything else (CJK, emoji, accents) a token and a
/// half. Rounded up per text.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> u32 {
        let quarters: u64 = text
            .chars()
            .map(|c| match c {
                c if c.is_ascii_alphabetic() => 1u64,
                c if c.is_ascii() => 2,
                _ => 6,
            })
            .sum();
        u32::try_from(quarters.div_ceil(4)).unwrap_or(u32::MAX)
    }
}

/// Total estimated cost of message contents.
pub fn estimate_messages<'a>(
    estimator: &dyn TokenEstimator,
    messages: impl IntoIterator<Item = &'a ChatMessage>,
) -> u32 {
    messages
        .into_iter()
        .map(|m| estimator.estimate(&m.content))
        .fold(0u32, u32::saturating_add)
}
