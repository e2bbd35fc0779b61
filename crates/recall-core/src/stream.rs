use std::pin::Pin;

use futures::{Stream, StreamExt};

use crate::errors::GatewayError;

/// Events emitted by a transport while answering one request.
///
/// Ordering contract: `Start? → TextDelta* → (Done | Error)`. Exactly one
/// terminal event closes the stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    TextDelta { delta: String },
    /// Final text. An empty string means "keep what was streamed".
    Done { text: String },
    Error { error: GatewayError },
}

pub type ChatStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Accumulates deltas into the text-so-far.
#[derive(Debug, Default)]
pub struct TextAccumulator {
    text: String,
}

impl TextAccumulator {
    pub fn push(&mut self, delta: &str) -> &str {
        self.text.push_str(delta);
        &self.text
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Resolve the final text: a non-empty `Done` payload wins, otherwise
    /// whatever was accumulated.
    pub fn finish(self, done_text: String) -> String {
        if done_text.is_empty() {
            self.text
        } else {
            done_text
        }
    }
}

/// Drain a stream into its final text.
pub async fn collect_text(mut stream: ChatStream) -> Result<String, GatewayError> {
    let mut acc = TextAccumulator::default();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Start => {}
            StreamEvent::TextDelta { delta } => {
                acc.push(&delta);
            }
            StreamEvent::Done { text } => return Ok(acc.finish(text)),
            StreamEvent::Error { error } => return Err(error),
        }
    }
    Err(GatewayError::StreamInterrupted(
        "stream ended without a terminal event".into(),
    ))
}
