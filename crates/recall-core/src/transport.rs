use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::GatewayError;
use crate::messages::ChatMessage;
use crate::stream::ChatStream;

/// One request to the language-model backend.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    /// Whether the caller wants incremental deltas. Non-streaming requests
    /// may still be answered with a single `Done`.
    pub stream: bool,
}

/// Backend the core talks to. Implementations own the wire protocol,
/// timeouts and retries.
///
/// Contract: the returned stream ends with exactly one terminal event, and
/// once `cancel` fires the transport stops and reports
/// [`GatewayError::Cancelled`].
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, GatewayError>;
}
