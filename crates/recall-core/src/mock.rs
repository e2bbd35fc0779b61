use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::errors::GatewayError;
use crate::stream::{ChatStream, StreamEvent};
use crate::transport::{ChatRequest, ChatTransport};

/// Pre-programmed responses for deterministic testing without a backend.
pub enum MockResponse {
    /// Yield a sequence of events.
    Stream(Vec<StreamEvent>),
    /// Yield the events, then stay open until the request is cancelled.
    Hang(Vec<StreamEvent>),
    /// Reject the request outright.
    Error(GatewayError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Wait until the gate is opened, then resolve the inner response.
    Gated(Arc<Notify>, Box<MockResponse>),
}

impl MockResponse {
    /// A text reply split into the given deltas.
    pub fn deltas(parts: &[&str]) -> Self {
        let mut events = vec![StreamEvent::Start];
        events.extend(parts.iter().map(|p| StreamEvent::TextDelta {
            delta: (*p).to_string(),
        }));
        events.push(StreamEvent::Done {
            text: String::new(),
        });
        Self::Stream(events)
    }

    pub fn text(text: &str) -> Self {
        Self::deltas(&[text])
    }

    /// Stream the deltas, then fail with `error`.
    pub fn fail_after(parts: &[&str], error: GatewayError) -> Self {
        let mut events: Vec<StreamEvent> = parts
            .iter()
            .map(|p| StreamEvent::TextDelta {
                delta: (*p).to_string(),
            })
            .collect();
        events.push(StreamEvent::Error { error });
        Self::Stream(events)
    }

    /// Stream the deltas, then wait for cancellation.
    pub fn hang_after(parts: &[&str]) -> Self {
        Self::Hang(
            parts
                .iter()
                .map(|p| StreamEvent::TextDelta {
                    delta: (*p).to_string(),
                })
                .collect(),
        )
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    pub fn gated(gate: Arc<Notify>, inner: MockResponse) -> Self {
        Self::Gated(gate, Box::new(inner))
    }
}

/// Transport that answers requests with queued responses in order and
/// records every request it receives.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockTransport {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, GatewayError> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len()
        };
        let response = self.responses.lock().pop_front().ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "MockTransport: no response configured for call {call}"
            ))
        })?;
        resolve_response(response, cancel).await
    }
}

/// Resolve a response, unrolling delays and gates iteratively.
async fn resolve_response(
    response: MockResponse,
    cancel: CancellationToken,
) -> Result<ChatStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Hang(events) => {
                let aborted = stream::once(async move {
                    cancel.cancelled().await;
                    StreamEvent::Error {
                        error: GatewayError::Cancelled,
                    }
                });
                return Ok(Box::pin(stream::iter(events).chain(aborted)));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
            MockResponse::Gated(gate, inner) => {
                gate.notified().await;
                current = *inner;
            }
        }
    }
}
