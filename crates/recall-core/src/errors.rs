use std::time::Duration;

/// Failures reported by a chat transport.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    /// The request was deliberately aborted by the user.
    #[error("aborted")]
    Cancelled,
}

impl GatewayError {
    /// Cancellations end a turn without marking its messages as errors.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short classification string for logging and error blocks.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_cancelled_is_cancellation() {
        assert!(GatewayError::Cancelled.is_cancellation());
        assert!(!GatewayError::NetworkError("reset".into()).is_cancellation());
        assert!(!GatewayError::Timeout(Duration::from_secs(1)).is_cancellation());
    }

    #[test]
    fn cancelled_displays_aborted() {
        assert_eq!(GatewayError::Cancelled.to_string(), "aborted");
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(GatewayError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            GatewayError::ServerError { status: 502, body: "bad gateway".into() }.error_kind(),
            "server_error"
        );
        assert_eq!(
            GatewayError::RateLimited { retry_after: None }.error_kind(),
            "rate_limited"
        );
    }
}
