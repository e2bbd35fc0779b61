use recall_core::errors::GatewayError;
use recall_core::ids::{SequenceId, SessionId};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("message {sequence_id} not found in {session_id}")]
    MessageNotFound {
        session_id: SessionId,
        sequence_id: SequenceId,
    },

    #[error("index {index} out of range for {len} messages")]
    InvalidIndex { index: usize, len: usize },

    #[error("session history was discarded while work was in flight")]
    HistoryDiscarded,

    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u32),

    #[error("persisted state error: {0}")]
    Persist(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
