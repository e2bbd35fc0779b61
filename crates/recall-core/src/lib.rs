//! # recall-core
//!
//! Data model and collaborator interfaces for chat sessions with rolling
//! memory: messages, sessions, model configuration, the transport contract,
//! token estimation and template filling.

pub mod config;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod session;
pub mod stream;
pub mod template;
pub mod tokens;
pub mod transport;

pub mod mock;

pub use config::ModelConfig;
pub use errors::GatewayError;
pub use ids::{SequenceId, SessionId, TurnKey};
pub use messages::{ChatMessage, Role};
pub use session::{Session, SessionStat, DEFAULT_TOPIC};
pub use stream::{ChatStream, StreamEvent};
pub use transport::{ChatRequest, ChatTransport};
