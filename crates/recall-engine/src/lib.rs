//! # recall-engine
//!
//! Chat sessions with a bounded context window and a rolling memory
//! summary.
//!
//! - [`ContextAssembler`] picks the messages resent on every turn.
//! - [`TurnController`] streams a reply into the session and owns
//!   cancellation.
//! - [`MemoryCompressor`] derives topics and folds old history into the
//!   summary after each finished turn.
//! - [`SessionStore`] is the single mutation entry point.
//!
//! [`ChatEngine`] wires them together. Logging goes through `tracing`;
//! hosts install a subscriber with `recall_telemetry::init_telemetry`.

#![deny(unsafe_code)]

pub mod assembler;
pub mod compressor;
pub mod controller;
pub mod engine;
pub mod error;
pub mod persist;
pub mod pool;
pub mod prompts;
pub mod store;

pub use assembler::{ContextAssembler, ContextWindow};
pub use compressor::{CompressionPolicy, MemoryCompressor, SummaryPlan};
pub use controller::{TurnController, TurnHandle, TurnState};
pub use engine::ChatEngine;
pub use error::{EngineError, Result};
pub use persist::{PersistedState, CURRENT_SCHEMA_VERSION};
pub use pool::ControllerPool;
pub use store::{SessionEvent, SessionEventKind, SessionStore};
