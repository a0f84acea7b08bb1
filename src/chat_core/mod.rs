//! Chat core: conversation state for Remy.
//!
//! Submodules:
//! - `types`: Message and Conversation data model
//! - `controller`: Turn controller (send, stream, roll back, retry)
//! - `errors`: Chat-level error types

pub mod controller;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use controller::{ChatController, ChatSnapshot, TurnEvent, TurnOutcome};
pub use errors::ChatError;
pub use types::{Conversation, Message, Role};
