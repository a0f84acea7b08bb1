//! Inference client: streaming client for the Anthropic Messages API.
//!
//! This module handles all communication with the completion endpoint:
//! - Request construction and the single streaming POST
//! - SSE stream decoding into text deltas
//! - Client configuration loading from `remy.yaml`
//! - API credential suppliers
//!
//! It owns no conversation state. Each `send` is independent and the decoder
//! lives only as long as the stream it feeds.

pub mod client;
pub mod config;
pub mod errors;
pub mod secrets;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::{CompletionClient, CompletionSource};
pub use config::RemyConfig;
pub use errors::InferenceError;
pub use secrets::{EnvSecret, SecretSource, StaticSecret};
pub use streaming::{DecoderState, SseDecoder, TextStream};
