//! Wire types for the Messages API.
//!
//! Request types are serialized straight into the POST body; the event types
//! mirror the JSON carried on each `data: ` line of the response stream.

use serde::{Deserialize, Serialize};

// ─── Request Types ───────────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single `{role, content}` pair in the request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: String,
}

/// Request body for `POST /v1/messages`.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub stream: bool,
    pub messages: Vec<ApiMessage>,
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// Event `type` tag that marks the end of the assistant message.
pub const MESSAGE_STOP: &str = "message_stop";

/// Event `type` tag the server uses to report a failure inside the stream.
pub const ERROR_EVENT: &str = "error";

/// One decoded SSE payload.
///
/// Only `type` is required. Everything else the server sends (`index`,
/// `message`, `usage`, ...) is ignored, so new event shapes decode cleanly and
/// simply carry no text.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub delta: Option<EventDelta>,
    /// Present on `error` events: `{"type": "overloaded_error", "message": ...}`.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// The nested `delta` object of a stream event.
#[derive(Debug, Clone, Deserialize)]
pub struct EventDelta {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl StreamEvent {
    /// Text carried by this event, if any.
    pub fn text(&self) -> Option<&str> {
        self.delta.as_ref().and_then(|d| d.text.as_deref())
    }

    /// Whether this event ends the message.
    pub fn is_terminal(&self) -> bool {
        self.kind == MESSAGE_STOP
    }

    /// Whether the server reported an error inside the stream.
    pub fn is_error(&self) -> bool {
        self.kind == ERROR_EVENT
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
