//! Conversation data model.
//!
//! Messages and conversations are plain in-memory values. Identity and role
//! are fixed at construction; only the crate can change a message's content,
//! and only the controller does so, while a reply streams into it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::inference::types::Role;

// ─── Message ────────────────────────────────────────────────────────────────

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    role: Role,
    content: String,
    created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Empty assistant message a streamed reply is written into.
    pub fn placeholder() -> Self {
        Self::assistant(String::new())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn append(&mut self, fragment: &str) {
        self.content.push_str(fragment);
    }
}

// ─── Conversation ───────────────────────────────────────────────────────────

/// Ordered, append-only message history.
///
/// The one exception to append-only is [`Conversation::remove`], used to roll
/// back a placeholder whose stream failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    id: Uuid,
    messages: Vec<Message>,
    created_at: DateTime<Utc>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_user_message(&self) -> bool {
        self.messages.iter().any(|m| m.role() == Role::User)
    }

    /// Append a message, returning its id.
    pub fn push(&mut self, message: Message) -> Uuid {
        let id = message.id();
        self.messages.push(message);
        id
    }

    pub fn message(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id() == id)
    }

    pub(crate) fn message_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id() == id)
    }

    pub(crate) fn remove(&mut self, id: Uuid) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id() == id)?;
        Some(self.messages.remove(index))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
