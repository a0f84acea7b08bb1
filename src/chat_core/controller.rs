//! ChatController: drives one conversation turn at a time.
//!
//! Responsibilities:
//! - Append the user message and an empty assistant placeholder
//! - Stream reply fragments into the placeholder in arrival order
//! - Roll the placeholder back and record the error when the stream fails
//! - Replay the receive half of a turn on retry
//! - Expose state snapshots and turn events to whatever renders them
//!
//! All conversation state lives behind one mutex. Every mutation is a single
//! short critical section and the lock is never held across an `.await`, so a
//! renderer can take a snapshot at any time and always sees whole fragments.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::inference::client::{CompletionClient, CompletionSource};
use crate::inference::errors::InferenceError;

use super::errors::ChatError;
use super::types::{Conversation, Message};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Buffered turn events per subscriber before slow ones start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error recorded when a turn future is dropped before the reply settles.
const ABANDONED_TURN_ERROR: &str = "the reply was interrupted before it finished";

// ─── Public Types ───────────────────────────────────────────────────────────

/// Notification sent to subscribers as a turn progresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// A placeholder was appended and a request is on its way.
    Started { message_id: Uuid },
    /// A non-empty fragment was appended to the placeholder.
    Delta { message_id: Uuid, text: String },
    /// The reply finished; the placeholder holds the full text.
    Completed { message_id: Uuid },
    /// The turn failed and its placeholder was removed.
    Failed { error: String },
    /// The conversation was discarded.
    Reset,
}

/// How a `send_turn` / `retry_last_turn` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Nothing happened: empty input, no user message, or a turn in flight.
    Skipped,
    Completed { message_id: Uuid },
    RolledBack { error: String },
}

/// Point-in-time copy of everything a renderer needs.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSnapshot {
    pub conversation: Conversation,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

// ─── ChatController ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ChatState {
    conversation: Conversation,
    is_loading: bool,
    last_error: Option<String>,
}

/// Owner of the active conversation and the turn-in-flight state.
///
/// Share it behind an `Arc` when the turn runs on a different task from the
/// renderer.
pub struct ChatController<C = CompletionClient> {
    client: C,
    state: Mutex<ChatState>,
    events: broadcast::Sender<TurnEvent>,
}

/// A turn whose placeholder has been appended but whose stream has not run.
struct PendingTurn {
    placeholder_id: Uuid,
    history: Vec<Message>,
}

impl<C: CompletionSource> ChatController<C> {
    pub fn new(client: C) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            state: Mutex::new(ChatState::default()),
            events,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    // ─── Observation ────────────────────────────────────────────────────

    /// Receive turn events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let state = self.lock();
        ChatSnapshot {
            conversation: state.conversation.clone(),
            is_loading: state.is_loading,
            last_error: state.last_error.clone(),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().conversation.messages().to_vec()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().is_loading
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    // ─── Turn verbs ─────────────────────────────────────────────────────

    /// Send a new user message and stream the reply.
    ///
    /// Skipped when the trimmed text is empty or a turn is already in flight.
    pub async fn send_turn(&self, raw_user_text: &str) -> TurnOutcome {
        let text = raw_user_text.trim();

        let turn = {
            let mut state = self.lock();
            if text.is_empty() {
                tracing::debug!("ignoring empty user input");
                return TurnOutcome::Skipped;
            }
            if state.is_loading {
                tracing::debug!("turn already in flight, ignoring send");
                return TurnOutcome::Skipped;
            }
            state.conversation.push(Message::user(text));
            self.begin_turn(&mut state)
        };

        self.drive_turn(turn).await
    }

    /// Request a fresh reply for the conversation as it stands.
    ///
    /// Skipped when there is no user message yet or a turn is in flight.
    pub async fn retry_last_turn(&self) -> TurnOutcome {
        let turn = {
            let mut state = self.lock();
            if state.is_loading || !state.conversation.has_user_message() {
                tracing::debug!(in_flight = state.is_loading, "nothing to retry, ignoring");
                return TurnOutcome::Skipped;
            }
            self.begin_turn(&mut state)
        };

        self.drive_turn(turn).await
    }

    // ─── Housekeeping ───────────────────────────────────────────────────

    pub fn clear_error(&self) {
        self.lock().last_error = None;
    }

    /// Discard the conversation and error state.
    ///
    /// Rejected while a turn is in flight.
    pub fn reset_conversation(&self) -> Result<(), ChatError> {
        {
            let mut state = self.lock();
            if state.is_loading {
                return Err(ChatError::TurnInFlight);
            }
            state.conversation = Conversation::new();
            state.last_error = None;
            tracing::info!(conversation_id = %state.conversation.id(), "conversation reset");
        }
        let _ = self.events.send(TurnEvent::Reset);
        Ok(())
    }

    // ─── Turn internals ─────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the turn in flight and append the placeholder. The history
    /// handed back excludes the placeholder.
    fn begin_turn(&self, state: &mut ChatState) -> PendingTurn {
        state.last_error = None;
        state.is_loading = true;

        let history = state.conversation.messages().to_vec();
        let placeholder_id = state.conversation.push(Message::placeholder());

        tracing::info!(
            conversation_id = %state.conversation.id(),
            history_len = history.len(),
            "turn started"
        );
        let _ = self.events.send(TurnEvent::Started {
            message_id: placeholder_id,
        });

        PendingTurn {
            placeholder_id,
            history,
        }
    }

    async fn drive_turn(&self, turn: PendingTurn) -> TurnOutcome {
        let mut guard = TurnGuard {
            controller: self,
            placeholder_id: turn.placeholder_id,
            armed: true,
        };

        let result = self.stream_into(turn.placeholder_id, turn.history).await;
        guard.armed = false;

        match result {
            Ok(()) => self.complete_turn(turn.placeholder_id),
            Err(e) => self.roll_back(turn.placeholder_id, e.to_string()),
        }
    }

    async fn stream_into(
        &self,
        placeholder_id: Uuid,
        history: Vec<Message>,
    ) -> Result<(), InferenceError> {
        let mut fragments = self.client.stream_reply(history).await?;

        while let Some(fragment) = fragments.next().await {
            self.append_fragment(placeholder_id, &fragment?);
        }
        Ok(())
    }

    fn append_fragment(&self, placeholder_id: Uuid, fragment: &str) {
        if fragment.is_empty() {
            return;
        }

        {
            let mut state = self.lock();
            match state.conversation.message_mut(placeholder_id) {
                Some(message) => message.append(fragment),
                None => {
                    tracing::warn!(%placeholder_id, "placeholder missing, dropping fragment");
                    return;
                }
            }
        }

        let _ = self.events.send(TurnEvent::Delta {
            message_id: placeholder_id,
            text: fragment.to_string(),
        });
    }

    fn complete_turn(&self, placeholder_id: Uuid) -> TurnOutcome {
        {
            let mut state = self.lock();
            state.is_loading = false;
            let reply_len = state
                .conversation
                .message(placeholder_id)
                .map(|m| m.content().len())
                .unwrap_or(0);
            tracing::info!(reply_len, "turn completed");
        }

        let _ = self.events.send(TurnEvent::Completed {
            message_id: placeholder_id,
        });
        TurnOutcome::Completed {
            message_id: placeholder_id,
        }
    }

    fn roll_back(&self, placeholder_id: Uuid, error: String) -> TurnOutcome {
        {
            let mut state = self.lock();
            state.conversation.remove(placeholder_id);
            state.last_error = Some(error.clone());
            state.is_loading = false;
        }

        tracing::warn!(error = %error, "turn failed, placeholder rolled back");
        let _ = self.events.send(TurnEvent::Failed {
            error: error.clone(),
        });
        TurnOutcome::RolledBack { error }
    }
}

/// Rolls the placeholder back if a turn future is dropped mid-stream, so an
/// abandoned turn never leaves the controller stuck in flight.
struct TurnGuard<'a, C: CompletionSource> {
    controller: &'a ChatController<C>,
    placeholder_id: Uuid,
    armed: bool,
}

impl<C: CompletionSource> Drop for TurnGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.controller
                .roll_back(self.placeholder_id, ABANDONED_TURN_ERROR.to_string());
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
