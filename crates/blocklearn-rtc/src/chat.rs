//! Room chat with provisional local echo.
//!
//! A sent message is appended immediately as `Provisional` and carries a
//! fresh correlation id. The relay echoes room events back to the sender;
//! when that echo arrives the provisional record is marked `Confirmed`
//! instead of being appended a second time.

use blocklearn_shared::protocol::{ChatPayload, MessageType};
use blocklearn_shared::{Identity, SenderInfo};
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Provisional,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub correlation_id: String,
    pub sender_id: String,
    pub sender: SenderInfo,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub delivery: Delivery,
}

impl ChatMessage {
    fn from_payload(payload: ChatPayload, delivery: Delivery) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            correlation_id: payload.correlation_id,
            sender_id: payload.sender_id,
            sender: payload.sender,
            message: payload.text,
            created_at: payload.timestamp,
            message_type: payload.message_type,
            metadata: payload.metadata,
            delivery,
        }
    }

    pub fn to_payload(&self) -> ChatPayload {
        ChatPayload {
            correlation_id: self.correlation_id.clone(),
            sender_id: self.sender_id.clone(),
            sender: self.sender.clone(),
            text: self.message.clone(),
            timestamp: self.created_at,
            message_type: self.message_type,
            metadata: self.metadata.clone(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.message_type == MessageType::System
    }
}

/// What an incoming payload did to the log.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    Appended(ChatMessage),
    Confirmed { correlation_id: String },
    Duplicate,
}

/// A stored copy whose timestamp is this close to a local message with the
/// same sender and text is taken to be that message.
const SAME_MESSAGE_WINDOW_SECS: i64 = 5;

#[derive(Debug, Default, Clone)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
    /// Messages before this index were loaded; the rest arrived live.
    history_end: usize,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(messages: Vec<ChatMessage>) -> Self {
        Self {
            history_end: messages.len(),
            messages,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn find(&self, correlation_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.correlation_id == correlation_id)
    }

    /// Append a local message as provisional and return the payload to
    /// broadcast.
    pub fn compose(
        &mut self,
        author: &Identity,
        text: impl Into<String>,
        message_type: MessageType,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> ChatPayload {
        let payload = ChatPayload {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            sender_id: author.id.clone(),
            sender: author.sender_info(),
            text: text.into(),
            timestamp: now,
            message_type,
            metadata,
        };
        self.messages
            .push(ChatMessage::from_payload(payload.clone(), Delivery::Provisional));
        payload
    }

    /// Append a message that was never broadcast (system notices, proposals
    /// received from the other side).
    pub fn append_local(
        &mut self,
        sender_id: impl Into<String>,
        sender: SenderInfo,
        text: impl Into<String>,
        message_type: MessageType,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> ChatMessage {
        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            sender,
            message: text.into(),
            created_at: now,
            message_type,
            metadata,
            delivery: Delivery::Confirmed,
        };
        self.messages.push(message.clone());
        message
    }

    pub fn append_system(&mut self, text: impl Into<String>, now: DateTime<Utc>) -> ChatMessage {
        self.append_local(
            "system",
            SenderInfo::system(),
            text,
            MessageType::System,
            None,
            now,
        )
    }

    /// Reconcile a payload relayed by the server.
    pub fn receive(&mut self, payload: ChatPayload) -> ChatUpdate {
        if let Some(index) = self.find(&payload.correlation_id) {
            let existing = &mut self.messages[index];
            if existing.delivery == Delivery::Provisional {
                existing.delivery = Delivery::Confirmed;
                debug!(correlation = %payload.correlation_id, "chat message confirmed");
                return ChatUpdate::Confirmed {
                    correlation_id: payload.correlation_id,
                };
            }
            return ChatUpdate::Duplicate;
        }

        let message = ChatMessage::from_payload(payload, Delivery::Confirmed);
        self.messages.push(message.clone());
        ChatUpdate::Appended(message)
    }

    /// Merge messages fetched from durable storage and return the ones that
    /// were new. Known messages match by id or correlation id, or failing
    /// that by sender, text and a close timestamp. New ones go in ahead of
    /// the live tail; messages already shown keep their order.
    pub fn merge_history(&mut self, history: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let mut claimed = HashSet::new();
        let mut added = Vec::new();

        for message in history {
            let by_key = self
                .messages
                .iter()
                .position(|m| m.id == message.id || m.correlation_id == message.correlation_id);
            let found = by_key.or_else(|| {
                self.messages.iter().enumerate().position(|(i, m)| {
                    i >= self.history_end
                        && !claimed.contains(&i)
                        && m.sender_id == message.sender_id
                        && m.message == message.message
                        && (m.created_at - message.created_at).num_seconds().abs()
                            <= SAME_MESSAGE_WINDOW_SECS
                })
            });

            match found {
                Some(index) => {
                    claimed.insert(index);
                    let existing = &mut self.messages[index];
                    existing.id = message.id;
                    existing.delivery = Delivery::Confirmed;
                }
                None => added.push(message),
            }
        }

        added.sort_by_key(|m| m.created_at);
        let at = self.history_end;
        self.messages.splice(at..at, added.iter().cloned());
        self.history_end += added.len();
        if !added.is_empty() {
            debug!(added = added.len(), total = self.messages.len(), "merged chat history");
        }
        added
    }
}
