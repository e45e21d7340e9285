use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, PropertyId};

/// Sender recorded for frames that could not be parsed as structured data.
pub const UNKNOWN_SENDER: &str = "Unknown";

/// One entry in a conversation's append-only message sequence. Immutable
/// once appended, except for `read`, which only ever transitions false→true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl ChatMessage {
    /// A locally authored message, stamped at the moment of sending.
    pub fn outgoing(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            sent_at: Utc::now(),
            read: false,
        }
    }
}

/// Wire frame carried on the per-conversation channel. The conversation is
/// implied by the channel scope, so the frame carries no routing ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFrame {
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatFrame {
    pub fn encode(sender: &str, text: &str) -> serde_json::Result<String> {
        serde_json::to_string(&ChatFrame {
            sender: sender.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Decode an incoming frame. A frame that is not valid structured data is
    /// degraded to a best-effort message carrying the raw payload, never
    /// rejected.
    pub fn decode(raw: &str) -> ChatMessage {
        match serde_json::from_str::<ChatFrame>(raw) {
            Ok(frame) => ChatMessage {
                sender: frame.sender,
                text: frame.text,
                sent_at: frame.timestamp,
                read: false,
            },
            Err(_) => ChatMessage {
                sender: UNKNOWN_SENDER.to_string(),
                text: raw.to_string(),
                sent_at: Utc::now(),
                read: false,
            },
        }
    }
}

/// Wire frame on the session-wide notification channel. Unlike [`ChatFrame`]
/// it must carry routing ids, since the receiver has no channel scope to
/// infer the conversation from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyFrame {
    pub chat_id: ChatId,
    pub property_id: PropertyId,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl NotifyFrame {
    /// A malformed notification frame has no routable conversation, so there
    /// is nothing to degrade to; the caller logs and drops it.
    pub fn decode(raw: &str) -> Option<MessageEvent> {
        let frame = serde_json::from_str::<NotifyFrame>(raw).ok()?;
        Some(MessageEvent {
            chat_id: frame.chat_id,
            property_id: frame.property_id,
            message: ChatMessage {
                sender: frame.sender,
                text: frame.text,
                sent_at: frame.timestamp,
                read: false,
            },
        })
    }
}

/// The reconciler's single input type; both channels and the REST history
/// path produce these.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub chat_id: ChatId,
    pub property_id: PropertyId,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub chat_id: ChatId,
    pub property_id: PropertyId,
    /// Participant that owns the listed property. Unknown until the backend
    /// supplies it (a summary created from a live event has no owner yet).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<ChatMessage>,
    pub unread_count: u32,
}

/// Persisted history for one conversation, returned by the gateway's
/// idempotent get-or-create for a (user, property) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub chat_id: ChatId,
    pub property_id: PropertyId,
    pub owner: String,
    pub messages: Vec<ChatMessage>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
