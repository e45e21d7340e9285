use std::collections::HashMap;

use shared::domain::ChatId;
use shared::protocol::{ChatMessage, ConversationHistory, ConversationSummary, MessageEvent};

/// Stable identity under which deliveries from the two channels are
/// reconciled. The backend issues no message ids, so the identity is composed
/// from sender and creation instant at millisecond resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MessageKey {
    sender: String,
    timestamp_ms: i64,
}

impl MessageKey {
    fn of(message: &ChatMessage) -> Self {
        Self {
            sender: message.sender.clone(),
            timestamp_ms: message.sent_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Folded into a conversation the user is not viewing; unread grew.
    Counted,
    /// Appended to the open conversation's sequence; unread untouched.
    AppendedToOpen,
    /// Same identity as the latest reflected message; nothing changed.
    Duplicate,
    /// Own-send fan-out echo on the open conversation; the local append at
    /// send time already covered it.
    OwnEcho,
}

/// Authoritative in-memory view of every conversation the session knows
/// about. All mutation goes through here; the service holds the single lock.
pub struct InboxReconciler {
    session_user: String,
    entries: HashMap<ChatId, ConversationSummary>,
    order: Vec<ChatId>,
    open_chat: Option<ChatId>,
    open_messages: Vec<ChatMessage>,
}

impl InboxReconciler {
    pub fn new(session_user: impl Into<String>) -> Self {
        Self {
            session_user: session_user.into(),
            entries: HashMap::new(),
            order: Vec::new(),
            open_chat: None,
            open_messages: Vec::new(),
        }
    }

    /// Fold in a freshly fetched summary list. The REST inbox is the source
    /// of truth, so the fetched set replaces the known one; only the open
    /// conversation's unread count is clamped back to zero, since it resets
    /// the instant the user opens it and stays there while they look at it.
    pub fn refresh(&mut self, entries: Vec<ConversationSummary>) {
        self.entries.clear();
        self.order.clear();
        for mut entry in entries {
            if self.open_chat == Some(entry.chat_id) {
                entry.unread_count = 0;
            }
            self.order.push(entry.chat_id);
            self.entries.insert(entry.chat_id, entry);
        }
    }

    /// Seed the open conversation from persisted history. Live events only
    /// augment this sequence afterwards.
    pub fn open(&mut self, history: &ConversationHistory) {
        self.open_chat = Some(history.chat_id);
        self.open_messages = history.messages.clone();
        match self.entries.get_mut(&history.chat_id) {
            Some(entry) => {
                entry.owner = Some(history.owner.clone());
                if let Some(last) = history.messages.last() {
                    entry.last_message = Some(last.clone());
                }
            }
            None => {
                self.entries.insert(
                    history.chat_id,
                    ConversationSummary {
                        chat_id: history.chat_id,
                        property_id: history.property_id,
                        owner: Some(history.owner.clone()),
                        last_message: history.messages.last().cloned(),
                        unread_count: 0,
                    },
                );
            }
        }
        self.touch(history.chat_id);
    }

    pub fn close_open(&mut self) {
        self.open_chat = None;
        self.open_messages.clear();
    }

    /// Unread resets to exactly zero, whatever it was.
    pub fn mark_opened(&mut self, chat_id: ChatId) {
        if let Some(entry) = self.entries.get_mut(&chat_id) {
            entry.unread_count = 0;
        }
    }

    /// Merge one incoming message event from either channel. Idempotent on
    /// the message identity: an event matching the latest reflected message
    /// for its conversation is a no-op, so double delivery across the two
    /// channels cannot double-count.
    pub fn apply_event(&mut self, event: MessageEvent) -> MergeOutcome {
        let chat_id = event.chat_id;
        let key = MessageKey::of(&event.message);
        if let Some(entry) = self.entries.get(&chat_id) {
            if entry.last_message.as_ref().map(MessageKey::of) == Some(key) {
                return MergeOutcome::Duplicate;
            }
        }

        let open_here = self.open_chat == Some(chat_id);
        if open_here && event.message.sender == self.session_user {
            return MergeOutcome::OwnEcho;
        }

        let outcome = match self.entries.get_mut(&chat_id) {
            Some(entry) => {
                entry.last_message = Some(event.message.clone());
                if open_here {
                    self.open_messages.push(event.message);
                    MergeOutcome::AppendedToOpen
                } else {
                    entry.unread_count += 1;
                    MergeOutcome::Counted
                }
            }
            None => {
                self.entries.insert(
                    chat_id,
                    ConversationSummary {
                        chat_id,
                        property_id: event.property_id,
                        owner: None,
                        last_message: Some(event.message.clone()),
                        unread_count: if open_here { 0 } else { 1 },
                    },
                );
                if open_here {
                    self.open_messages.push(event.message);
                    MergeOutcome::AppendedToOpen
                } else {
                    MergeOutcome::Counted
                }
            }
        };
        self.touch(chat_id);
        outcome
    }

    /// Append the locally authored message at send time; the summary follows
    /// so the inbox preview shows the user's own last word.
    pub fn append_local_echo(&mut self, message: ChatMessage) {
        let Some(chat_id) = self.open_chat else {
            return;
        };
        if let Some(entry) = self.entries.get_mut(&chat_id) {
            entry.last_message = Some(message.clone());
        }
        self.open_messages.push(message);
        self.touch(chat_id);
    }

    /// Flip the open sequence to read after a successful mark-read call.
    /// false→true only; messages never become unread again.
    pub fn mark_open_read(&mut self, chat_id: ChatId) {
        if self.open_chat != Some(chat_id) {
            return;
        }
        for message in &mut self.open_messages {
            message.read = true;
        }
    }

    pub fn open_chat(&self) -> Option<ChatId> {
        self.open_chat
    }

    pub fn open_messages(&self) -> &[ChatMessage] {
        &self.open_messages
    }

    /// Summaries in recency order, most recently active first.
    pub fn snapshot(&self) -> Vec<ConversationSummary> {
        self.order
            .iter()
            .filter_map(|chat_id| self.entries.get(chat_id))
            .cloned()
            .collect()
    }

    pub fn unread_total(&self) -> u32 {
        self.entries.values().map(|entry| entry.unread_count).sum()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.open_chat = None;
        self.open_messages.clear();
    }

    fn touch(&mut self, chat_id: ChatId) {
        self.order.retain(|id| *id != chat_id);
        self.order.insert(0, chat_id);
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
