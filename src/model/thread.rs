//! Conversation threads and unresolved-parent tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;

/// The aggregate grouping of one conversation.
///
/// `participants` only grows, `has_attachments` never reverts to `false`,
/// and `first_message_at <= last_message_at` holds after every
/// [`Thread::absorb`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub mailbox_id: String,
    /// Normalized subject used for the fallback match.
    pub subject: String,
    pub participants: Vec<String>,
    pub message_count: u32,
    /// Internal ID of the newest message.
    pub last_message_id: String,
    pub first_message_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub has_attachments: bool,
    pub is_done: bool,
    pub is_viewed: bool,
}

impl Thread {
    /// Start a new thread from its first message.
    pub fn seed(message: &Message, normalized_subject: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mailbox_id: message.mailbox_id.clone(),
            subject: normalized_subject.to_string(),
            participants: message.participants(),
            message_count: 1,
            last_message_id: message.id.clone(),
            first_message_at: message.date,
            last_message_at: message.date,
            has_attachments: message.has_attachment,
            is_done: false,
            is_viewed: false,
        }
    }

    /// Fold one more message into the aggregate.
    ///
    /// Bounds only widen, the participant set is a union, and the
    /// attachment flag is sticky, so the result does not depend on the
    /// order in which concurrent writers apply their messages.
    pub fn absorb(&mut self, message: &Message) {
        if message.date < self.first_message_at {
            self.first_message_at = message.date;
        }
        if message.date >= self.last_message_at {
            self.last_message_at = message.date;
            self.last_message_id = message.id.clone();
        }
        for addr in message.participants() {
            if !self.participants.contains(&addr) {
                self.participants.push(addr);
            }
        }
        self.has_attachments |= message.has_attachment;
        self.message_count += 1;
    }

    /// Number of addresses shared with `addresses`.
    pub fn overlap(&self, addresses: &[String]) -> usize {
        addresses
            .iter()
            .filter(|a| self.participants.contains(a))
            .count()
    }
}

/// Partial update for a thread: only `Some`, non-empty fields overwrite.
#[derive(Debug, Clone, Default)]
pub struct ThreadUpdate {
    pub subject: Option<String>,
    pub participants: Option<Vec<String>>,
    pub message_count: Option<u32>,
    pub last_message_id: Option<String>,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub has_attachments: Option<bool>,
    pub is_done: Option<bool>,
    pub is_viewed: Option<bool>,
}

impl ThreadUpdate {
    /// Update carrying every aggregate field of `thread`.
    pub fn aggregate_of(thread: &Thread) -> Self {
        Self {
            subject: None,
            participants: Some(thread.participants.clone()),
            message_count: Some(thread.message_count),
            last_message_id: Some(thread.last_message_id.clone()),
            first_message_at: Some(thread.first_message_at),
            last_message_at: Some(thread.last_message_at),
            has_attachments: Some(thread.has_attachments),
            is_done: None,
            is_viewed: None,
        }
    }

    /// Apply onto `thread` with partial-field semantics.
    pub fn apply_to(&self, thread: &mut Thread) {
        if let Some(subject) = self.subject.as_ref().filter(|s| !s.is_empty()) {
            thread.subject = subject.clone();
        }
        if let Some(participants) = self.participants.as_ref().filter(|p| !p.is_empty()) {
            thread.participants = participants.clone();
        }
        if let Some(count) = self.message_count.filter(|c| *c > 0) {
            thread.message_count = count;
        }
        if let Some(last) = self.last_message_id.as_ref().filter(|s| !s.is_empty()) {
            thread.last_message_id = last.clone();
        }
        if let Some(at) = self.first_message_at {
            thread.first_message_at = at;
        }
        if let Some(at) = self.last_message_at {
            thread.last_message_at = at;
        }
        if let Some(flag) = self.has_attachments {
            thread.has_attachments = flag;
        }
        if let Some(flag) = self.is_done {
            thread.is_done = flag;
        }
        if let Some(flag) = self.is_viewed {
            thread.is_viewed = flag;
        }
    }
}

/// A parent message ID named by a child but not yet stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanEmail {
    /// The referenced, not-yet-seen ancestor.
    pub message_id: String,
    /// `message_id` of the child that named it.
    pub referenced_by: String,
    /// Thread the child was placed into.
    pub thread_id: String,
    pub mailbox_id: String,
}
