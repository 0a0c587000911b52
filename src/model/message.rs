//! The canonical email record shared by the inbound and outbound paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Delivery lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Ingested from a mailbox.
    Received,
    /// Composed and waiting for the transport.
    Queued,
    /// Accepted by the transport.
    Sent,
    /// The last transport attempt failed.
    Failed,
}

/// Heuristic label assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Ok,
    Bounce,
    Autoresponder,
    Bulk,
    Internal,
    Sensitive,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Bounce => "bounce",
            Self::Autoresponder => "autoresponder",
            Self::Bulk => "bulk",
            Self::Internal => "internal",
            Self::Sensitive => "sensitive",
        }
    }

    /// Only `Ok` messages are attached to threads and fanned out.
    pub fn is_threadable(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A canonical email record.
///
/// `message_id` and `direction` are fixed once the record is persisted;
/// repositories only ever copy the status, timing and thread-linkage fields
/// on update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Internally generated identifier (UUID v4).
    pub id: String,
    pub mailbox_id: String,
    /// Folder the message was fetched from (empty for outbound).
    pub folder: String,
    /// Protocol `Message-ID` without angle brackets.
    pub message_id: String,
    pub thread_id: Option<String>,

    pub from_address: String,
    pub from_name: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,

    pub in_reply_to: Option<String>,
    pub references: Vec<String>,

    pub subject: String,
    pub clean_subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub has_attachment: bool,

    pub classification: Classification,
    pub classification_reason: String,

    pub direction: Direction,
    pub status: Status,
    pub status_detail: Option<String>,
    pub send_attempts: u32,
    /// Message timestamp (`Date:` header or envelope date).
    pub date: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Raw provenance, never consulted after the initial parse.
    pub raw_headers: serde_json::Value,
    pub raw_envelope: serde_json::Value,
    pub raw_body_structure: serde_json::Value,
}

impl Message {
    /// Empty record with a fresh internal ID.
    pub fn new(mailbox_id: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mailbox_id: mailbox_id.into(),
            folder: String::new(),
            message_id: String::new(),
            thread_id: None,
            from_address: String::new(),
            from_name: String::new(),
            to_addresses: Vec::new(),
            cc_addresses: Vec::new(),
            bcc_addresses: Vec::new(),
            in_reply_to: None,
            references: Vec::new(),
            subject: String::new(),
            clean_subject: String::new(),
            body_text: None,
            body_html: None,
            has_attachment: false,
            classification: Classification::Ok,
            classification_reason: String::new(),
            direction,
            status: match direction {
                Direction::Inbound => Status::Received,
                Direction::Outbound => Status::Queued,
            },
            status_detail: None,
            send_attempts: 0,
            date: Utc::now(),
            sent_at: None,
            last_attempt_at: None,
            raw_headers: serde_json::Value::Null,
            raw_envelope: serde_json::Value::Null,
            raw_body_structure: serde_json::Value::Null,
        }
    }

    /// All recipients (to, cc, bcc) in order, without duplicates.
    pub fn recipients(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for addr in self
            .to_addresses
            .iter()
            .chain(&self.cc_addresses)
            .chain(&self.bcc_addresses)
        {
            if !out.contains(addr) {
                out.push(addr.clone());
            }
        }
        out
    }

    /// Sender plus every recipient: the set a thread accumulates.
    pub fn participants(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.from_address.is_empty() {
            out.push(self.from_address.clone());
        }
        for addr in self.recipients() {
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
        out
    }

    /// `true` when either body representation has content.
    pub fn has_body(&self) -> bool {
        let non_empty = |b: &Option<String>| b.as_deref().is_some_and(|s| !s.trim().is_empty());
        non_empty(&self.body_text) || non_empty(&self.body_html)
    }

    /// Parent and ancestor IDs, `in_reply_to` first, deduplicated.
    pub fn ancestry(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for id in self.in_reply_to.iter().chain(self.references.iter()) {
            if !id.is_empty() && *id != self.message_id && !out.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participants_dedup() {
        let mut msg = Message::new("mbx", Direction::Inbound);
        msg.from_address = "a@x.com".into();
        msg.to_addresses = vec!["b@x.com".into(), "a@x.com".into()];
        msg.cc_addresses = vec!["c@x.com".into(), "b@x.com".into()];
        assert_eq!(msg.participants(), vec!["a@x.com", "b@x.com", "c@x.com"]);
        assert_eq!(msg.recipients(), vec!["b@x.com", "a@x.com", "c@x.com"]);
    }

    #[test]
    fn test_ancestry_skips_self_and_duplicates() {
        let mut msg = Message::new("mbx", Direction::Inbound);
        msg.message_id = "self@x".into();
        msg.in_reply_to = Some("p@x".into());
        msg.references = vec!["root@x".into(), "p@x".into(), "self@x".into()];
        assert_eq!(msg.ancestry(), vec!["p@x", "root@x"]);
    }

    #[test]
    fn test_new_outbound_is_queued() {
        let msg = Message::new("mbx", Direction::Outbound);
        assert_eq!(msg.status, Status::Queued);
        assert!(!msg.has_body());
    }
}
