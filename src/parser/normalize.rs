//! Protocol envelope + MIME body → canonical [`Message`].
//!
//! Normalization never fails: invalid addresses are dropped, missing IDs are
//! synthesized and an unparseable full message falls back to the parts the
//! protocol client delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::model::address::{canonical_list, EmailAddress};
use crate::model::attachment::AttachmentDescriptor;
use crate::model::message::{Direction, Message};
use crate::parser::header::{
    decode_encoded_words, extract_message_ids, normalize_message_id, parse_date, HeaderMap,
};
use crate::parser::mime::{self, BodyStructure, ExtractedBody, RawPart};
use crate::parser::subject::clean_subject;

/// Structured metadata as a mailbox protocol reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub date: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub from: Vec<EmailAddress>,
    #[serde(default)]
    pub sender: Vec<EmailAddress>,
    #[serde(default)]
    pub reply_to: Vec<EmailAddress>,
    #[serde(default)]
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
}

impl RawEnvelope {
    /// Build an envelope from a parsed header block, as a protocol server
    /// would have reported it.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let list = |name: &str| {
            headers
                .get_all(name)
                .flat_map(EmailAddress::parse_list)
                .collect::<Vec<_>>()
        };
        Self {
            date: headers.get("date").and_then(parse_date),
            subject: headers.get("subject").map(String::from),
            message_id: headers.get("message-id").map(String::from),
            in_reply_to: headers.get("in-reply-to").map(String::from),
            from: list("from"),
            sender: list("sender"),
            reply_to: list("reply-to"),
            to: list("to"),
            cc: list("cc"),
            bcc: list("bcc"),
        }
    }
}

/// Body material delivered alongside the envelope. Any field may be absent.
#[derive(Debug, Clone, Default)]
pub struct RawBody {
    /// The complete RFC 5322 message.
    pub full: Option<Vec<u8>>,
    /// Only the header block.
    pub raw_headers: Option<Vec<u8>>,
    pub parts: Vec<RawPart>,
    pub structure: Option<BodyStructure>,
}

impl RawBody {
    /// Body consisting of the whole raw message.
    pub fn from_full(raw: impl Into<Vec<u8>>) -> Self {
        Self {
            full: Some(raw.into()),
            ..Default::default()
        }
    }
}

/// Result of normalization.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub message: Message,
    pub attachments: Vec<AttachmentDescriptor>,
    /// Every header known for the message, envelope fields included.
    pub headers: HeaderMap,
    /// The body carries a `message/delivery-status` part.
    pub has_delivery_status: bool,
}

/// Turns protocol input into canonical messages.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    subject_prefixes: Vec<String>,
}

impl Normalizer {
    /// `subject_prefixes` extends the built-in reply/forward markers.
    pub fn new(subject_prefixes: Vec<String>) -> Self {
        Self { subject_prefixes }
    }

    pub fn normalize(
        &self,
        mailbox_id: &str,
        folder: &str,
        envelope: &RawEnvelope,
        body: &RawBody,
    ) -> Normalized {
        let extracted = extract_body(body);
        let mut headers = extracted.headers.clone();
        if headers.is_empty() {
            if let Some(raw) = &body.raw_headers {
                headers = HeaderMap::parse(raw);
            }
        }
        fill_from_envelope(&mut headers, envelope);

        let mut msg = Message::new(mailbox_id, Direction::Inbound);
        msg.folder = folder.to_string();

        // Participants: envelope first, headers when the envelope is silent.
        let pick = |env: &[EmailAddress], name: &str| -> Vec<EmailAddress> {
            if env.is_empty() {
                headers
                    .get_all(name)
                    .flat_map(EmailAddress::parse_list)
                    .collect()
            } else {
                env.to_vec()
            }
        };
        let from = pick(&envelope.from, "from");
        if let Some(first) = from
            .iter()
            .find_map(|a| a.canonical().map(|c| (c, a.display_name.clone())))
        {
            msg.from_address = first.0;
            msg.from_name = decode_encoded_words(&first.1);
        }
        msg.to_addresses = canonical_list(&pick(&envelope.to, "to"));
        msg.cc_addresses = canonical_list(&pick(&envelope.cc, "cc"));
        msg.bcc_addresses = canonical_list(&pick(&envelope.bcc, "bcc"));

        let raw_subject = envelope
            .subject
            .as_deref()
            .or_else(|| headers.get("subject"))
            .unwrap_or("");
        msg.subject = decode_encoded_words(raw_subject).trim().to_string();
        msg.clean_subject = clean_subject(&msg.subject, &self.subject_prefixes);

        let date_header = headers.get("date");
        msg.date = envelope
            .date
            .or_else(|| date_header.and_then(parse_date))
            .unwrap_or_else(Utc::now);

        msg.message_id = envelope
            .message_id
            .as_deref()
            .or_else(|| headers.get("message-id"))
            .map(normalize_message_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| {
                let id = synthesize_message_id(
                    mailbox_id,
                    &msg.from_address,
                    envelope.date.map(|d| d.to_rfc3339()).as_deref().or(date_header),
                    &msg.subject,
                );
                debug!(message_id = %id, "Synthesized missing Message-ID");
                id
            });

        let reply_ids = envelope
            .in_reply_to
            .as_deref()
            .or_else(|| headers.get("in-reply-to"))
            .map(extract_message_ids)
            .unwrap_or_default();
        msg.in_reply_to = reply_ids.first().cloned();

        let mut references: Vec<String> = Vec::new();
        let header_refs = headers
            .get_all("references")
            .flat_map(extract_message_ids)
            .collect::<Vec<_>>();
        for id in reply_ids.into_iter().chain(header_refs) {
            if id != msg.message_id && !references.contains(&id) {
                references.push(id);
            }
        }
        msg.references = references;

        msg.body_text = extracted.text.filter(|t| !t.trim().is_empty());
        msg.body_html = extracted.html.filter(|h| !h.trim().is_empty());
        msg.has_attachment = !extracted.attachments.is_empty();

        msg.raw_headers = headers.to_json();
        msg.raw_envelope = serde_json::to_value(envelope).unwrap_or(serde_json::Value::Null);
        msg.raw_body_structure = extracted.structure;

        Normalized {
            message: msg,
            attachments: extracted.attachments,
            headers,
            has_delivery_status: extracted.has_delivery_status,
        }
    }
}

/// Full parse when possible, part-wise otherwise.
fn extract_body(body: &RawBody) -> ExtractedBody {
    if let Some(full) = body.full.as_deref().filter(|b| !b.is_empty()) {
        if let Some(extracted) = mime::extract_full(full) {
            return extracted;
        }
        debug!("Full message did not parse, scanning delivered parts");
        let mut extracted = mime::extract_parts(&body.parts, body.structure.as_ref());
        extracted.headers = HeaderMap::parse(full);
        return extracted;
    }
    mime::extract_parts(&body.parts, body.structure.as_ref())
}

/// Mirror envelope data into the header view the classifier reads, without
/// overriding headers that were actually present.
fn fill_from_envelope(headers: &mut HeaderMap, envelope: &RawEnvelope) {
    let fields: [(&str, &[EmailAddress]); 3] = [
        ("from", &envelope.from),
        ("sender", &envelope.sender),
        ("reply-to", &envelope.reply_to),
    ];
    for (name, list) in fields {
        if !headers.contains(name) && !list.is_empty() {
            let value = list
                .iter()
                .map(EmailAddress::display)
                .collect::<Vec<_>>()
                .join(", ");
            headers.insert(name, &value);
        }
    }
    if !headers.contains("subject") {
        if let Some(subject) = &envelope.subject {
            headers.insert("subject", subject);
        }
    }
}

/// Deterministic ID for messages that arrive without one.
fn synthesize_message_id(mailbox_id: &str, from: &str, date: Option<&str>, subject: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [mailbox_id, from, date.unwrap_or(""), subject] {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{}@synthesized.local", &digest[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: \"Alice Example\" <Alice@Example.com>\r\n\
To: bob@example.org, not-an-address, BOB@example.org\r\n\
Cc: carol@example.net\r\n\
Subject: =?UTF-8?B?UmU6IFByb3llY3Rv?=\r\n\
Date: Tue, 02 Jan 2024 10:00:00 +0000\r\n\
Message-ID: <child@example.com>\r\n\
In-Reply-To: <parent@example.com>\r\n\
References: <root@example.com> <parent@example.com>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hello Bob\r\n";

    fn normalizer() -> Normalizer {
        Normalizer::default()
    }

    #[test]
    fn test_delivery_status_reaches_classifier() {
        use crate::classify::Classifier;
        use crate::model::message::Classification;

        let raw = b"From: notifications@relay.net\r\n\
To: team@acme.com\r\n\
Subject: Your message\r\n\
Message-ID: <dsn-1@relay.net>\r\n\
Content-Type: multipart/mixed; boundary=\"dsn\"\r\n\
\r\n\
--dsn\r\n\
Content-Type: text/plain\r\n\
\r\n\
Could not deliver.\r\n\
--dsn\r\n\
Content-Type: message/delivery-status\r\n\
\r\n\
Action: failed\r\n\
--dsn--\r\n";
        let out = normalizer().normalize("mbx", "INBOX", &RawEnvelope::default(), &RawBody::from_full(&raw[..]));
        assert!(out.has_delivery_status);

        let verdict = Classifier::default().classify_normalized(&out);
        assert_eq!(verdict.classification, Classification::Bounce);
        assert_eq!(verdict.reason, "delivery status part");
    }

    #[test]
    fn test_normalize_full_message() {
        let envelope = RawEnvelope::from_headers(&HeaderMap::parse(RAW));
        let out = normalizer().normalize("mbx", "INBOX", &envelope, &RawBody::from_full(RAW));
        let msg = out.message;

        assert_eq!(msg.message_id, "child@example.com");
        assert_eq!(msg.from_address, "alice@example.com");
        assert_eq!(msg.from_name, "Alice Example");
        assert_eq!(msg.to_addresses, vec!["bob@example.org"]);
        assert_eq!(msg.cc_addresses, vec!["carol@example.net"]);
        assert_eq!(msg.subject, "Re: Proyecto");
        assert_eq!(msg.clean_subject, "Proyecto");
        assert_eq!(msg.in_reply_to.as_deref(), Some("parent@example.com"));
        assert_eq!(msg.references, vec!["parent@example.com", "root@example.com"]);
        assert_eq!(msg.body_text.as_deref().map(str::trim), Some("Hello Bob"));
        assert_eq!(msg.folder, "INBOX");
        assert!(!msg.has_attachment);
    }

    #[test]
    fn test_missing_message_id_is_synthesized_deterministically() {
        let envelope = RawEnvelope {
            subject: Some("No id".into()),
            from: vec![EmailAddress::bare("x@example.com")],
            ..Default::default()
        };
        let body = RawBody {
            parts: vec![RawPart {
                content_type: "text/plain".into(),
                content: b"hi".to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let a = normalizer().normalize("mbx", "INBOX", &envelope, &body).message;
        let b = normalizer().normalize("mbx", "INBOX", &envelope, &body).message;
        assert!(!a.message_id.is_empty());
        assert_eq!(a.message_id, b.message_id);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_html_only_body_gets_text() {
        let envelope = RawEnvelope {
            message_id: Some("<h@x.com>".into()),
            ..Default::default()
        };
        let body = RawBody {
            parts: vec![RawPart {
                content_type: "text/html".into(),
                content: b"<p>Only <b>HTML</b></p>".to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let msg = normalizer().normalize("mbx", "INBOX", &envelope, &body).message;
        assert_eq!(msg.body_text.as_deref(), Some("Only HTML"));
        assert!(msg.body_html.is_some());
    }

    #[test]
    fn test_envelope_reply_to_reaches_header_view() {
        let envelope = RawEnvelope {
            message_id: Some("r@x.com".into()),
            from: vec![EmailAddress::bare("a@x.com")],
            reply_to: vec![EmailAddress::bare("replies@y.com")],
            ..Default::default()
        };
        let out = normalizer().normalize("mbx", "INBOX", &envelope, &RawBody::default());
        assert_eq!(out.headers.get("reply-to"), Some("replies@y.com"));
        assert_eq!(out.message.in_reply_to, None);
        assert!(out.message.references.is_empty());
    }
}
