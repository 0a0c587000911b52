//! Outbound message composition.
//!
//! Produces the exact bytes handed to the transport plus the metadata that is
//! stored back on the message record: the header block, the SMTP envelope
//! and a summary of the MIME structure.

use std::time::SystemTime;

use chrono::Utc;
use lettre::message::header::{self, ContentDisposition, ContentType};
use lettre::message::{Body, Mailbox as LettreMailbox, MultiPart, SinglePart};
use lettre::Address;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{MailError, Result};
use crate::model::attachment::Attachment;
use crate::model::mailbox::Mailbox;
use crate::model::message::Message;
use crate::parser::header::HeaderMap;
use crate::store::AttachmentStore;
use crate::transport::smtp::lettre_envelope;
use crate::transport::SendEnvelope;

/// A composed message ready for the transport.
#[derive(Debug, Clone)]
pub struct Composed {
    pub bytes: Vec<u8>,
    /// Without angle brackets.
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub headers: HeaderMap,
    pub envelope: SendEnvelope,
    pub body_structure: Vec<PartSummary>,
}

/// One leaf of the composed MIME tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartSummary {
    pub content_type: String,
    pub disposition: Option<String>,
    pub filename: Option<String>,
    pub content_id: Option<String>,
    pub size: usize,
}

impl Composed {
    /// Store identifiers and provenance on the message record.
    pub fn apply_to(&self, message: &mut Message) {
        message.message_id = self.message_id.clone();
        message.in_reply_to = self.in_reply_to.clone();
        message.references = self.references.clone();
        message.raw_headers = self.headers.to_json();
        message.raw_envelope = serde_json::to_value(&self.envelope).unwrap_or(serde_json::Value::Null);
        message.raw_body_structure =
            serde_json::to_value(&self.body_structure).unwrap_or(serde_json::Value::Null);
    }
}

/// Build the outbound bytes for `message`.
///
/// Attachment payloads are fetched from `store` on every call. `parent` is
/// the message being replied to, if any. Once `message_id` is set the output
/// is stable: `Date` comes from `message.date` and the MIME boundary is
/// derived from the Message-ID, so a resend carries the recorded headers.
pub async fn compose(
    message: &Message,
    attachments: &[Attachment],
    mailbox: &Mailbox,
    parent: Option<&Message>,
    store: &dyn AttachmentStore,
) -> Result<Composed> {
    let message_id = if message.message_id.is_empty() {
        generate_message_id(message, &mailbox.domain)
    } else {
        message.message_id.clone()
    };

    let (in_reply_to, references) = match parent {
        Some(parent) => {
            let mut refs: Vec<String> = Vec::new();
            for id in parent.references.iter().chain(std::iter::once(&parent.message_id)) {
                if !id.is_empty() && !refs.contains(id) {
                    refs.push(id.clone());
                }
            }
            (Some(parent.message_id.clone()), refs)
        }
        None => (message.in_reply_to.clone(), message.references.clone()),
    };

    let display_name = if message.from_name.is_empty() {
        mailbox.display_name.clone()
    } else {
        message.from_name.clone()
    };
    let from = LettreMailbox::new(
        (!display_name.is_empty()).then_some(display_name),
        parse_address(&message.from_address)?,
    );

    let envelope = SendEnvelope {
        from: message.from_address.clone(),
        recipients: message.recipients(),
    };

    // Explicit envelope so Bcc-only messages build without a Bcc header.
    let mut builder = lettre::Message::builder()
        .envelope(lettre_envelope(&envelope)?)
        .from(from)
        .subject(message.subject.clone())
        .message_id(Some(format!("<{message_id}>")))
        .date(SystemTime::from(message.date));
    for to in &message.to_addresses {
        builder = builder.to(LettreMailbox::new(None, parse_address(to)?));
    }
    for cc in &message.cc_addresses {
        builder = builder.cc(LettreMailbox::new(None, parse_address(cc)?));
    }
    if let Some(parent_id) = &in_reply_to {
        builder = builder.in_reply_to(format!("<{parent_id}>"));
    }
    if !references.is_empty() {
        let joined = references
            .iter()
            .map(|r| format!("<{r}>"))
            .collect::<Vec<_>>()
            .join(" ");
        builder = builder.references(joined);
    }

    let text = message.body_text.clone().unwrap_or_default();
    let mut summary: Vec<PartSummary> = Vec::new();

    let built = if attachments.is_empty() && message.body_html.is_none() {
        summary.push(PartSummary {
            content_type: "text/plain; charset=utf-8".to_string(),
            disposition: None,
            filename: None,
            content_id: None,
            size: text.len(),
        });
        builder.singlepart(SinglePart::plain(text))
    } else {
        let mut multipart = MultiPart::mixed().boundary(boundary_for(&message_id)).build();
        if message.body_text.is_some() {
            summary.push(PartSummary {
                content_type: "text/plain; charset=utf-8".to_string(),
                disposition: None,
                filename: None,
                content_id: None,
                size: text.len(),
            });
            multipart = multipart.singlepart(SinglePart::plain(text));
        }
        if let Some(html) = &message.body_html {
            summary.push(PartSummary {
                content_type: "text/html; charset=utf-8".to_string(),
                disposition: None,
                filename: None,
                content_id: None,
                size: html.len(),
            });
            multipart = multipart.singlepart(SinglePart::html(html.clone()));
        }
        for attachment in attachments {
            let data = store.download(&attachment.id).await?;
            summary.push(PartSummary {
                content_type: attachment.content_type.clone(),
                disposition: Some(if attachment.is_inline { "inline" } else { "attachment" }.to_string()),
                filename: Some(attachment.filename.clone()),
                content_id: attachment.content_id.clone(),
                size: data.len(),
            });
            multipart = multipart.singlepart(attachment_part(attachment, data));
        }
        builder.multipart(multipart)
    };
    let built = built.map_err(|e| MailError::Mime(format!("failed to build message: {e}")))?;

    let bytes = built.formatted();
    let headers = HeaderMap::parse(&bytes);

    debug!(
        message_id = %message_id,
        parts = summary.len(),
        size = bytes.len(),
        "Composed outbound message"
    );

    Ok(Composed {
        bytes,
        message_id,
        in_reply_to,
        references,
        headers,
        envelope,
        body_structure: summary,
    })
}

fn boundary_for(message_id: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(message_id.as_bytes()));
    format!("mailcore-{}", &digest[..32])
}

fn parse_address(addr: &str) -> Result<Address> {
    addr.parse::<Address>()
        .map_err(|e| MailError::validation(format!("invalid address '{addr}': {e}")))
}

/// Attachment part with its original filename and content type; inline
/// parts also carry their `Content-ID`.
fn attachment_part(attachment: &Attachment, data: Vec<u8>) -> SinglePart {
    let content_type = ContentType::parse(&attachment.content_type)
        .or_else(|_| ContentType::parse("application/octet-stream"))
        .unwrap_or(ContentType::TEXT_PLAIN);
    let builder = SinglePart::builder().header(content_type);
    let builder = if attachment.is_inline {
        let builder = builder.header(ContentDisposition::inline_with_name(&attachment.filename));
        match &attachment.content_id {
            Some(cid) => builder.header(header::ContentId::from(format!("<{cid}>"))),
            None => builder,
        }
    } else {
        builder.header(ContentDisposition::attachment(&attachment.filename))
    };
    builder.body(Body::new(data))
}

/// `<micros>.<12 random>.<8 hex>@<domain>`, without brackets.
///
/// The hex suffix hashes sender, recipients and subject so IDs of unrelated
/// messages generated in the same microsecond still differ.
pub fn generate_message_id(message: &Message, domain: &str) -> String {
    let micros = Utc::now().timestamp_micros();
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(message.from_address.as_bytes());
    for r in message.recipients() {
        hasher.update(r.as_bytes());
    }
    hasher.update(message.subject.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let domain = if domain.is_empty() { "localhost" } else { domain };
    format!("{micros}.{random}.{}@{domain}", &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::attachment::AttachmentDescriptor;
    use crate::model::message::Direction;
    use crate::store::memory::MemoryStore;

    fn mailbox() -> Mailbox {
        let mut m = Mailbox::new("mbx", "team@acme.com");
        m.display_name = "Acme Team".into();
        m
    }

    fn outbound(text: Option<&str>, html: Option<&str>) -> Message {
        let mut m = Message::new("mbx", Direction::Outbound);
        m.from_address = "team@acme.com".into();
        m.to_addresses = vec!["bob@other.org".into()];
        m.cc_addresses = vec!["carol@other.org".into()];
        m.bcc_addresses = vec!["audit@acme.com".into()];
        m.subject = "Quarterly report".into();
        m.body_text = text.map(String::from);
        m.body_html = html.map(String::from);
        m
    }

    #[tokio::test]
    async fn test_plain_text_is_single_part() {
        let store = MemoryStore::new();
        let composed = compose(&outbound(Some("Hello"), None), &[], &mailbox(), None, &store)
            .await
            .unwrap();
        let raw = String::from_utf8(composed.bytes.clone()).unwrap();
        assert!(raw.contains("Content-Type: text/plain; charset=utf-8"));
        assert!(!raw.contains("multipart/"));
        assert_eq!(composed.headers.get("mime-version"), Some("1.0"));
        assert!(composed.headers.contains("date"));
        assert_eq!(composed.body_structure.len(), 1);
    }

    #[tokio::test]
    async fn test_bcc_only_in_envelope() {
        let store = MemoryStore::new();
        let composed = compose(&outbound(Some("Hello"), None), &[], &mailbox(), None, &store)
            .await
            .unwrap();
        let raw = String::from_utf8(composed.bytes.clone()).unwrap();
        assert!(!raw.contains("audit@acme.com"));
        assert_eq!(
            composed.envelope.recipients,
            vec!["bob@other.org", "carol@other.org", "audit@acme.com"]
        );
        assert!(composed.headers.get("cc").unwrap().contains("carol@other.org"));
    }

    #[tokio::test]
    async fn test_generated_message_id_shape() {
        let store = MemoryStore::new();
        let composed = compose(&outbound(Some("Hello"), None), &[], &mailbox(), None, &store)
            .await
            .unwrap();
        let (local, domain) = composed.message_id.split_once('@').unwrap();
        assert_eq!(domain, "acme.com");
        let pieces: Vec<&str> = local.split('.').collect();
        assert_eq!(pieces.len(), 3);
        assert!(pieces[0].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(pieces[1].len(), 12);
        assert_eq!(pieces[2].len(), 8);
        assert_eq!(
            composed.headers.get("message-id"),
            Some(format!("<{}>", composed.message_id).as_str())
        );
    }

    #[tokio::test]
    async fn test_reply_headers_extend_parent_references() {
        let store = MemoryStore::new();
        let mut parent = Message::new("mbx", Direction::Inbound);
        parent.message_id = "p2@other.org".into();
        parent.references = vec!["p1@other.org".into()];

        let composed = compose(
            &outbound(Some("Thanks"), None),
            &[],
            &mailbox(),
            Some(&parent),
            &store,
        )
        .await
        .unwrap();
        assert_eq!(composed.in_reply_to.as_deref(), Some("p2@other.org"));
        assert_eq!(composed.references, vec!["p1@other.org", "p2@other.org"]);
        assert_eq!(composed.headers.get("in-reply-to"), Some("<p2@other.org>"));
        assert_eq!(
            composed.headers.get("references"),
            Some("<p1@other.org> <p2@other.org>")
        );
    }

    #[tokio::test]
    async fn test_inline_attachment_carries_content_id() {
        let store = MemoryStore::new();
        let descriptor = AttachmentDescriptor {
            filename: "logo.png".into(),
            content_type: "image/png".into(),
            size: 4,
            content_id: Some("logo@acme".into()),
            is_inline: true,
            data: None,
        };
        let record = Attachment::from_descriptor(&descriptor, &[0x89, b'P', b'N', b'G']);
        let record = store.store(&record, &[0x89, b'P', b'N', b'G']).await.unwrap();

        let composed = compose(
            &outbound(Some("See logo"), Some("<img src=\"cid:logo@acme\">")),
            &[record],
            &mailbox(),
            None,
            &store,
        )
        .await
        .unwrap();
        let raw = String::from_utf8_lossy(&composed.bytes);
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("Content-ID: <logo@acme>"));
        assert!(raw.contains("inline"));
        assert_eq!(composed.body_structure.len(), 3);
        assert_eq!(composed.body_structure[2].disposition.as_deref(), Some("inline"));
    }

    #[tokio::test]
    async fn test_recompose_is_byte_identical() {
        let store = MemoryStore::new();
        let data = b"%PDF-1.4\n";
        let descriptor = AttachmentDescriptor {
            filename: "report.pdf".into(),
            content_type: "application/pdf".into(),
            size: data.len() as u64,
            content_id: None,
            is_inline: false,
            data: None,
        };
        let attachment = store
            .store(&Attachment::from_descriptor(&descriptor, data), data)
            .await
            .unwrap();

        let mut msg = outbound(Some("Hello"), Some("<p>Hello</p>"));
        let first = compose(&msg, &[attachment.clone()], &mailbox(), None, &store)
            .await
            .unwrap();
        first.apply_to(&mut msg);

        let second = compose(&msg, &[attachment], &mailbox(), None, &store)
            .await
            .unwrap();
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(msg.raw_headers, second.headers.to_json());
        let raw = String::from_utf8_lossy(&second.bytes);
        assert!(raw.contains(&boundary_for(&msg.message_id)));
    }

    #[tokio::test]
    async fn test_apply_to_records_metadata() {
        let store = MemoryStore::new();
        let mut msg = outbound(Some("Hello"), None);
        let composed = compose(&msg, &[], &mailbox(), None, &store).await.unwrap();
        composed.apply_to(&mut msg);
        assert_eq!(msg.message_id, composed.message_id);
        assert!(msg.raw_headers.is_array());
        assert_eq!(msg.raw_envelope["from"], "team@acme.com");
        assert!(msg.raw_body_structure.is_array());
    }
}
