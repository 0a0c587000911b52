//! Attachment metadata and content addressing.
//!
//! Descriptors come out of the normalizer with their bytes; stored
//! [`Attachment`] records only carry a storage key; the bytes live in the
//! [`AttachmentStore`](crate::store::AttachmentStore).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An attachment found while normalizing a message, not yet stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    /// Filename of the attachment. Generated if missing from the headers.
    pub filename: String,

    /// MIME content type (e.g. `"image/jpeg"`, `"application/pdf"`).
    pub content_type: String,

    /// Decoded size in bytes. Taken from the body structure when the
    /// payload was not delivered.
    pub size: u64,

    /// Content-ID for inline attachments referenced from HTML.
    pub content_id: Option<String>,

    /// `true` if the attachment is inline (embedded in HTML).
    pub is_inline: bool,

    /// Decoded payload; `None` when only the body structure announced it.
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

/// A stored, content-addressed attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    /// Lower-case hex SHA-256 of the payload.
    pub content_hash: String,
    pub storage_key: String,
    pub size: u64,
    pub content_type: String,
    pub filename: String,
    pub is_inline: bool,
    pub content_id: Option<String>,
    /// Internal message IDs referencing this payload (append-only).
    pub emails: Vec<String>,
    /// Thread IDs referencing this payload (append-only).
    pub threads: Vec<String>,
}

impl Attachment {
    /// Build an unstored record for `descriptor` and its payload.
    pub fn from_descriptor(descriptor: &AttachmentDescriptor, data: &[u8]) -> Self {
        let content_hash = content_hash(data);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            storage_key: storage_key(&content_hash),
            content_hash,
            size: data.len() as u64,
            content_type: descriptor.content_type.clone(),
            filename: descriptor.filename.clone(),
            is_inline: descriptor.is_inline,
            content_id: descriptor.content_id.clone(),
            emails: Vec::new(),
            threads: Vec::new(),
        }
    }

    /// Append back-references, skipping ones already present.
    pub fn link(&mut self, email_id: &str, thread_id: Option<&str>) {
        if !self.emails.iter().any(|e| e == email_id) {
            self.emails.push(email_id.to_string());
        }
        if let Some(thread_id) = thread_id {
            if !self.threads.iter().any(|t| t == thread_id) {
                self.threads.push(thread_id.to_string());
            }
        }
    }
}

/// SHA-256 of `data` as lower-case hex.
pub fn content_hash(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Storage key derived from a content hash, fanned out by prefix.
pub fn storage_key(hash: &str) -> String {
    let prefix = hash.get(..2).unwrap_or("00");
    format!("attachments/{prefix}/{hash}")
}
