//! Persistence seams.
//!
//! The engine reaches storage only through these traits. [`memory`] backs
//! them with in-process maps for tests, benchmarks and the CLI.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::attachment::Attachment;
use crate::model::mailbox::Mailbox;
use crate::model::message::Message;
use crate::model::thread::{OrphanEmail, Thread, ThreadUpdate};

/// Outcome of inserting a message.
#[derive(Debug, Clone)]
pub enum Created {
    Inserted,
    /// A message with the same `(mailbox_id, message_id)` already exists.
    Existing(Box<Message>),
}

#[async_trait]
pub trait MailboxRepository: Send + Sync {
    async fn get_mailbox(&self, id: &str) -> Result<Option<Mailbox>>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Insert unless `(mailbox_id, message_id)` is taken.
    async fn create(&self, message: &Message) -> Result<Created>;

    async fn get_by_message_id(&self, mailbox_id: &str, message_id: &str)
        -> Result<Option<Message>>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Message>>;

    async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Message>>;

    /// Persist the mutable fields of `message`: thread linkage, status,
    /// status detail, attempt count and timestamps. Identity, direction and
    /// content are left as first stored.
    async fn update(&self, message: &Message) -> Result<()>;
}

#[async_trait]
pub trait ThreadRepository: Send + Sync {
    async fn create(&self, thread: &Thread) -> Result<()>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Thread>>;

    /// Apply `update` with partial-field semantics. `None` if the thread is gone.
    async fn update(&self, id: &str, update: &ThreadUpdate) -> Result<Option<Thread>>;

    /// Threads of `mailbox_id` whose normalized subject equals `subject`.
    async fn find_by_subject_and_mailbox(&self, subject: &str, mailbox_id: &str)
        -> Result<Vec<Thread>>;

    async fn list_by_mailbox(&self, mailbox_id: &str) -> Result<Vec<Thread>>;
}

#[async_trait]
pub trait OrphanRepository: Send + Sync {
    /// Record an orphan reference; a no-op if the same reference exists.
    async fn create(&self, orphan: &OrphanEmail) -> Result<()>;

    async fn get_by_message_id(&self, mailbox_id: &str, message_id: &str)
        -> Result<Option<OrphanEmail>>;

    /// Remove every orphan row of a thread, returning how many went.
    async fn delete_by_thread_id(&self, thread_id: &str) -> Result<usize>;

    async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<OrphanEmail>>;
}

/// Content-addressed attachment storage.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Existing record for a SHA-256 content hash.
    async fn check_exists(&self, content_hash: &str) -> Result<Option<Attachment>>;

    /// Store bytes and record. Returns the record as stored.
    async fn store(&self, attachment: &Attachment, data: &[u8]) -> Result<Attachment>;

    async fn get(&self, id: &str) -> Result<Option<Attachment>>;

    async fn download(&self, id: &str) -> Result<Vec<u8>>;

    /// Append back-references to an existing record.
    async fn link(&self, id: &str, email_id: &str, thread_id: Option<&str>) -> Result<()>;

    async fn list_by_email(&self, email_id: &str) -> Result<Vec<Attachment>>;
}

/// Every repository the engine talks to.
#[derive(Clone)]
pub struct Stores {
    pub mailboxes: Arc<dyn MailboxRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub threads: Arc<dyn ThreadRepository>,
    pub orphans: Arc<dyn OrphanRepository>,
    pub attachments: Arc<dyn AttachmentStore>,
}

impl Stores {
    /// All repositories backed by one [`memory::MemoryStore`].
    pub fn in_memory(mailboxes: impl IntoIterator<Item = Mailbox>) -> Self {
        let store = Arc::new(memory::MemoryStore::with_mailboxes(mailboxes));
        Self {
            mailboxes: store.clone(),
            messages: store.clone(),
            threads: store.clone(),
            orphans: store.clone(),
            attachments: store,
        }
    }
}
