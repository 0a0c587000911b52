//! In-memory repositories.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{
    AttachmentStore, Created, MailboxRepository, MessageRepository, OrphanRepository,
    ThreadRepository,
};
use crate::error::{MailError, Result};
use crate::model::attachment::Attachment;
use crate::model::mailbox::Mailbox;
use crate::model::message::Message;
use crate::model::thread::{OrphanEmail, Thread, ThreadUpdate};

#[derive(Debug, Default)]
struct MessageTable {
    by_id: HashMap<String, Message>,
    /// `(mailbox_id, message_id)` → internal ID.
    by_message_id: HashMap<(String, String), String>,
}

#[derive(Debug, Default)]
struct AttachmentTable {
    records: HashMap<String, Attachment>,
    /// content hash → record ID
    by_hash: HashMap<String, String>,
    /// storage key → bytes
    blobs: HashMap<String, Vec<u8>>,
}

/// Process-local implementation of every repository trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    mailboxes: RwLock<HashMap<String, Mailbox>>,
    messages: RwLock<MessageTable>,
    threads: RwLock<HashMap<String, Thread>>,
    orphans: RwLock<Vec<OrphanEmail>>,
    attachments: RwLock<AttachmentTable>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailboxes(mailboxes: impl IntoIterator<Item = Mailbox>) -> Self {
        let store = Self::new();
        store.add_mailboxes(mailboxes);
        store
    }

    pub fn add_mailboxes(&self, mailboxes: impl IntoIterator<Item = Mailbox>) {
        let mut map = write(&self.mailboxes);
        for mailbox in mailboxes {
            map.insert(mailbox.id.clone(), mailbox);
        }
    }

    pub fn message_count(&self) -> usize {
        read(&self.messages).by_id.len()
    }

    pub fn thread_count(&self) -> usize {
        read(&self.threads).len()
    }

    pub fn orphan_count(&self) -> usize {
        read(&self.orphans).len()
    }

    /// Number of distinct payloads held.
    pub fn blob_count(&self) -> usize {
        read(&self.attachments).blobs.len()
    }
}

#[async_trait]
impl MailboxRepository for MemoryStore {
    async fn get_mailbox(&self, id: &str) -> Result<Option<Mailbox>> {
        Ok(read(&self.mailboxes).get(id).cloned())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create(&self, message: &Message) -> Result<Created> {
        let mut table = write(&self.messages);
        let key = (message.mailbox_id.clone(), message.message_id.clone());
        if let Some(existing) = table.by_message_id.get(&key).and_then(|id| table.by_id.get(id)) {
            return Ok(Created::Existing(Box::new(existing.clone())));
        }
        table.by_message_id.insert(key, message.id.clone());
        table.by_id.insert(message.id.clone(), message.clone());
        Ok(Created::Inserted)
    }

    async fn get_by_message_id(
        &self,
        mailbox_id: &str,
        message_id: &str,
    ) -> Result<Option<Message>> {
        let table = read(&self.messages);
        let key = (mailbox_id.to_string(), message_id.to_string());
        Ok(table
            .by_message_id
            .get(&key)
            .and_then(|id| table.by_id.get(id))
            .cloned())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Message>> {
        Ok(read(&self.messages).by_id.get(id).cloned())
    }

    async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Message>> {
        let mut out: Vec<Message> = read(&self.messages)
            .by_id
            .values()
            .filter(|m| m.thread_id.as_deref() == Some(thread_id))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.date);
        Ok(out)
    }

    async fn update(&self, message: &Message) -> Result<()> {
        let mut table = write(&self.messages);
        let stored = table
            .by_id
            .get_mut(&message.id)
            .ok_or_else(|| MailError::Repository(format!("message {} not found", message.id)))?;
        stored.thread_id = message.thread_id.clone();
        stored.status = message.status;
        stored.status_detail = message.status_detail.clone();
        stored.send_attempts = message.send_attempts;
        stored.sent_at = message.sent_at;
        stored.last_attempt_at = message.last_attempt_at;
        Ok(())
    }
}

#[async_trait]
impl ThreadRepository for MemoryStore {
    async fn create(&self, thread: &Thread) -> Result<()> {
        let mut threads = write(&self.threads);
        if threads.contains_key(&thread.id) {
            return Err(MailError::Repository(format!(
                "thread {} already exists",
                thread.id
            )));
        }
        threads.insert(thread.id.clone(), thread.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Thread>> {
        Ok(read(&self.threads).get(id).cloned())
    }

    async fn update(&self, id: &str, update: &ThreadUpdate) -> Result<Option<Thread>> {
        let mut threads = write(&self.threads);
        Ok(threads.get_mut(id).map(|thread| {
            update.apply_to(thread);
            thread.clone()
        }))
    }

    async fn find_by_subject_and_mailbox(
        &self,
        subject: &str,
        mailbox_id: &str,
    ) -> Result<Vec<Thread>> {
        if subject.is_empty() {
            return Ok(Vec::new());
        }
        Ok(read(&self.threads)
            .values()
            .filter(|t| t.mailbox_id == mailbox_id && t.subject == subject)
            .cloned()
            .collect())
    }

    async fn list_by_mailbox(&self, mailbox_id: &str) -> Result<Vec<Thread>> {
        let mut out: Vec<Thread> = read(&self.threads)
            .values()
            .filter(|t| t.mailbox_id == mailbox_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(out)
    }
}

#[async_trait]
impl OrphanRepository for MemoryStore {
    async fn create(&self, orphan: &OrphanEmail) -> Result<()> {
        let mut orphans = write(&self.orphans);
        // One row per missing ancestor; later children naming it are no-ops.
        if !orphans
            .iter()
            .any(|o| o.mailbox_id == orphan.mailbox_id && o.message_id == orphan.message_id)
        {
            orphans.push(orphan.clone());
        }
        Ok(())
    }

    async fn get_by_message_id(
        &self,
        mailbox_id: &str,
        message_id: &str,
    ) -> Result<Option<OrphanEmail>> {
        Ok(read(&self.orphans)
            .iter()
            .find(|o| o.mailbox_id == mailbox_id && o.message_id == message_id)
            .cloned())
    }

    async fn delete_by_thread_id(&self, thread_id: &str) -> Result<usize> {
        let mut orphans = write(&self.orphans);
        let before = orphans.len();
        orphans.retain(|o| o.thread_id != thread_id);
        Ok(before - orphans.len())
    }

    async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<OrphanEmail>> {
        Ok(read(&self.orphans)
            .iter()
            .filter(|o| o.thread_id == thread_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AttachmentStore for MemoryStore {
    async fn check_exists(&self, content_hash: &str) -> Result<Option<Attachment>> {
        let table = read(&self.attachments);
        Ok(table
            .by_hash
            .get(content_hash)
            .and_then(|id| table.records.get(id))
            .cloned())
    }

    async fn store(&self, attachment: &Attachment, data: &[u8]) -> Result<Attachment> {
        let mut table = write(&self.attachments);
        // A concurrent writer may have stored the same payload first.
        if let Some(id) = table.by_hash.get(&attachment.content_hash).cloned() {
            let existing = table
                .records
                .get_mut(&id)
                .ok_or_else(|| MailError::Storage(format!("dangling hash index for {id}")))?;
            for email in &attachment.emails {
                existing.link(email, None);
            }
            for thread in &attachment.threads {
                if !existing.threads.contains(thread) {
                    existing.threads.push(thread.clone());
                }
            }
            return Ok(existing.clone());
        }
        table
            .blobs
            .insert(attachment.storage_key.clone(), data.to_vec());
        table
            .by_hash
            .insert(attachment.content_hash.clone(), attachment.id.clone());
        table
            .records
            .insert(attachment.id.clone(), attachment.clone());
        Ok(attachment.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Attachment>> {
        Ok(read(&self.attachments).records.get(id).cloned())
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let table = read(&self.attachments);
        let record = table
            .records
            .get(id)
            .ok_or_else(|| MailError::Storage(format!("attachment {id} not found")))?;
        table
            .blobs
            .get(&record.storage_key)
            .cloned()
            .ok_or_else(|| MailError::Storage(format!("payload {} missing", record.storage_key)))
    }

    async fn link(&self, id: &str, email_id: &str, thread_id: Option<&str>) -> Result<()> {
        let mut table = write(&self.attachments);
        let record = table
            .records
            .get_mut(id)
            .ok_or_else(|| MailError::Storage(format!("attachment {id} not found")))?;
        record.link(email_id, thread_id);
        Ok(())
    }

    async fn list_by_email(&self, email_id: &str) -> Result<Vec<Attachment>> {
        Ok(read(&self.attachments)
            .records
            .values()
            .filter(|a| a.emails.iter().any(|e| e == email_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::attachment::AttachmentDescriptor;
    use crate::model::message::{Direction, Status};

    fn message(message_id: &str) -> Message {
        let mut m = Message::new("mbx", Direction::Inbound);
        m.message_id = message_id.to_string();
        m.subject = "Original".to_string();
        m
    }

    #[tokio::test]
    async fn test_create_detects_duplicates_per_mailbox() {
        let store = MemoryStore::new();
        let first = message("a@x.com");
        assert!(matches!(
            MessageRepository::create(&store, &first).await.unwrap(),
            Created::Inserted
        ));
        match MessageRepository::create(&store, &message("a@x.com")).await.unwrap() {
            Created::Existing(existing) => assert_eq!(existing.id, first.id),
            Created::Inserted => panic!("duplicate inserted"),
        }

        let mut other_mailbox = message("a@x.com");
        other_mailbox.mailbox_id = "other".into();
        assert!(matches!(
            MessageRepository::create(&store, &other_mailbox).await.unwrap(),
            Created::Inserted
        ));
        assert_eq!(store.message_count(), 2);
    }

    #[tokio::test]
    async fn test_update_copies_only_mutable_fields() {
        let store = MemoryStore::new();
        let mut m = message("a@x.com");
        MessageRepository::create(&store, &m).await.unwrap();

        m.subject = "Changed".into();
        m.message_id = "b@x.com".into();
        m.thread_id = Some("t1".into());
        m.status = Status::Failed;
        m.send_attempts = 2;
        MessageRepository::update(&store, &m).await.unwrap();

        let stored = MessageRepository::get_by_id(&store, &m.id).await.unwrap().unwrap();
        assert_eq!(stored.subject, "Original");
        assert_eq!(stored.message_id, "a@x.com");
        assert_eq!(stored.thread_id.as_deref(), Some("t1"));
        assert_eq!(stored.status, Status::Failed);
        assert_eq!(stored.send_attempts, 2);
    }

    #[tokio::test]
    async fn test_orphans_are_unique_and_bulk_deleted() {
        let store = MemoryStore::new();
        let orphan = OrphanEmail {
            message_id: "parent@x.com".into(),
            referenced_by: "child@x.com".into(),
            thread_id: "t1".into(),
            mailbox_id: "mbx".into(),
        };
        OrphanRepository::create(&store, &orphan).await.unwrap();
        OrphanRepository::create(&store, &orphan).await.unwrap();
        let second_child = OrphanEmail {
            referenced_by: "other-child@y.org".into(),
            thread_id: "t2".into(),
            ..orphan.clone()
        };
        OrphanRepository::create(&store, &second_child).await.unwrap();
        assert_eq!(store.orphan_count(), 1);
        let kept = OrphanRepository::get_by_message_id(&store, "mbx", "parent@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.thread_id, "t1");
        assert_eq!(store.delete_by_thread_id("t1").await.unwrap(), 1);
        assert_eq!(store.orphan_count(), 0);
    }

    #[tokio::test]
    async fn test_attachment_bytes_stored_once() {
        let store = MemoryStore::new();
        let descriptor = AttachmentDescriptor {
            filename: "a.txt".into(),
            content_type: "text/plain".into(),
            size: 3,
            content_id: None,
            is_inline: false,
            data: None,
        };
        let mut first = Attachment::from_descriptor(&descriptor, b"abc");
        first.link("e1", Some("t1"));
        let stored = store.store(&first, b"abc").await.unwrap();

        let existing = store
            .check_exists(&stored.content_hash)
            .await
            .unwrap()
            .expect("found by hash");
        store.link(&existing.id, "e2", None).await.unwrap();

        assert_eq!(store.blob_count(), 1);
        let record = store.get(&existing.id).await.unwrap().unwrap();
        assert_eq!(record.emails, vec!["e1", "e2"]);
        assert_eq!(record.threads, vec!["t1"]);
        assert_eq!(store.download(&existing.id).await.unwrap(), b"abc");
    }
}
