//! Places messages into conversation threads.
//!
//! Matching runs a fixed chain and stops at the first hit:
//!
//! 1. a recorded orphan reference naming this message (parent arriving late)
//! 2. the `In-Reply-To` parent
//! 3. the first stored `References` ancestor
//! 4. a thread with the same normalized subject and shared participants
//!
//! Without a hit a new thread is seeded and any ancestor not yet stored is
//! recorded as an orphan so its eventual arrival joins this thread.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{MailError, Result};
use crate::model::message::Message;
use crate::model::thread::{OrphanEmail, Thread, ThreadUpdate};
use crate::parser::subject::normalize_subject;
use crate::store::{MessageRepository, OrphanRepository, Stores, ThreadRepository};

use super::locks::ThreadLocks;

/// Which step of the chain placed the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    OrphanParent,
    ReplyTo,
    References,
    Subject,
    /// No match; a thread was created.
    NewThread,
}

/// The thread a message ended up in, after the aggregate update.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub thread: Thread,
    pub strategy: MatchStrategy,
}

pub struct ThreadResolver {
    messages: Arc<dyn MessageRepository>,
    threads: Arc<dyn ThreadRepository>,
    orphans: Arc<dyn OrphanRepository>,
    locks: Arc<ThreadLocks>,
    subject_prefixes: Vec<String>,
    record_orphans: bool,
}

impl ThreadResolver {
    pub fn new(stores: &Stores, config: &Config) -> Self {
        Self {
            messages: stores.messages.clone(),
            threads: stores.threads.clone(),
            orphans: stores.orphans.clone(),
            locks: Arc::new(ThreadLocks::new()),
            subject_prefixes: config.subjects.extra_prefixes.clone(),
            record_orphans: config.threading.record_orphans,
        }
    }

    /// Share a lock map with other resolvers writing the same repositories.
    pub fn with_locks(mut self, locks: Arc<ThreadLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Find or create the thread for `message` and fold the message into it.
    ///
    /// Does not set `message.thread_id`; the caller persists that.
    pub async fn resolve(&self, message: &Message) -> Result<Resolution> {
        let matched = if let Some(id) = self.try_orphan_parent(message).await? {
            Some((id, MatchStrategy::OrphanParent))
        } else if let Some(id) = self.try_reply_to(message).await? {
            Some((id, MatchStrategy::ReplyTo))
        } else if let Some(id) = self.try_references(message).await? {
            Some((id, MatchStrategy::References))
        } else {
            self.try_subject_fallback(message)
                .await?
                .map(|id| (id, MatchStrategy::Subject))
        };

        match matched {
            Some((thread_id, strategy)) => {
                let thread = self.attach(&thread_id, message).await?;
                debug!(
                    message_id = %message.message_id,
                    thread_id = %thread.id,
                    ?strategy,
                    "Attached message to thread"
                );
                Ok(Resolution { thread, strategy })
            }
            None => {
                let thread = self.create_thread(message).await?;
                debug!(
                    message_id = %message.message_id,
                    thread_id = %thread.id,
                    "Started new thread"
                );
                Ok(Resolution {
                    thread,
                    strategy: MatchStrategy::NewThread,
                })
            }
        }
    }

    /// A child seen earlier recorded this message as its missing parent.
    pub async fn try_orphan_parent(&self, message: &Message) -> Result<Option<String>> {
        if message.in_reply_to.is_some() || !message.references.is_empty() {
            return Ok(None);
        }
        let Some(orphan) = self
            .orphans
            .get_by_message_id(&message.mailbox_id, &message.message_id)
            .await?
        else {
            return Ok(None);
        };
        let removed = self.orphans.delete_by_thread_id(&orphan.thread_id).await?;
        debug!(
            message_id = %message.message_id,
            thread_id = %orphan.thread_id,
            removed,
            "Resolved orphan reference"
        );
        Ok(Some(orphan.thread_id))
    }

    pub async fn try_reply_to(&self, message: &Message) -> Result<Option<String>> {
        let Some(parent_id) = message.in_reply_to.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .messages
            .get_by_message_id(&message.mailbox_id, parent_id)
            .await?
            .and_then(|parent| parent.thread_id))
    }

    pub async fn try_references(&self, message: &Message) -> Result<Option<String>> {
        for reference in &message.references {
            if let Some(thread_id) = self
                .messages
                .get_by_message_id(&message.mailbox_id, reference)
                .await?
                .and_then(|m| m.thread_id)
            {
                return Ok(Some(thread_id));
            }
        }
        Ok(None)
    }

    /// Exact normalized-subject match. With several candidates the one
    /// sharing the most participants wins, then the most recently active.
    pub async fn try_subject_fallback(&self, message: &Message) -> Result<Option<String>> {
        let subject = normalize_subject(&message.subject, &self.subject_prefixes);
        if subject.is_empty() {
            return Ok(None);
        }
        let mut candidates = self
            .threads
            .find_by_subject_and_mailbox(&subject, &message.mailbox_id)
            .await?;

        if candidates.len() == 1 {
            return Ok(candidates.pop().map(|t| t.id));
        }

        let participants = message.participants();
        Ok(candidates
            .iter()
            .map(|t| (t.overlap(&participants), t))
            .filter(|(overlap, _)| *overlap > 0)
            .max_by(|(a_overlap, a), (b_overlap, b)| {
                a_overlap
                    .cmp(b_overlap)
                    .then(a.last_message_at.cmp(&b.last_message_at))
            })
            .map(|(_, t)| t.id.clone()))
    }

    /// Merge `message` into an existing thread under its lock.
    async fn attach(&self, thread_id: &str, message: &Message) -> Result<Thread> {
        let _guard = self.locks.acquire(thread_id).await;

        let mut thread = self.threads.get_by_id(thread_id).await?.ok_or_else(|| {
            MailError::Integrity(format!("thread {thread_id} disappeared before update"))
        })?;
        thread.absorb(message);

        self.threads
            .update(thread_id, &ThreadUpdate::aggregate_of(&thread))
            .await?
            .ok_or_else(|| {
                MailError::Integrity(format!("thread {thread_id} disappeared during update"))
            })
    }

    async fn create_thread(&self, message: &Message) -> Result<Thread> {
        let subject = normalize_subject(&message.subject, &self.subject_prefixes);
        let thread = Thread::seed(message, &subject);
        self.threads.create(&thread).await?;

        if self.record_orphans {
            for ancestor in message.ancestry() {
                let stored = self
                    .messages
                    .get_by_message_id(&message.mailbox_id, &ancestor)
                    .await?;
                // A threadable ancestor stored but not yet threaded is still
                // in flight; its own resolution picks up the orphan row.
                let settled = stored
                    .is_some_and(|m| m.thread_id.is_some() || !m.classification.is_threadable());
                if settled {
                    continue;
                }
                let orphan = OrphanEmail {
                    message_id: ancestor,
                    referenced_by: message.message_id.clone(),
                    thread_id: thread.id.clone(),
                    mailbox_id: message.mailbox_id.clone(),
                };
                if let Err(e) = self.orphans.create(&orphan).await {
                    warn!(
                        message_id = %message.message_id,
                        orphan = %orphan.message_id,
                        error = %e,
                        "Failed to record orphan reference"
                    );
                }
            }
        }

        Ok(thread)
    }
}
