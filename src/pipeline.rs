//! Inbound and outbound orchestration.
//!
//! Inbound: normalize → classify → persist (idempotency boundary) → thread →
//! attachments → events. Outbound: validate → compose → persist as queued
//! (idempotency boundary) → thread → deliver → events.

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classify::{Classifier, Verdict};
use crate::compose::{self, Composed};
use crate::config::Config;
use crate::error::{MailError, Result};
use crate::events::{Event, EventKind, EventPublisher};
use crate::model::attachment::{content_hash, Attachment, AttachmentDescriptor};
use crate::model::mailbox::Mailbox;
use crate::model::message::{Classification, Direction, Message, Status};
use crate::parser::normalize::{Normalizer, RawBody, RawEnvelope};
use crate::store::{Created, Stores};
use crate::threading::{MatchStrategy, ThreadLocks, ThreadResolver};
use crate::transport::{MailTransport, TransportAdapter};

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InboundOutcome {
    Stored {
        /// Internal ID of the new record.
        id: String,
        message_id: String,
        classification: Classification,
        reason: String,
        /// Set for `Ok` messages only.
        thread_id: Option<String>,
        strategy: Option<MatchStrategy>,
    },
    /// The `(mailbox, Message-ID)` pair was already stored; nothing changed.
    Duplicate { id: String, message_id: String },
}

/// Result of an outbound send, reported to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub success: bool,
    /// Protocol Message-ID, once one was assigned.
    pub message_id: Option<String>,
    /// Internal record ID, once the message was persisted.
    pub id: Option<String>,
    pub error_message: Option<String>,
}

impl SendResult {
    fn failed(message: &Message, persisted: bool, error: &MailError) -> Self {
        Self {
            success: false,
            message_id: (!message.message_id.is_empty()).then(|| message.message_id.clone()),
            id: persisted.then(|| message.id.clone()),
            error_message: Some(error.to_string()),
        }
    }
}

pub struct Engine {
    stores: Stores,
    normalizer: Normalizer,
    classifier: Classifier,
    resolver: ThreadResolver,
    transport: TransportAdapter,
    publisher: Arc<dyn EventPublisher>,
    /// Keyed by mailbox and Message-ID.
    ingest_locks: ThreadLocks,
}

impl Engine {
    pub fn new(
        stores: Stores,
        config: &Config,
        transport: Arc<dyn MailTransport>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            normalizer: Normalizer::new(config.subjects.extra_prefixes.clone()),
            classifier: Classifier::new(&config.classifier),
            resolver: ThreadResolver::new(&stores, config),
            transport: TransportAdapter::new(
                transport,
                stores.messages.clone(),
                config.transport.timeout(),
            ),
            publisher,
            ingest_locks: ThreadLocks::new(),
            stores,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    async fn mailbox(&self, mailbox_id: &str) -> Result<Mailbox> {
        self.stores
            .mailboxes
            .get_mailbox(mailbox_id)
            .await?
            .ok_or_else(|| MailError::MailboxNotFound(mailbox_id.to_string()))
    }

    // ── Inbound ─────────────────────────────────────────────────

    /// Ingest one message delivered by a mailbox protocol.
    ///
    /// Re-delivering the same message is harmless: the second call returns
    /// [`InboundOutcome::Duplicate`] before any thread work. A stored `Ok`
    /// message left without a thread by an earlier failed attempt is picked
    /// up again instead: threading and attachment linking resume on the
    /// stored record.
    pub async fn process_inbound(
        &self,
        mailbox_id: &str,
        folder: &str,
        envelope: &RawEnvelope,
        body: &RawBody,
    ) -> Result<InboundOutcome> {
        let mailbox = self.mailbox(mailbox_id).await?;

        let normalized = self
            .normalizer
            .normalize(&mailbox.id, folder, envelope, body);
        let Verdict {
            classification,
            reason,
        } = self.classifier.classify_normalized(&normalized);
        let mut message = normalized.message;
        message.classification = classification;
        message.classification_reason = reason.clone();

        // Concurrent deliveries of one message wait here, so only one of
        // them can find the record unthreaded.
        let _guard = self
            .ingest_locks
            .acquire(&format!("{}:{}", mailbox.id, message.message_id))
            .await;

        if let Created::Existing(existing) = self.stores.messages.create(&message).await? {
            let existing = *existing;
            if !needs_threading(&existing) {
                self.relink_attachments(&existing, &normalized.attachments)
                    .await?;
                debug!(message_id = %existing.message_id, "Duplicate message, skipping");
                return Ok(InboundOutcome::Duplicate {
                    id: existing.id,
                    message_id: existing.message_id,
                });
            }
            info!(
                message_id = %existing.message_id,
                "Resuming unthreaded message from an earlier attempt"
            );
            message = existing;
        }
        let classification = message.classification;
        let reason = message.classification_reason.clone();

        let resolution = if classification.is_threadable() {
            let resolution = self.resolver.resolve(&message).await?;
            message.thread_id = Some(resolution.thread.id.clone());
            self.stores.messages.update(&message).await?;
            Some(resolution)
        } else {
            debug!(
                message_id = %message.message_id,
                %classification,
                reason = %reason,
                "Not threading classified message"
            );
            None
        };

        self.store_attachments(&message, &normalized.attachments)
            .await?;

        if let Some(resolution) = &resolution {
            self.publish(EventKind::MessageReceived, &message.id, &mailbox.id)
                .await;
            self.publish(EventKind::ThreadUpdated, &resolution.thread.id, &mailbox.id)
                .await;
        }

        info!(
            message_id = %message.message_id,
            %classification,
            thread_id = ?message.thread_id,
            "Ingested message"
        );

        Ok(InboundOutcome::Stored {
            id: message.id,
            message_id: message.message_id,
            classification,
            reason,
            thread_id: message.thread_id,
            strategy: resolution.map(|r| r.strategy),
        })
    }

    /// Link payloads a failed attempt left out of an already stored message.
    async fn relink_attachments(
        &self,
        message: &Message,
        descriptors: &[AttachmentDescriptor],
    ) -> Result<()> {
        let carried = descriptors.iter().filter(|d| d.data.is_some()).count();
        if carried == 0 {
            return Ok(());
        }
        let linked = self
            .stores
            .attachments
            .list_by_email(&message.id)
            .await?
            .len();
        if linked < carried {
            self.store_attachments(message, descriptors).await?;
        }
        Ok(())
    }

    /// Store payloads by content hash, reusing identical ones.
    async fn store_attachments(
        &self,
        message: &Message,
        descriptors: &[AttachmentDescriptor],
    ) -> Result<()> {
        let store = &self.stores.attachments;
        let thread_id = message.thread_id.as_deref();
        for descriptor in descriptors {
            let Some(data) = descriptor.data.as_deref() else {
                debug!(
                    message_id = %message.message_id,
                    filename = %descriptor.filename,
                    "Attachment announced without payload"
                );
                continue;
            };
            match store.check_exists(&content_hash(data)).await? {
                Some(existing) => {
                    store.link(&existing.id, &message.id, thread_id).await?;
                }
                None => {
                    let mut record = Attachment::from_descriptor(descriptor, data);
                    record.link(&message.id, thread_id);
                    store.store(&record, data).await?;
                }
            }
        }
        Ok(())
    }

    // ── Outbound ────────────────────────────────────────────────

    /// Compose, persist, thread and send a new outbound message.
    pub async fn compose_and_send(
        &self,
        mailbox_id: &str,
        message: Message,
        attachments: &[Attachment],
    ) -> SendResult {
        self.compose_and_send_until(mailbox_id, message, attachments, None)
            .await
    }

    /// As [`Engine::compose_and_send`], giving up on the transport at `deadline`.
    pub async fn compose_and_send_until(
        &self,
        mailbox_id: &str,
        mut message: Message,
        attachments: &[Attachment],
        deadline: Option<Instant>,
    ) -> SendResult {
        let mailbox = match self.mailbox(mailbox_id).await {
            Ok(mailbox) => mailbox,
            Err(e) => return SendResult::failed(&message, false, &e),
        };

        message.mailbox_id = mailbox.id.clone();
        message.direction = Direction::Outbound;
        message.status = Status::Queued;
        // Whole seconds, as carried by the Date header.
        message.date = Utc::now().trunc_subsecs(0);
        if message.from_address.is_empty() {
            message.from_address = mailbox.address.clone();
        }
        message.has_attachment = !attachments.is_empty();

        if let Err(e) = TransportAdapter::validate(&message, &mailbox) {
            return SendResult::failed(&message, false, &e);
        }

        let composed = match self.persist_outbound(&mut message, &mailbox, attachments).await {
            Ok(composed) => composed,
            Err(e) => {
                warn!(error = %e, "Failed to persist outbound message");
                return SendResult::failed(&message, false, &e);
            }
        };
        if let Err(e) = self.thread_outbound(&mut message, &mailbox, attachments).await {
            warn!(message_id = %message.message_id, error = %e, "Failed to thread outbound message");
            return SendResult::failed(&message, true, &e);
        }

        self.deliver(&mut message, &mailbox, &composed, deadline)
            .await
    }

    /// Send a stored message again, e.g. after a failed attempt.
    ///
    /// The message is recomposed from its record; identifiers, `Date` and
    /// MIME boundary match the first attempt.
    pub async fn retry_send(&self, id: &str, deadline: Option<Instant>) -> SendResult {
        let mut message = match self.stores.messages.get_by_id(id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                let e = MailError::validation(format!("message {id} not found"));
                return SendResult {
                    success: false,
                    message_id: None,
                    id: None,
                    error_message: Some(e.to_string()),
                };
            }
            Err(e) => {
                return SendResult {
                    success: false,
                    message_id: None,
                    id: Some(id.to_string()),
                    error_message: Some(e.to_string()),
                }
            }
        };

        if message.direction != Direction::Outbound || message.status == Status::Sent {
            let e = MailError::validation(format!(
                "message {} is not an unsent outbound message",
                message.id
            ));
            return SendResult::failed(&message, true, &e);
        }

        let mailbox = match self.mailbox(&message.mailbox_id).await {
            Ok(mailbox) => mailbox,
            Err(e) => return SendResult::failed(&message, true, &e),
        };
        let attachments = match self.stores.attachments.list_by_email(&message.id).await {
            Ok(attachments) => attachments,
            Err(e) => return SendResult::failed(&message, true, &e),
        };

        if message.thread_id.is_none() {
            if let Err(e) = self.thread_outbound(&mut message, &mailbox, &attachments).await {
                return SendResult::failed(&message, true, &e);
            }
        }

        let composed = match self.compose_for(&message, &mailbox, &attachments).await {
            Ok(composed) => composed,
            Err(e) => return SendResult::failed(&message, true, &e),
        };
        self.deliver(&mut message, &mailbox, &composed, deadline)
            .await
    }

    /// Compose once to fix identifiers and persist the message as queued.
    ///
    /// Nothing else is touched when the Message-ID is already taken.
    async fn persist_outbound(
        &self,
        message: &mut Message,
        mailbox: &Mailbox,
        attachments: &[Attachment],
    ) -> Result<Composed> {
        let composed = self.compose_for(message, mailbox, attachments).await?;
        composed.apply_to(message);

        if let Created::Existing(_) = self.stores.messages.create(message).await? {
            return Err(MailError::validation(format!(
                "message {} already exists",
                message.message_id
            )));
        }
        Ok(composed)
    }

    /// Fold a persisted outbound message into its thread and link its
    /// attachments.
    async fn thread_outbound(
        &self,
        message: &mut Message,
        mailbox: &Mailbox,
        attachments: &[Attachment],
    ) -> Result<()> {
        let resolution = self.resolver.resolve(message).await?;
        message.thread_id = Some(resolution.thread.id.clone());
        self.stores.messages.update(message).await?;

        for attachment in attachments {
            self.stores
                .attachments
                .link(&attachment.id, &message.id, message.thread_id.as_deref())
                .await?;
        }
        self.publish(EventKind::ThreadUpdated, &resolution.thread.id, &mailbox.id)
            .await;
        Ok(())
    }

    async fn compose_for(
        &self,
        message: &Message,
        mailbox: &Mailbox,
        attachments: &[Attachment],
    ) -> Result<Composed> {
        let parent = self.parent_of(message).await?;
        compose::compose(
            message,
            attachments,
            mailbox,
            parent.as_ref(),
            self.stores.attachments.as_ref(),
        )
        .await
    }

    async fn parent_of(&self, message: &Message) -> Result<Option<Message>> {
        match message.in_reply_to.as_deref() {
            Some(parent_id) => {
                self.stores
                    .messages
                    .get_by_message_id(&message.mailbox_id, parent_id)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Hand the composed bytes to the transport.
    async fn deliver(
        &self,
        message: &mut Message,
        mailbox: &Mailbox,
        composed: &Composed,
        deadline: Option<Instant>,
    ) -> SendResult {
        match self
            .transport
            .deliver(message, mailbox, &composed.envelope, &composed.bytes, deadline)
            .await
        {
            Ok(()) => {
                self.publish(EventKind::MessageSent, &message.id, &mailbox.id)
                    .await;
                SendResult {
                    success: true,
                    message_id: Some(message.message_id.clone()),
                    id: Some(message.id.clone()),
                    error_message: None,
                }
            }
            Err(e) => {
                if message.status == Status::Failed {
                    self.publish(EventKind::MessageFailed, &message.id, &mailbox.id)
                        .await;
                }
                SendResult::failed(message, true, &e)
            }
        }
    }

    async fn publish(&self, kind: EventKind, entity_id: &str, mailbox_id: &str) {
        self.publisher
            .publish(Event::new(kind, entity_id, mailbox_id))
            .await;
    }
}

/// An `Ok` inbound record an earlier attempt stored but never threaded.
fn needs_threading(message: &Message) -> bool {
    message.direction == Direction::Inbound
        && message.classification.is_threadable()
        && message.thread_id.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelPublisher;
    use crate::model::address::EmailAddress;
    use crate::parser::mime::RawPart;
    use crate::transport::mock::MockTransport;
    use std::sync::atomic::AtomicUsize;

    fn mailbox() -> Mailbox {
        let mut m = Mailbox::new("mbx", "team@acme.com");
        m.outbound_enabled = true;
        m
    }

    fn engine(transport: MockTransport) -> (Engine, tokio::sync::mpsc::Receiver<Event>) {
        let config = Config::default();
        let (publisher, rx) = ChannelPublisher::new(&config.events);
        let engine = Engine::new(
            Stores::in_memory([mailbox()]),
            &config,
            Arc::new(transport),
            Arc::new(publisher),
        );
        (engine, rx)
    }

    fn envelope(message_id: &str, from: &str, subject: &str) -> RawEnvelope {
        RawEnvelope {
            message_id: Some(format!("<{message_id}>")),
            subject: Some(subject.to_string()),
            from: vec![EmailAddress::parse(from)],
            to: vec![EmailAddress::bare("team@acme.com")],
            ..Default::default()
        }
    }

    fn text_body(text: &str) -> RawBody {
        RawBody {
            parts: vec![RawPart {
                content_type: "text/plain".into(),
                content: text.as_bytes().to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_mailbox_is_fatal() {
        let (engine, _rx) = engine(MockTransport::default());
        let err = engine
            .process_inbound("nope", "INBOX", &envelope("a@x.com", "a@x.com", "Hi"), &text_body("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::MailboxNotFound(_)));
    }

    #[tokio::test]
    async fn test_ok_message_is_threaded_and_announced() {
        let (engine, mut rx) = engine(MockTransport::default());
        let outcome = engine
            .process_inbound(
                "mbx",
                "INBOX",
                &envelope("a@x.com", "Bob <bob@other.org>", "Proposal"),
                &text_body("Draft attached soon"),
            )
            .await
            .unwrap();
        let InboundOutcome::Stored {
            classification,
            thread_id,
            ..
        } = outcome
        else {
            panic!("expected stored");
        };
        assert_eq!(classification, Classification::Ok);
        assert!(thread_id.is_some());
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::MessageReceived);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ThreadUpdated);
    }

    #[tokio::test]
    async fn test_classified_message_is_not_threaded() {
        let (engine, mut rx) = engine(MockTransport::default());
        let outcome = engine
            .process_inbound(
                "mbx",
                "INBOX",
                &envelope("n@x.com", "noreply@shop.example", "Deals"),
                &text_body("Buy"),
            )
            .await
            .unwrap();
        match outcome {
            InboundOutcome::Stored {
                classification,
                thread_id,
                ..
            } => {
                assert_eq!(classification, Classification::Bulk);
                assert_eq!(thread_id, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_failure_then_retry() {
        let transport = MockTransport {
            failures: AtomicUsize::new(1),
            ..Default::default()
        };
        let (engine, _rx) = engine(transport);

        let mut msg = Message::new("mbx", Direction::Outbound);
        msg.to_addresses = vec!["bob@other.org".into()];
        msg.subject = "Proposal".into();
        msg.body_text = Some("Please review".into());

        let first = engine.compose_and_send("mbx", msg, &[]).await;
        assert!(!first.success);
        assert!(first.error_message.unwrap().contains("550"));
        let id = first.id.expect("persisted");

        let stored = engine.stores().messages.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Failed);
        assert!(stored.sent_at.is_none());
        assert!(stored.thread_id.is_some());

        let second = engine.retry_send(&id, None).await;
        assert!(second.success, "{:?}", second.error_message);
        assert_eq!(second.message_id, first.message_id);
        let stored = engine.stores().messages.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Sent);
        assert!(stored.sent_at.is_some());
        assert_eq!(stored.send_attempts, 2);
    }

    #[tokio::test]
    async fn test_validation_failure_persists_nothing() {
        let (engine, _rx) = engine(MockTransport::default());
        let mut msg = Message::new("mbx", Direction::Outbound);
        msg.to_addresses = vec!["bob@other.org".into()];
        msg.body_text = Some("No subject".into());

        let result = engine.compose_and_send("mbx", msg, &[]).await;
        assert!(!result.success);
        assert_eq!(result.id, None);
        assert!(result.error_message.unwrap().starts_with("Validation failed"));
    }
}
