//! Outbound delivery: precondition checks, the wire transport seam and
//! outcome bookkeeping on the message record.

pub mod smtp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{MailError, Result};
use crate::model::address::domain_of;
use crate::model::mailbox::Mailbox;
use crate::model::message::{Message, Status};
use crate::store::MessageRepository;

/// SMTP envelope: who the server is told the mail is from and to.
///
/// Recipients include Bcc addresses, which never appear in the headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEnvelope {
    pub from: String,
    pub recipients: Vec<String>,
}

/// Wire-level delivery of already formatted message bytes.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mailbox: &Mailbox, envelope: &SendEnvelope, raw: &[u8]) -> Result<()>;
}

/// Validates, delivers and records the outcome of one send attempt.
pub struct TransportAdapter {
    transport: Arc<dyn MailTransport>,
    messages: Arc<dyn MessageRepository>,
    timeout: Duration,
}

impl TransportAdapter {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        messages: Arc<dyn MessageRepository>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            messages,
            timeout,
        }
    }

    /// Check that `message` may be sent through `mailbox`.
    pub fn validate(message: &Message, mailbox: &Mailbox) -> Result<()> {
        if message.from_address.is_empty() {
            return Err(MailError::validation("from address is empty"));
        }
        let from_domain = domain_of(&message.from_address);
        if !from_domain.eq_ignore_ascii_case(&mailbox.domain) {
            return Err(MailError::validation(format!(
                "from domain {from_domain} does not belong to mailbox domain {}",
                mailbox.domain
            )));
        }
        if message.recipients().is_empty() {
            return Err(MailError::validation("message has no recipients"));
        }
        if message.subject.trim().is_empty() {
            return Err(MailError::validation("subject is empty"));
        }
        if !message.has_body() {
            return Err(MailError::validation("body is empty"));
        }
        if !mailbox.outbound_enabled {
            return Err(MailError::validation(format!(
                "outbound sending is disabled for mailbox {}",
                mailbox.id
            )));
        }
        Ok(())
    }

    /// Attempt delivery once and persist the outcome onto `message`.
    ///
    /// The attempt is abandoned at the earlier of the configured timeout and
    /// `deadline`. Either way the record ends up `Sent` or `Failed`; on
    /// failure the transport error is returned after it has been stored.
    pub async fn deliver(
        &self,
        message: &mut Message,
        mailbox: &Mailbox,
        envelope: &SendEnvelope,
        raw: &[u8],
        deadline: Option<Instant>,
    ) -> Result<()> {
        Self::validate(message, mailbox)?;

        let started = Instant::now();
        let mut until = started + self.timeout;
        if let Some(deadline) = deadline {
            until = until.min(deadline);
        }

        let outcome =
            match tokio::time::timeout_at(until, self.transport.send(mailbox, envelope, raw)).await
            {
                Ok(result) => result,
                Err(_) => Err(MailError::Timeout(until.saturating_duration_since(started))),
            };

        let now = Utc::now();
        message.send_attempts += 1;
        message.last_attempt_at = Some(now);

        match outcome {
            Ok(()) => {
                message.status = Status::Sent;
                message.status_detail = None;
                message.sent_at = Some(now);
                self.messages.update(message).await?;
                info!(
                    message_id = %message.message_id,
                    attempts = message.send_attempts,
                    "Message sent"
                );
                Ok(())
            }
            Err(e) => {
                message.status = Status::Failed;
                message.status_detail = Some(e.to_string());
                if let Err(persist) = self.messages.update(message).await {
                    warn!(
                        message_id = %message.message_id,
                        error = %persist,
                        "Failed to record send failure"
                    );
                }
                warn!(
                    message_id = %message.message_id,
                    attempts = message.send_attempts,
                    error = %e,
                    "Message send failed"
                );
                Err(e)
            }
        }
    }
}
