//! Fire-and-forget domain events.
//!
//! Publishing never fails the operation that triggered it: a full channel is
//! retried a bounded number of times and then the event is dropped with a
//! warning.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::EventsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An OK inbound message was stored and threaded.
    MessageReceived,
    /// A thread aggregate changed.
    ThreadUpdated,
    MessageSent,
    MessageFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// Message or thread ID, depending on `kind`.
    pub entity_id: String,
    pub mailbox_id: String,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, entity_id: impl Into<String>, mailbox_id: impl Into<String>) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            mailbox_id: mailbox_id.into(),
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event);
}

/// Sends events into a bounded channel.
pub struct ChannelPublisher {
    tx: mpsc::Sender<Event>,
    retries: u32,
    backoff: Duration,
}

impl ChannelPublisher {
    /// Publisher plus the receiving end for the consumer.
    pub fn new(config: &EventsConfig) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        (
            Self {
                tx,
                retries: config.publish_retries,
                backoff: config.retry_backoff(),
            },
            rx,
        )
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: Event) {
        let mut event = event;
        let mut attempt = 0;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Closed(e)) => {
                    warn!(kind = ?e.kind, entity_id = %e.entity_id, "Event channel closed, dropping event");
                    return;
                }
                Err(mpsc::error::TrySendError::Full(e)) => {
                    if attempt >= self.retries {
                        warn!(
                            kind = ?e.kind,
                            entity_id = %e.entity_id,
                            attempts = attempt + 1,
                            "Event channel full, dropping event"
                        );
                        return;
                    }
                    attempt += 1;
                    event = e;
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

/// Writes events to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: Event) {
        info!(
            kind = ?event.kind,
            entity_id = %event.entity_id,
            mailbox_id = %event.mailbox_id,
            "Event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize, retries: u32) -> EventsConfig {
        EventsConfig {
            capacity,
            publish_retries: retries,
            retry_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (publisher, mut rx) = ChannelPublisher::new(&config(8, 0));
        publisher.publish(Event::new(EventKind::MessageReceived, "m1", "mbx")).await;
        publisher.publish(Event::new(EventKind::ThreadUpdated, "t1", "mbx")).await;
        assert_eq!(rx.recv().await.unwrap().entity_id, "m1");
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ThreadUpdated);
    }

    #[tokio::test]
    async fn test_full_channel_drops_after_retries() {
        let (publisher, mut rx) = ChannelPublisher::new(&config(1, 2));
        publisher.publish(Event::new(EventKind::MessageSent, "m1", "mbx")).await;
        // Returns instead of blocking once the retry budget is spent.
        publisher.publish(Event::new(EventKind::MessageSent, "m2", "mbx")).await;
        assert_eq!(rx.recv().await.unwrap().entity_id, "m1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_is_ignored() {
        let (publisher, rx) = ChannelPublisher::new(&config(1, 3));
        drop(rx);
        publisher.publish(Event::new(EventKind::MessageFailed, "m1", "mbx")).await;
    }
}
