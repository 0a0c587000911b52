//! Core data model: messages, threads, orphan references, attachments and mailboxes.

pub mod address;
pub mod attachment;
pub mod mailbox;
pub mod message;
pub mod thread;
