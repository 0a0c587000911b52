//! `mailcore`: email ingestion, classification and threading engine.
//!
//! Inbound messages are normalized into canonical records, classified by an
//! ordered set of heuristics, deduplicated by `Message-ID` and attached to
//! conversation threads. Outbound messages are composed into RFC 5322 bytes
//! and delivered over SMTP with the outcome recorded on the message.

pub mod classify;
pub mod compose;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod store;
pub mod threading;
pub mod transport;
