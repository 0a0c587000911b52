//! Conversation threading: the matching chain and per-thread update locks.

pub mod locks;
pub mod resolver;

pub use locks::ThreadLocks;
pub use resolver::{MatchStrategy, Resolution, ThreadResolver};
