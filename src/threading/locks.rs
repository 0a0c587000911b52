//! Per-thread serialization of aggregate updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map of thread ID → async mutex.
///
/// Writers to different threads never contend; writers to the same thread
/// queue on its mutex. Entries are pruned once nobody holds or waits on them.
#[derive(Debug, Default)]
pub struct ThreadLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a thread aggregate is read, merged and written back.
pub struct ThreadGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `thread_id`.
    pub async fn acquire(&self, thread_id: &str) -> ThreadGuard {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries only the map still references.
            map.retain(|id, l| id == thread_id || Arc::strong_count(l) > 1);
            map.entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        ThreadGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of tracked thread IDs.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
