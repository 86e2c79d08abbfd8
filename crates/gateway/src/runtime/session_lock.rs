//! Per-session write serialization.
//!
//! Concurrent messages to the same session are serialized on the
//! admission path so turn creation order matches arrival order. Each
//! session id maps to a `Semaphore(1)`; the permit is held for the
//! duration of the admission write.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

pub struct SessionLockMap {
    locks: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the write lock for a session. Waits until the previous
    /// admission finishes; the permit auto-releases on drop.
    pub async fn acquire(&self, session_id: Uuid) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // The semaphore is never closed, so acquire cannot fail.
        sem.acquire_owned().await.expect("session semaphore closed")
    }

    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop entries whose permit is free (no admission in flight).
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}
