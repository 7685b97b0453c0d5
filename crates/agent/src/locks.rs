//! Per-session run locks.
//!
//! At most one agent run mutates a session's history at a time. A run holds
//! a [`SessionGuard`] from before it reads history until it has emitted its
//! outcome; dropping the guard (on any exit path, panics included) releases
//! the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nimbot_core::event::SessionKey;
use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>;

/// Lock table keyed by session. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<LockMap>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, LockMap> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until no other run holds `key`, then hold it.
    pub async fn acquire(&self, key: &SessionKey) -> SessionGuard {
        let lock = self.table().entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        SessionGuard {
            locks: self.clone(),
            key: key.clone(),
            held: Some(guard),
        }
    }

    /// Hold `key` only if it is free right now.
    pub fn try_acquire(&self, key: &SessionKey) -> Option<SessionGuard> {
        let lock = self.table().entry(key.clone()).or_default().clone();
        match lock.try_lock_owned() {
            Ok(guard) => Some(SessionGuard {
                locks: self.clone(),
                key: key.clone(),
                held: Some(guard),
            }),
            Err(_) => {
                self.prune(key);
                None
            }
        }
    }

    pub fn is_locked(&self, key: &SessionKey) -> bool {
        self.table().get(key).is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Number of sessions with a live lock entry.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Drop the entry for `key` once nobody holds or waits for it.
    fn prune(&self, key: &SessionKey) {
        let mut table = self.table();
        // One reference for the table, plus the releasing guard if any.
        if let Some(lock) = table.get(key) {
            if Arc::strong_count(lock) <= 1 {
                table.remove(key);
            }
        }
    }
}

/// Proof that the current run owns a session.
pub struct SessionGuard {
    locks: SessionLocks,
    key: SessionKey,
    held: Option<OwnedMutexGuard<()>>,
}

impl SessionGuard {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Release first so the count below only sees waiters.
        self.held.take();
        self.locks.prune(&self.key);
    }
}
