//! In-memory session store.

use async_trait::async_trait;
use nimbot_core::error::SessionError;
use nimbot_core::event::SessionKey;
use nimbot_core::message::Message;
use nimbot_core::session::SessionStore;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keeps every session's history in a map. Nothing survives a restart.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, Vec<Message>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, key: &SessionKey) -> Result<Vec<Message>, SessionError> {
        Ok(self.sessions.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn append(&self, key: &SessionKey, message: Message) -> Result<(), SessionError> {
        self.sessions
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<SessionKey>, SessionError> {
        let mut keys: Vec<SessionKey> = self.sessions.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self, key: &SessionKey) -> Result<(), SessionError> {
        self.sessions.write().await.remove(key);
        Ok(())
    }
}
