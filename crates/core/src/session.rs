//! SessionStore trait — persistence for per-session history.
//!
//! A key-value store with append semantics: the agent loop loads the
//! snapshot at run start and appends turns as the run progresses. The
//! per-session lock in the agent crate guarantees a single writer per key,
//! so implementations only need to be safe across *different* keys.

use async_trait::async_trait;

use crate::error::SessionError;
use crate::event::SessionKey;
use crate::message::Message;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "memory", "jsonl").
    fn name(&self) -> &str;

    /// Full history for `key`, oldest first. Unknown keys yield an empty history.
    async fn load(&self, key: &SessionKey) -> std::result::Result<Vec<Message>, SessionError>;

    /// Append one turn to the end of `key`'s history.
    async fn append(&self, key: &SessionKey, message: Message) -> std::result::Result<(), SessionError>;

    /// Every key that has stored history.
    async fn list_keys(&self) -> std::result::Result<Vec<SessionKey>, SessionError>;

    /// Drop all history for `key`.
    async fn clear(&self, key: &SessionKey) -> std::result::Result<(), SessionError>;
}
