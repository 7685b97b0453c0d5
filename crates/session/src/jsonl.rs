//! File-based session store — one JSON-lines file per session.
//!
//! The first line of each file is a metadata record naming the session key;
//! every following line is one JSON-encoded [`Message`]. Appends are
//! written straight to the end of the file, so a crash loses at most the
//! turn being written.
//!
//! Storage location: `~/.nimbot/sessions/<channel>_<chat_id>.jsonl`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbot_core::error::SessionError;
use nimbot_core::event::SessionKey;
use nimbot_core::message::Message;
use nimbot_core::session::SessionStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const METADATA_TYPE: &str = "metadata";

#[derive(Debug, Serialize, Deserialize)]
struct SessionHeader {
    #[serde(rename = "_type")]
    kind: String,
    key: SessionKey,
    created_at: DateTime<Utc>,
}

/// A file-backed session store.
///
/// Histories are read from disk on first access and cached; appends update
/// both the cache and the file.
pub struct JsonlSessionStore {
    dir: PathBuf,
    cache: RwLock<HashMap<SessionKey, Vec<Message>>>,
}

impl JsonlSessionStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!("{}.jsonl", key.file_stem()))
    }

    async fn read_history(&self, key: &SessionKey) -> Result<Vec<Message>, SessionError> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SessionError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let messages: Vec<Message> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter(|line| serde_json::from_str::<SessionHeader>(line).is_err())
            .filter_map(|line| match serde_json::from_str::<Message>(line) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(session = %key, error = %e, "Skipping corrupted session line");
                    None
                }
            })
            .collect();
        debug!(session = %key, count = messages.len(), "Session history loaded from disk");
        Ok(messages)
    }

    async fn write_line(&self, key: &SessionKey, message: &Message) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            SessionError::Storage(format!("Failed to create session directory: {e}"))
        })?;

        let path = self.path_for(key);
        let is_new = !tokio::fs::try_exists(&path).await.unwrap_or(false);

        let mut buf = String::new();
        if is_new {
            let header = SessionHeader {
                kind: METADATA_TYPE.into(),
                key: key.clone(),
                created_at: Utc::now(),
            };
            buf.push_str(&to_line(&header)?);
        }
        buf.push_str(&to_line(message)?);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to open {}: {e}", path.display())))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to append to {}: {e}", path.display())))?;
        file.flush()
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to flush {}: {e}", path.display())))?;
        Ok(())
    }
}

fn to_line<T: Serialize>(value: &T) -> Result<String, SessionError> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| SessionError::Storage(format!("Failed to serialize session record: {e}")))?;
    line.push('\n');
    Ok(line)
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn load(&self, key: &SessionKey) -> Result<Vec<Message>, SessionError> {
        if let Some(history) = self.cache.read().await.get(key) {
            return Ok(history.clone());
        }
        let history = self.read_history(key).await?;
        self.cache.write().await.insert(key.clone(), history.clone());
        Ok(history)
    }

    async fn append(&self, key: &SessionKey, message: Message) -> Result<(), SessionError> {
        self.write_line(key, &message).await?;

        {
            let mut cache = self.cache.write().await;
            if let Some(history) = cache.get_mut(key) {
                history.push(message);
                return Ok(());
            }
        }

        // First touch of this key in this process: the file now holds
        // everything, including the line just written.
        let history = self.read_history(key).await?;
        self.cache.write().await.insert(key.clone(), history);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<SessionKey>, SessionError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SessionError::Storage(format!("Failed to list sessions: {e}"))),
        };

        let mut keys = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let header = content
                .lines()
                .next()
                .and_then(|line| serde_json::from_str::<SessionHeader>(line).ok());
            match header {
                Some(h) if h.kind == METADATA_TYPE => keys.push(h.key),
                _ => warn!(path = %path.display(), "Session file without metadata header"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self, key: &SessionKey) -> Result<(), SessionError> {
        self.cache.write().await.remove(key);
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Storage(format!("Failed to clear session {key}: {e}"))),
        }
    }
}
