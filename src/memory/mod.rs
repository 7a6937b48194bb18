//! Conversation memory
//!
//! `MemoryStore` owns the ordering contract: per conversation, message indices
//! are contiguous, start at 0 and follow append order. Physical storage is
//! delegated to a [`MemoryBackend`] chosen at construction time.

mod file;
mod in_memory;
mod locks;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::conversation::{Message, Role};

pub use file::FileBackend;
pub use in_memory::InMemoryBackend;
pub use locks::KeyedLocks;
pub use sqlite::SqliteBackend;

/// A persisted message with its position in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub conversation_id: String,
    pub index: u64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        Message {
            role: stored.role,
            content: stored.content,
        }
    }
}

/// Errors from conversation persistence
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid conversation id: {0}")]
    InvalidConversationId(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Physical storage for conversation logs
///
/// Implementations only store and read; index assignment and per-conversation
/// serialization are done by [`MemoryStore`]. `insert` must be all-or-nothing.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Number of messages currently stored for a conversation
    async fn count(&self, conversation_id: &str) -> Result<u64, MemoryError>;

    /// Persist a batch of already-indexed messages
    async fn insert(&self, conversation_id: &str, messages: &[StoredMessage])
        -> Result<(), MemoryError>;

    /// The `limit` highest-indexed messages, oldest-first
    async fn recent(&self, conversation_id: &str, limit: usize)
        -> Result<Vec<StoredMessage>, MemoryError>;

    /// Remove every message of a conversation
    async fn clear(&self, conversation_id: &str) -> Result<(), MemoryError>;

    /// Ids of all conversations with at least one message
    async fn list_conversations(&self) -> Result<Vec<String>, MemoryError>;
}

/// Which backend to build, taken from the `[memory]` settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryBackendKind {
    InMemory,
    File(PathBuf),
    Sqlite(PathBuf),
}

/// Ordered, per-conversation message log
pub struct MemoryStore {
    backend: Arc<dyn MemoryBackend>,
    locks: KeyedLocks,
}

impl MemoryStore {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            backend,
            locks: KeyedLocks::new(),
        }
    }

    /// Build the store with the backend selected by configuration
    pub async fn open(kind: &MemoryBackendKind) -> Result<Self, MemoryError> {
        let backend: Arc<dyn MemoryBackend> = match kind {
            MemoryBackendKind::InMemory => Arc::new(InMemoryBackend::new()),
            MemoryBackendKind::File(dir) => Arc::new(FileBackend::new(dir).await?),
            MemoryBackendKind::Sqlite(path) => Arc::new(SqliteBackend::new(path).await?),
        };
        Ok(Self::new(backend))
    }

    /// In-process store, mostly for tests
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Append messages, assigning indices from the current count
    ///
    /// Appends to the same conversation are serialized; appends to different
    /// conversations proceed independently.
    pub async fn append(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        validate_conversation_id(conversation_id)?;
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let result = {
            let _guard = self.locks.lock(conversation_id).await;
            self.append_locked(conversation_id, messages).await
        };
        self.locks.forget(conversation_id);
        result
    }

    async fn append_locked(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        let start = self.backend.count(conversation_id).await?;
        let now = Utc::now();
        let stored: Vec<StoredMessage> = messages
            .into_iter()
            .enumerate()
            .map(|(offset, message)| StoredMessage {
                conversation_id: conversation_id.to_string(),
                index: start + offset as u64,
                role: message.role,
                content: message.content,
                created_at: now,
            })
            .collect();

        self.backend.insert(conversation_id, &stored).await?;

        tracing::debug!(
            conversation_id,
            first_index = start,
            count = stored.len(),
            "Appended messages to {}",
            self.backend.name()
        );

        Ok(stored)
    }

    /// The `last_n` most recent messages, oldest-first
    pub async fn get(
        &self,
        conversation_id: &str,
        last_n: usize,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        validate_conversation_id(conversation_id)?;
        if last_n == 0 {
            return Ok(Vec::new());
        }
        self.backend.recent(conversation_id, last_n).await
    }

    /// Drop a conversation; the next append starts again at index 0
    pub async fn clear(&self, conversation_id: &str) -> Result<(), MemoryError> {
        validate_conversation_id(conversation_id)?;
        {
            let _guard = self.locks.lock(conversation_id).await;
            self.backend.clear(conversation_id).await?;
        }
        self.locks.forget(conversation_id);
        tracing::info!(conversation_id, "Cleared conversation memory");
        Ok(())
    }

    pub async fn list_conversations(&self) -> Result<Vec<String>, MemoryError> {
        self.backend.list_conversations().await
    }
}

fn validate_conversation_id(conversation_id: &str) -> Result<(), MemoryError> {
    if conversation_id.trim().is_empty() {
        return Err(MemoryError::InvalidConversationId(
            "conversation id must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(messages: &[StoredMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    fn indices(messages: &[StoredMessage]) -> Vec<u64> {
        messages.iter().map(|m| m.index).collect()
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_indices() {
        let store = MemoryStore::in_memory();

        store
            .append("c1", vec![Message::user("你好"), Message::user("我爱你")])
            .await
            .unwrap();
        store.append("c1", vec![Message::user("在吗")]).await.unwrap();

        let messages = store.get("c1", 10).await.unwrap();
        assert_eq!(texts(&messages), vec!["你好", "我爱你", "在吗"]);
        assert_eq!(indices(&messages), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_get_returns_last_n_oldest_first() {
        let store = MemoryStore::in_memory();
        let batch: Vec<Message> = (0..5).map(|i| Message::user(format!("m{}", i))).collect();
        store.append("c1", batch).await.unwrap();

        let messages = store.get("c1", 2).await.unwrap();
        assert_eq!(texts(&messages), vec!["m3", "m4"]);
        assert_eq!(indices(&messages), vec![3, 4]);

        assert!(store.get("c1", 0).await.unwrap().is_empty());
        assert!(store.get("unknown", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_restarts_indices() {
        let store = MemoryStore::in_memory();
        store
            .append("c1", vec![Message::user("a"), Message::assistant("b")])
            .await
            .unwrap();
        store.clear("c1").await.unwrap();
        assert!(store.get("c1", 10).await.unwrap().is_empty());

        let stored = store.append("c1", vec![Message::user("c")]).await.unwrap();
        assert_eq!(stored[0].index, 0);
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_collide() {
        let store = Arc::new(MemoryStore::in_memory());

        let mut handles = Vec::new();
        for task in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append(
                        "shared",
                        vec![
                            Message::user(format!("q{}", task)),
                            Message::assistant(format!("a{}", task)),
                        ],
                    )
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            let stored = handle.await.unwrap();
            // A single call always receives consecutive indices
            assert_eq!(stored[1].index, stored[0].index + 1);
        }

        let all = store.get("shared", 100).await.unwrap();
        assert_eq!(indices(&all), (0..32).collect::<Vec<u64>>());
        assert_eq!(store.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_append_releases_lock_entries() {
        let store = MemoryStore::in_memory();
        for i in 0..5 {
            store
                .append(&format!("c{}", i), vec![Message::user("hi")])
                .await
                .unwrap();
        }
        assert_eq!(store.locks.len(), 0);
        assert_eq!(store.list_conversations().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_empty_conversation_id_rejected() {
        let store = MemoryStore::in_memory();
        let result = store.append("  ", vec![Message::user("x")]).await;
        assert!(matches!(result, Err(MemoryError::InvalidConversationId(_))));
    }

    #[tokio::test]
    async fn test_open_selects_backend() {
        let store = MemoryStore::open(&MemoryBackendKind::InMemory).await.unwrap();
        assert_eq!(store.backend_name(), "in-memory");

        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&MemoryBackendKind::File(dir.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(store.backend_name(), "file");
    }
}
