//! In-process memory backend

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{MemoryBackend, MemoryError, StoredMessage};

/// Keeps every conversation in a map; lost on restart
#[derive(Default)]
pub struct InMemoryBackend {
    conversations: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn count(&self, conversation_id: &str) -> Result<u64, MemoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .map_or(0, |messages| messages.len() as u64))
    }

    async fn insert(
        &self,
        conversation_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), MemoryError> {
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }

    async fn recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        let conversations = self.conversations.read().await;
        let Some(messages) = conversations.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), MemoryError> {
        self.conversations.write().await.remove(conversation_id);
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<String>, MemoryError> {
        let conversations = self.conversations.read().await;
        let mut ids: Vec<String> = conversations.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
