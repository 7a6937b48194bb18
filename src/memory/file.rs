//! JSON-file memory backend
//!
//! One file per conversation under a data directory. Writes go to a temporary
//! file that is renamed over the original, so a failed batch never leaves a
//! partially written log behind.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{MemoryBackend, MemoryError, StoredMessage};

const EXTENSION: &str = "json";

pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Create the backend, creating `dir` if needed
    pub async fn new(dir: &Path) -> Result<Self, MemoryError> {
        fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", encode_file_stem(conversation_id), EXTENSION))
    }

    async fn read_all(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, MemoryError> {
        match fs::read(self.path_for(conversation_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(
        &self,
        conversation_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), MemoryError> {
        let path = self.path_for(conversation_id);
        let tmp = path.with_extension(format!("{}.tmp", EXTENSION));
        fs::write(&tmp, serde_json::to_vec_pretty(messages)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl MemoryBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn count(&self, conversation_id: &str) -> Result<u64, MemoryError> {
        Ok(self.read_all(conversation_id).await?.len() as u64)
    }

    async fn insert(
        &self,
        conversation_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), MemoryError> {
        let mut all = self.read_all(conversation_id).await?;
        all.extend_from_slice(messages);
        self.write_all(conversation_id, &all).await
    }

    async fn recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        let mut all = self.read_all(conversation_id).await?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.split_off(skip))
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), MemoryError> {
        match fs::remove_file(self.path_for(conversation_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_conversations(&self) -> Result<Vec<String>, MemoryError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == EXTENSION) {
                if let Some(stem) = path.file_stem() {
                    ids.push(decode_file_stem(&stem.to_string_lossy())?);
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Escape anything outside `[A-Za-z0-9_-]` as `%XX` so ids map to safe file names
fn encode_file_stem(conversation_id: &str) -> String {
    let mut out = String::with_capacity(conversation_id.len());
    for byte in conversation_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_file_stem(stem: &str) -> Result<String, MemoryError> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem
                .get(i + 1..i + 3)
                .ok_or_else(|| MemoryError::Corrupt(format!("bad file name: {}", stem)))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| MemoryError::Corrupt(format!("bad file name: {}", stem)))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| MemoryError::Corrupt(format!("bad file name: {}", stem)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;
    use crate::memory::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn test_file_stem_escaping() {
        let id = "user/1:会话";
        let stem = encode_file_stem(id);
        assert!(!stem.contains('/'));
        assert_eq!(decode_file_stem(&stem).unwrap(), id);
        assert_eq!(encode_file_stem("abc-123_x"), "abc-123_x");
    }

    #[tokio::test]
    async fn test_file_backend_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = MemoryStore::new(Arc::new(FileBackend::new(dir.path()).await.unwrap()));
            store
                .append("c1", vec![Message::user("你好"), Message::assistant("你好！")])
                .await
                .unwrap();
        }

        let store = MemoryStore::new(Arc::new(FileBackend::new(dir.path()).await.unwrap()));
        store.append("c1", vec![Message::user("在吗")]).await.unwrap();

        let messages = store.get("c1", 10).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].index, 2);
        assert_eq!(messages[2].content, "在吗");
        assert_eq!(store.list_conversations().await.unwrap(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_file_backend_clear() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).await.unwrap();
        let store = MemoryStore::new(Arc::new(backend));

        store.append("c1", vec![Message::user("x")]).await.unwrap();
        store.clear("c1").await.unwrap();
        store.clear("c1").await.unwrap();

        assert!(store.get("c1", 10).await.unwrap().is_empty());
        assert!(store.list_conversations().await.unwrap().is_empty());
    }
}
