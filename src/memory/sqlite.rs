//! Conversation memory storage using SQLite
//!
//! Rows live in `chat_memory`, unique on `(conversation_id, message_index)`.
//! A batch is written inside one transaction so readers never observe a
//! partially appended turn.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use super::{MemoryBackend, MemoryError, StoredMessage};
use crate::conversation::Role;

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) the database at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Create an in-memory database for testing
    pub async fn new_in_memory() -> Result<Self, MemoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(pool).await
    }

    /// Use an existing pool, creating the schema if missing
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, MemoryError> {
        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                message_index INTEGER NOT NULL,
                message_type TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (conversation_id, message_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn count(&self, conversation_id: &str) -> Result<u64, MemoryError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM chat_memory WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn insert(
        &self,
        conversation_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await?;

        for message in messages {
            sqlx::query(
                r#"
                INSERT INTO chat_memory (conversation_id, message_index, message_type, content, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(conversation_id)
            .bind(message.index as i64)
            .bind(message.role.message_type())
            .bind(&message.content)
            .bind(message.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            r#"
            SELECT message_index, message_type, content, created_at
            FROM chat_memory
            WHERE conversation_id = ?
            ORDER BY message_index DESC
            LIMIT ?
            "#,
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        // Reverse to get chronological order
        rows.into_iter()
            .rev()
            .map(|(index, message_type, content, created_at)| {
                Ok(StoredMessage {
                    conversation_id: conversation_id.to_string(),
                    index: index as u64,
                    role: Role::from_message_type(&message_type),
                    content,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), MemoryError> {
        sqlx::query("DELETE FROM chat_memory WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<String>, MemoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT conversation_id FROM chat_memory
            GROUP BY conversation_id
            ORDER BY MAX(created_at) DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::Corrupt(format!("bad created_at '{}': {}", value, e)))
}
