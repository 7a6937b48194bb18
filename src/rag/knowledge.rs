//! Relational knowledge base
//!
//! Entries live in `knowledge_base`. Full-text queries go through the FTS5
//! table `knowledge_fts`, kept in sync by triggers. When FTS5 is unavailable
//! only substring search works.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use super::{DocumentMetadata, DocumentSource, RetrievalError, RetrievedDocument};

const ENTRY_COLUMNS: &str =
    "kb.id, kb.title, kb.content, kb.category, kb.keywords, kb.source, kb.created_at, kb.updated_at";

/// A stored knowledge entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    pub keywords: Option<String>,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    /// Render as a retrieval document
    pub fn into_document(self) -> RetrievedDocument {
        let mut content = format!("# {}\n\n{}", self.title, self.content);
        if let Some(ref source) = self.source {
            content.push_str(&format!("\n\nSource: {}", source));
        }

        RetrievedDocument {
            content,
            metadata: DocumentMetadata {
                source: DocumentSource::Relational,
                id: self.id.to_string(),
                category: self.category,
                score: None,
                title: Some(self.title),
                keywords: self.keywords,
            },
        }
    }
}

/// A knowledge entry to insert
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewKnowledgeEntry {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Keyword search over the knowledge table
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Full-text match, most relevant first
    async fn full_text_search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>, RetrievalError>;

    /// Substring match over title, content and keywords, newest first
    async fn contains_search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>, RetrievalError>;

    /// Add an entry, returning its id
    async fn insert(&self, entry: NewKnowledgeEntry) -> Result<i64, RetrievalError>;
}

pub struct SqliteKnowledgeBase {
    pool: SqlitePool,
    full_text: bool,
}

impl SqliteKnowledgeBase {
    /// Open (or create) the database at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self, RetrievalError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RetrievalError::Backend(format!("{}: {}", parent.display(), e)))?;
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
    pub async fn new_in_memory() -> Result<Self, RetrievalError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(pool).await
    }

    /// Use an existing pool, creating the schema if missing
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, RetrievalError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_base (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                category TEXT,
                keywords TEXT,
                source TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_knowledge_category ON knowledge_base(category)")
            .execute(&pool)
            .await?;

        let full_text = match init_full_text(&pool).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("FTS5 unavailable, knowledge base limited to substring search: {}", e);
                false
            }
        };

        Ok(Self { pool, full_text })
    }

    pub fn has_full_text(&self) -> bool {
        self.full_text
    }

    /// Every entry, oldest first
    pub async fn entries(&self) -> Result<Vec<KnowledgeEntry>, RetrievalError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM knowledge_base kb ORDER BY kb.id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }
}

async fn init_full_text(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = [
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_fts USING fts5(
            title, content, keywords,
            content='knowledge_base', content_rowid='id'
        )
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS knowledge_fts_insert AFTER INSERT ON knowledge_base BEGIN
            INSERT INTO knowledge_fts(rowid, title, content, keywords)
            VALUES (new.id, new.title, new.content, new.keywords);
        END
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS knowledge_fts_delete AFTER DELETE ON knowledge_base BEGIN
            INSERT INTO knowledge_fts(knowledge_fts, rowid, title, content, keywords)
            VALUES ('delete', old.id, old.title, old.content, old.keywords);
        END
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS knowledge_fts_update AFTER UPDATE ON knowledge_base BEGIN
            INSERT INTO knowledge_fts(knowledge_fts, rowid, title, content, keywords)
            VALUES ('delete', old.id, old.title, old.content, old.keywords);
            INSERT INTO knowledge_fts(rowid, title, content, keywords)
            VALUES (new.id, new.title, new.content, new.keywords);
        END
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[async_trait]
impl KnowledgeBase for SqliteKnowledgeBase {
    async fn full_text_search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>, RetrievalError> {
        if !self.full_text || limit == 0 || query.split_whitespace().next().is_none() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM knowledge_fts
            JOIN knowledge_base kb ON kb.id = knowledge_fts.rowid
            WHERE knowledge_fts MATCH ?
              AND (? IS NULL OR kb.category = ?)
            ORDER BY bm25(knowledge_fts)
            LIMIT ?
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(match_expression(query))
            .bind(category)
            .bind(category)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn contains_search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>, RetrievalError> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM knowledge_base kb
            WHERE (kb.title LIKE ?1 ESCAPE '\'
                   OR kb.content LIKE ?1 ESCAPE '\'
                   OR kb.keywords LIKE ?1 ESCAPE '\')
              AND (?2 IS NULL OR kb.category = ?2)
            ORDER BY kb.created_at DESC, kb.id DESC
            LIMIT ?3
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(like_pattern(query.trim()))
            .bind(category)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn insert(&self, entry: NewKnowledgeEntry) -> Result<i64, RetrievalError> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO knowledge_base (title, content, category, keywords, source, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.title)
        .bind(&entry.content)
        .bind(&entry.category)
        .bind(&entry.keywords)
        .bind(&entry.source)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        tracing::debug!("Inserted knowledge entry {} '{}'", id, entry.title);
        Ok(id)
    }
}

/// Match any term of the query, each quoted so user text is never parsed as syntax
fn match_expression(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Fixed-width UTC timestamps so text order is time order
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn entry_from_row(row: &SqliteRow) -> Result<KnowledgeEntry, RetrievalError> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(KnowledgeEntry {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        category: row.try_get("category")?,
        keywords: row.try_get("keywords")?,
        source: row.try_get("source")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RetrievalError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RetrievalError::Backend(format!("bad timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(title: &str, content: &str, category: &str, keywords: &str) -> NewKnowledgeEntry {
        NewKnowledgeEntry {
            title: title.into(),
            content: content.into(),
            category: Some(category.into()),
            keywords: Some(keywords.into()),
            source: Some("handbook".into()),
        }
    }

    async fn seeded() -> SqliteKnowledgeBase {
        let kb = SqliteKnowledgeBase::new_in_memory().await.unwrap();
        kb.insert(new_entry(
            "Loyalty in marriage",
            "Loyalty is the foundation of a lasting marriage.",
            "married",
            "loyalty,trust",
        ))
        .await
        .unwrap();
        kb.insert(new_entry(
            "婚姻中的忠诚",
            "忠诚是婚姻的基石,需要双方共同维护。",
            "married",
            "忠诚,信任",
        ))
        .await
        .unwrap();
        kb.insert(new_entry(
            "Loyalty while dating",
            "Early loyalty builds trust between partners.",
            "dating",
            "loyalty",
        ))
        .await
        .unwrap();
        kb
    }

    #[tokio::test]
    async fn test_full_text_search_with_category() {
        let kb = seeded().await;
        assert_eq!(kb.entries().await.unwrap().len(), 3);
        assert!(kb.has_full_text());

        let married = kb
            .full_text_search("loyalty", Some("married"), 5)
            .await
            .unwrap();
        assert_eq!(married.len(), 1);
        assert_eq!(married[0].title, "Loyalty in marriage");

        let any = kb.full_text_search("loyalty", None, 5).await.unwrap();
        assert_eq!(any.len(), 2);
    }

    #[tokio::test]
    async fn test_full_text_matches_any_term_ranked() {
        let kb = seeded().await;

        let hits = kb
            .full_text_search("marriage loyalty", Some("married"), 3)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Loyalty in marriage");

        // Both terms outrank one term
        let ranked = kb.full_text_search("trust marriage", None, 3).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].title, "Loyalty in marriage");
        assert_eq!(ranked[1].title, "Loyalty while dating");
    }

    #[test]
    fn test_match_expression() {
        assert_eq!(match_expression("  marriage  loyalty "), "\"marriage\" OR \"loyalty\"");
        assert_eq!(match_expression("say \"hi\""), "\"say\" OR \"\"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn test_timestamps_are_fixed_width() {
        let kb = seeded().await;
        let widths: Vec<(i64,)> = sqlx::query_as("SELECT DISTINCT length(created_at) FROM knowledge_base")
            .fetch_all(&kb.pool)
            .await
            .unwrap();
        assert_eq!(widths, vec![(27,)]);
        assert_eq!(timestamp(DateTime::UNIX_EPOCH), "1970-01-01T00:00:00.000000Z");
    }

    #[tokio::test]
    async fn test_full_text_query_syntax_is_quoted() {
        let kb = seeded().await;
        let result = kb.full_text_search("loyalty\" OR (", None, 5).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_contains_search_matches_substrings_newest_first() {
        let kb = seeded().await;

        let hits = kb.contains_search("忠诚", Some("married"), 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "婚姻中的忠诚");

        let loyalty = kb.contains_search("oyal", None, 5).await.unwrap();
        assert_eq!(loyalty.len(), 2);
        assert!(loyalty[0].id > loyalty[1].id);

        let limited = kb.contains_search("oyal", None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_contains_escapes_wildcards() {
        let kb = seeded().await;
        assert!(kb.contains_search("%", None, 5).await.unwrap().is_empty());
        assert!(kb.contains_search("_", None, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entries_in_insert_order() {
        let kb = seeded().await;
        let titles: Vec<String> = kb.entries().await.unwrap().into_iter().map(|e| e.title).collect();
        assert_eq!(titles, vec!["Loyalty in marriage", "婚姻中的忠诚", "Loyalty while dating"]);
    }

    #[tokio::test]
    async fn test_zero_limit_returns_nothing() {
        let kb = seeded().await;
        assert!(kb.full_text_search("loyalty", None, 0).await.unwrap().is_empty());
        assert!(kb.contains_search("loyalty", None, 0).await.unwrap().is_empty());
    }

    #[test]
    fn test_entry_into_document() {
        let now = Utc::now();
        let doc = KnowledgeEntry {
            id: 7,
            title: "Title".into(),
            content: "Body".into(),
            category: Some("married".into()),
            keywords: Some("k".into()),
            source: Some("book".into()),
            created_at: now,
            updated_at: now,
        }
        .into_document();

        assert_eq!(doc.content, "# Title\n\nBody\n\nSource: book");
        assert_eq!(doc.metadata.source, DocumentSource::Relational);
        assert_eq!(doc.metadata.id, "7");
        assert_eq!(doc.metadata.score, None);
    }

    #[test]
    fn test_like_pattern_escaping() {
        assert_eq!(like_pattern("a%b_c\\"), "%a\\%b\\_c\\\\%");
    }
}
