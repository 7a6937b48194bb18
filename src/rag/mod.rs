//! Retrieval-augmented generation
//!
//! Retrieval blends two backends: a vector store searched by embedding
//! similarity and a relational knowledge table searched by keyword. A query
//! rewrite step runs first. Failures here are recoverable; callers receive
//! fewer documents and a `degraded` flag rather than an error.

pub mod hybrid;
pub mod knowledge;
pub mod rewrite;
pub mod vector;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::providers::ProviderError;

pub use hybrid::{HybridSearch, SearchOutcome};
pub use knowledge::{KnowledgeBase, KnowledgeEntry, NewKnowledgeEntry, SqliteKnowledgeBase};
pub use rewrite::QueryRewriter;
pub use vector::{
    Embedder, InMemoryVectorStore, ScoredDocument, VectorDocument, VectorSearchRequest,
    VectorStore,
};

/// Which backend produced a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentSource {
    Vector,
    Relational,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub source: DocumentSource,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Similarity score; relational matches carry none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
}

/// A document handed to the prompt assembler; lives for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub content: String,
    pub metadata: DocumentMetadata,
}

/// Errors from retrieval backends
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Search backend error: {0}")]
    Backend(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Search timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the query rewrite step
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("Rewrite model failed: {0}")]
    Model(#[from] ProviderError),

    #[error("Rewrite timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rewrite produced an empty query")]
    Empty,
}
