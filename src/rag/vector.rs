//! Vector similarity search

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{DocumentMetadata, DocumentSource, RetrievalError, RetrievedDocument};

/// Computes embeddings for text
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSearchRequest {
    pub query: String,
    /// Only documents with this category match
    pub category: Option<String>,
    pub top_k: usize,
    /// Minimum similarity in [0, 1]
    pub threshold: f32,
}

/// A vector search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub id: String,
    pub content: String,
    pub category: Option<String>,
    pub score: f32,
}

impl From<ScoredDocument> for RetrievedDocument {
    fn from(doc: ScoredDocument) -> Self {
        RetrievedDocument {
            content: doc.content,
            metadata: DocumentMetadata {
                source: DocumentSource::Vector,
                id: doc.id,
                category: doc.category,
                score: Some(doc.score),
                title: None,
                keywords: None,
            },
        }
    }
}

/// Similarity search over embedded documents
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Hits at or above the threshold, best first, at most `top_k`
    async fn similarity_search(
        &self,
        request: &VectorSearchRequest,
    ) -> Result<Vec<ScoredDocument>, RetrievalError>;
}

/// A document to load into a vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
}

struct Embedded {
    document: VectorDocument,
    embedding: Vec<f32>,
}

/// Brute-force cosine store held in process memory
pub struct InMemoryVectorStore {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<Vec<Embedded>>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Embed and store documents, returning how many were added
    pub async fn add_documents(&self, documents: Vec<VectorDocument>) -> Result<usize, RetrievalError> {
        let mut embedded = Vec::with_capacity(documents.len());
        for document in documents {
            let embedding = self.embedder.embed(&document.content).await?;
            embedded.push(Embedded {
                document,
                embedding,
            });
        }

        let added = embedded.len();
        self.entries.write().await.extend(embedded);
        tracing::info!("Added {} documents to vector store", added);
        Ok(added)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn similarity_search(
        &self,
        request: &VectorSearchRequest,
    ) -> Result<Vec<ScoredDocument>, RetrievalError> {
        if request.top_k == 0 {
            return Ok(Vec::new());
        }

        let query = self.embedder.embed(&request.query).await?;
        let entries = self.entries.read().await;

        let mut hits: Vec<ScoredDocument> = entries
            .iter()
            .filter(|e| match request.category {
                Some(ref category) => e.document.category.as_deref() == Some(category.as_str()),
                None => true,
            })
            .map(|e| (e, cosine_similarity(&query, &e.embedding)))
            .filter(|(_, score)| *score >= request.threshold)
            .map(|(e, score)| ScoredDocument {
                id: e.document.id.clone(),
                content: e.document.content.clone(),
                category: e.document.category.clone(),
                score,
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(request.top_k);
        Ok(hits)
    }
}

/// Cosine similarity; 0 for mismatched or zero-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Maps known words onto fixed axes
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
            let axis = |word: &str| if text.contains(word) { 1.0 } else { 0.0 };
            Ok(vec![axis("忠诚"), axis("沟通"), axis("家庭"), 0.1])
        }
    }

    fn doc(id: &str, content: &str, category: &str) -> VectorDocument {
        VectorDocument {
            id: id.into(),
            content: content.into(),
            category: Some(category.into()),
        }
    }

    async fn store() -> InMemoryVectorStore {
        let store = InMemoryVectorStore::new(Arc::new(KeywordEmbedder));
        let added = store
            .add_documents(vec![
                doc("m1", "婚姻中的忠诚", "married"),
                doc("m2", "家庭责任与忠诚", "married"),
                doc("d1", "恋爱中的沟通", "dating"),
                doc("d2", "恋爱中的忠诚", "dating"),
            ])
            .await
            .unwrap();
        assert_eq!(added, 4);
        store
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_search_filters_by_category_and_sorts() {
        let store = store().await;

        let hits = store
            .similarity_search(&VectorSearchRequest {
                query: "忠诚".into(),
                category: Some("married".into()),
                top_k: 5,
                threshold: 0.5,
            })
            .await
            .unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_search_respects_threshold_and_top_k() {
        let store = store().await;

        let strict = store
            .similarity_search(&VectorSearchRequest {
                query: "忠诚".into(),
                category: None,
                top_k: 10,
                threshold: 0.99,
            })
            .await
            .unwrap();
        assert_eq!(strict.len(), 2);

        let capped = store
            .similarity_search(&VectorSearchRequest {
                query: "忠诚".into(),
                category: None,
                top_k: 1,
                threshold: 0.0,
            })
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_scored_document_conversion() {
        let retrieved: RetrievedDocument = ScoredDocument {
            id: "v1".into(),
            content: "text".into(),
            category: Some("married".into()),
            score: 0.8,
        }
        .into();
        assert_eq!(retrieved.metadata.source, DocumentSource::Vector);
        assert_eq!(retrieved.metadata.score, Some(0.8));
    }
}
