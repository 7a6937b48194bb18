//! Hybrid retrieval: vector search first, relational keyword search to fill
//!
//! 1. Rewrite the query.
//! 2. Vector search (category filter, threshold, `top_k` cap, timeout). A failure
//!    counts as zero hits and marks the outcome degraded.
//! 3. With `top_k` or more vector hits, return them; the relational side is
//!    never queried.
//! 4. Otherwise fill the remaining slots from the knowledge base: full-text
//!    first, substring match when full-text finds nothing.
//!
//! Vector hits always precede relational ones. Results are not de-duplicated
//! across the two sources.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{
    KnowledgeBase, QueryRewriter, RetrievalError, RetrievedDocument, ScoredDocument,
    VectorSearchRequest, VectorStore,
};

pub const DEFAULT_TOP_K: usize = 3;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;

/// Result of one hybrid search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Vector hits by score, then relational hits
    pub documents: Vec<RetrievedDocument>,
    /// The query actually sent to the backends
    pub retrieval_query: String,
    /// True when the vector backend failed or timed out
    pub degraded: bool,
}

pub struct HybridSearch {
    rewriter: QueryRewriter,
    vector: Arc<dyn VectorStore>,
    knowledge: Arc<dyn KnowledgeBase>,
    search_timeout: Duration,
}

impl HybridSearch {
    pub fn new(
        rewriter: QueryRewriter,
        vector: Arc<dyn VectorStore>,
        knowledge: Arc<dyn KnowledgeBase>,
        search_timeout: Duration,
    ) -> Self {
        Self {
            rewriter,
            vector,
            knowledge,
            search_timeout,
        }
    }

    /// Search with the default `top_k` and similarity threshold
    pub async fn search_default(&self, query: &str, category: Option<&str>) -> SearchOutcome {
        self.search(query, category, DEFAULT_TOP_K, DEFAULT_SIMILARITY_THRESHOLD)
            .await
    }

    pub async fn search(
        &self,
        query: &str,
        category: Option<&str>,
        top_k: usize,
        threshold: f32,
    ) -> SearchOutcome {
        if top_k == 0 {
            return SearchOutcome {
                retrieval_query: query.to_string(),
                ..SearchOutcome::default()
            };
        }

        let retrieval_query = self.rewriter.rewrite(query).await;

        let request = VectorSearchRequest {
            query: retrieval_query.clone(),
            category: category.map(str::to_string),
            top_k,
            threshold,
        };

        let (mut hits, degraded) = match self.vector_search(&request).await {
            Ok(hits) => (hits, false),
            Err(e) => {
                tracing::warn!("Vector search failed, falling back to relational search: {}", e);
                (Vec::new(), true)
            }
        };

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(top_k);

        let vector_count = hits.len();
        let mut documents: Vec<RetrievedDocument> = hits.into_iter().map(Into::into).collect();

        if vector_count < top_k {
            let remaining = top_k - vector_count;
            let relational = self
                .relational_search(&retrieval_query, category, remaining)
                .await;
            documents.extend(relational.into_iter().take(remaining));
        }

        tracing::debug!(
            "Hybrid search for '{}' returned {} documents ({} vector, degraded: {})",
            retrieval_query,
            documents.len(),
            vector_count,
            degraded
        );

        SearchOutcome {
            documents,
            retrieval_query,
            degraded,
        }
    }

    async fn vector_search(
        &self,
        request: &VectorSearchRequest,
    ) -> Result<Vec<ScoredDocument>, RetrievalError> {
        tokio::time::timeout(self.search_timeout, self.vector.similarity_search(request))
            .await
            .map_err(|_| RetrievalError::Timeout(self.search_timeout))?
    }

    /// Full-text first, substring match when that finds nothing; errors yield nothing
    async fn relational_search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Vec<RetrievedDocument> {
        match self.knowledge.full_text_search(query, category, limit).await {
            Ok(entries) if !entries.is_empty() => {
                return entries.into_iter().map(|e| e.into_document()).collect();
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Full-text search failed, trying substring match: {}", e),
        }

        match self.knowledge.contains_search(query, category, limit).await {
            Ok(entries) => entries.into_iter().map(|e| e.into_document()).collect(),
            Err(e) => {
                tracing::error!("Relational search failed: {}", e);
                Vec::new()
            }
        }
    }
}
