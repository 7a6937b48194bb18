//! Query rewriting before retrieval

use std::sync::Arc;
use std::time::Duration;

use super::RewriteError;
use crate::conversation::Message;
use crate::providers::ChatModel;

const REWRITE_PROMPT: &str = "Given a user query, rewrite it to provide better results when querying a knowledge base. \
Remove any irrelevant information, and ensure the query is concise and specific. \
Reply with the rewritten query only.\n\n\
Original query:\n{query}\n\n\
Rewritten query:";

/// Rewrites a user query into a retrieval query, falling back to the original
pub struct QueryRewriter {
    model: Option<Arc<dyn ChatModel>>,
    timeout: Duration,
}

impl QueryRewriter {
    pub fn new(model: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self {
            model: Some(model),
            timeout,
        }
    }

    /// A rewriter that always returns the query unchanged
    pub fn disabled() -> Self {
        Self {
            model: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.model.is_some()
    }

    /// Rewrite `query`; any failure yields the original text
    pub async fn rewrite(&self, query: &str) -> String {
        if !self.is_enabled() || query.trim().is_empty() {
            return query.to_string();
        }

        match self.try_rewrite(query).await {
            Ok(rewritten) => {
                tracing::debug!("Rewrote query '{}' -> '{}'", query, rewritten);
                rewritten
            }
            Err(e) => {
                tracing::warn!("Query rewrite failed, using original query: {}", e);
                query.to_string()
            }
        }
    }

    pub async fn try_rewrite(&self, query: &str) -> Result<String, RewriteError> {
        let Some(ref model) = self.model else {
            return Ok(query.to_string());
        };

        let prompt = REWRITE_PROMPT.replace("{query}", query);
        let output = tokio::time::timeout(self.timeout, model.invoke(&[Message::user(prompt)]))
            .await
            .map_err(|_| RewriteError::Timeout(self.timeout))??;

        let rewritten = output.text.trim();
        if rewritten.is_empty() {
            return Err(RewriteError::Empty);
        }
        Ok(rewritten.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ModelOutput, ProviderError, TextStream};
    use crate::testing::MockModel;
    use async_trait::async_trait;

    struct SlowModel;

    #[async_trait]
    impl ChatModel for SlowModel {
        fn name(&self) -> String {
            "slow".into()
        }

        async fn invoke(&self, _messages: &[Message]) -> Result<ModelOutput, ProviderError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ModelOutput::text("too late"))
        }

        async fn invoke_stream(&self, _messages: &[Message]) -> Result<TextStream, ProviderError> {
            Err(ProviderError::Stream("unused".into()))
        }
    }

    #[tokio::test]
    async fn test_rewrite_uses_model_output() {
        let model = Arc::new(MockModel::replying("  marriage loyalty advice \n"));
        let rewriter = QueryRewriter::new(model.clone(), Duration::from_secs(1));

        assert_eq!(rewriter.rewrite("how do I stay loyal?").await, "marriage loyalty advice");
        assert_eq!(model.calls(), 1);
        assert!(model.last_messages()[0].content.contains("how do I stay loyal?"));
    }

    #[tokio::test]
    async fn test_rewrite_falls_back_on_error() {
        let rewriter = QueryRewriter::new(Arc::new(MockModel::failing()), Duration::from_secs(1));
        assert_eq!(rewriter.rewrite("忠诚").await, "忠诚");
    }

    #[tokio::test]
    async fn test_rewrite_falls_back_on_blank_output() {
        let rewriter = QueryRewriter::new(Arc::new(MockModel::replying("   ")), Duration::from_secs(1));
        assert!(matches!(rewriter.try_rewrite("q").await, Err(RewriteError::Empty)));
        assert_eq!(rewriter.rewrite("q").await, "q");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_falls_back_on_timeout() {
        let rewriter = QueryRewriter::new(Arc::new(SlowModel), Duration::from_millis(100));
        assert!(matches!(
            rewriter.try_rewrite("q").await,
            Err(RewriteError::Timeout(_))
        ));
        assert_eq!(rewriter.rewrite("q").await, "q");
    }

    #[tokio::test]
    async fn test_disabled_rewriter_passes_through() {
        let rewriter = QueryRewriter::disabled();
        assert!(!rewriter.is_enabled());
        assert_eq!(rewriter.rewrite("unchanged").await, "unchanged");
    }
}
