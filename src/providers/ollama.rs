//! Ollama provider implementation

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::conversation::Message;
use crate::rag::{Embedder, RetrievalError};

use super::{body_lines, ChatModel, ModelOutput, ProviderError, TextStream};

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}

/// One NDJSON line of a streaming `/api/chat` response
#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaProvider {
    pub fn new(base_url: String, model: String, timeout_secs: u64) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            model,
        })
    }

    /// Same server, different model (used for embeddings)
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            model: model.into(),
        }
    }

    fn request(&self, messages: &[Message], stream: bool) -> OllamaRequest {
        OllamaRequest {
            model: self.model.clone(),
            messages: messages
                .iter()
                .map(|m| OllamaMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream,
        }
    }

    async fn post_chat(&self, request: &OllamaRequest) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidResponse(format!(
                "{}: {}",
                status, body
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OllamaProvider {
    fn name(&self) -> String {
        format!("ollama/{}", self.model)
    }

    async fn invoke(&self, messages: &[Message]) -> Result<ModelOutput, ProviderError> {
        let response = self.post_chat(&self.request(messages, false)).await?;
        let raw: Value = response.json().await?;

        let parsed: OllamaResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(ModelOutput {
            text: parsed.message.content,
            raw,
        })
    }

    async fn invoke_stream(&self, messages: &[Message]) -> Result<TextStream, ProviderError> {
        let response = self.post_chat(&self.request(messages, true)).await?;
        let mut lines = body_lines(response);

        Ok(Box::pin(async_stream::stream! {
            while let Some(line) = lines.next().await {
                match line.and_then(|line| parse_stream_line(&line)) {
                    Ok(StreamLine::Text(text)) => yield Ok(text),
                    Ok(StreamLine::Done) => break,
                    Ok(StreamLine::Skip) => {}
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }))
    }
}

#[derive(Debug, PartialEq)]
enum StreamLine {
    Text(String),
    Done,
    Skip,
}

fn parse_stream_line(line: &str) -> Result<StreamLine, ProviderError> {
    let chunk: OllamaStreamChunk = serde_json::from_str(line)
        .map_err(|e| ProviderError::Stream(format!("bad chunk '{}': {}", line, e)))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::Stream(error));
    }

    let text = chunk.message.map(|m| m.content).unwrap_or_default();
    if !text.is_empty() {
        return Ok(StreamLine::Text(text));
    }
    if chunk.done {
        return Ok(StreamLine::Done);
    }
    Ok(StreamLine::Skip)
}

#[async_trait]
impl Embedder for OllamaProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RetrievalError::Embedding(format!(
                "embedding request failed: {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;

        Ok(parsed.embedding)
    }
}
