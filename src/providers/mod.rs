//! AI provider integrations

mod ollama;
mod openai_compat;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::{Config, LlmSettings};
use crate::conversation::Message;

pub use ollama::OllamaProvider;
pub use openai_compat::{OpenAICompatConfig, OpenAICompatProvider};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

/// Incremental text chunks from a streaming completion
pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

/// Result of a unary completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    /// Assistant text
    pub text: String,

    /// Provider payload as returned on the wire
    #[serde(default)]
    pub raw: Value,
}

impl ModelOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            raw: Value::Null,
        }
    }
}

/// The model collaborator wrapped by the advisor chain
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider/model label for logs
    fn name(&self) -> String;

    /// Single-shot completion
    async fn invoke(&self, messages: &[Message]) -> Result<ModelOutput, ProviderError>;

    /// Streaming completion; the returned stream yields text deltas
    async fn invoke_stream(&self, messages: &[Message]) -> Result<TextStream, ProviderError>;
}

pub enum Provider {
    Ollama(OllamaProvider),
    OpenAICompat(OpenAICompatProvider),
}

impl Provider {
    /// Build the provider named in `[llm]`
    pub fn from_settings(settings: &LlmSettings, config: &Config) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .or_else(|| config.openai_api_key.clone());

        match settings.provider.to_lowercase().as_str() {
            "ollama" => {
                let url = settings
                    .endpoint
                    .clone()
                    .or_else(|| config.ollama_url.clone())
                    .unwrap_or_else(|| "http://localhost:11434".into());
                Ok(Provider::Ollama(OllamaProvider::new(
                    url,
                    settings.model.clone(),
                    settings.timeout_secs,
                )?))
            }
            "openai" => {
                let key = api_key.ok_or_else(|| ProviderError::NotConfigured("openai".into()))?;
                let mut compat = OpenAICompatConfig::openai(key);
                compat.apply(settings);
                Ok(Provider::OpenAICompat(OpenAICompatProvider::new(compat)?))
            }
            "groq" => {
                let key = api_key.ok_or_else(|| ProviderError::NotConfigured("groq".into()))?;
                let mut compat = OpenAICompatConfig::groq(key);
                compat.apply(settings);
                Ok(Provider::OpenAICompat(OpenAICompatProvider::new(compat)?))
            }
            "local" => {
                let endpoint = settings
                    .endpoint
                    .clone()
                    .ok_or_else(|| ProviderError::NotConfigured("local endpoint".into()))?;
                let mut compat = OpenAICompatConfig::local(endpoint, settings.model.clone());
                compat.api_key = api_key;
                compat.timeout_secs = settings.timeout_secs;
                Ok(Provider::OpenAICompat(OpenAICompatProvider::new(compat)?))
            }
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }
}

#[async_trait]
impl ChatModel for Provider {
    fn name(&self) -> String {
        match self {
            Provider::Ollama(p) => p.name(),
            Provider::OpenAICompat(p) => p.name(),
        }
    }

    async fn invoke(&self, messages: &[Message]) -> Result<ModelOutput, ProviderError> {
        match self {
            Provider::Ollama(p) => p.invoke(messages).await,
            Provider::OpenAICompat(p) => p.invoke(messages).await,
        }
    }

    async fn invoke_stream(&self, messages: &[Message]) -> Result<TextStream, ProviderError> {
        match self {
            Provider::Ollama(p) => p.invoke_stream(messages).await,
            Provider::OpenAICompat(p) => p.invoke_stream(messages).await,
        }
    }
}

/// Split a streaming HTTP body into trimmed, non-empty lines
pub(crate) fn body_lines(response: reqwest::Response) -> BoxStream<'static, Result<String, ProviderError>> {
    Box::pin(async_stream::stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(e) => {
                    yield Err(ProviderError::from(e));
                    return;
                }
            }
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line).trim().to_string();
                if !line.is_empty() {
                    yield Ok(line);
                }
            }
        }

        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
        if !rest.is_empty() {
            yield Ok(rest);
        }
    })
}
