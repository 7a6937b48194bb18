//! OpenAI-compatible provider
//!
//! Works with any API that implements the OpenAI chat completions format:
//! - OpenAI (api.openai.com)
//! - Groq (api.groq.com)
//! - vLLM, LM Studio, LocalAI and other local servers
//!
//! # Configuration
//!
//! ```toml
//! [llm]
//! provider = "openai"
//! endpoint = "https://api.openai.com/v1"  # optional override
//! api_key_env = "OPENAI_API_KEY"
//! model = "gpt-4o-mini"
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LlmSettings;
use crate::conversation::Message;

use super::{body_lines, ChatModel, ModelOutput, ProviderError, TextStream};

/// OpenAI-compatible chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }
    }
}

/// Chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

/// Chat completion response
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One `data:` event of a streamed completion
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Error response from API
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone)]
pub struct OpenAICompatConfig {
    /// Base URL for the API (e.g., https://api.openai.com/v1)
    pub base_url: String,
    /// API key (optional for local servers)
    pub api_key: Option<String>,
    /// Model to use
    pub model: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAICompatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 120,
        }
    }
}

impl OpenAICompatConfig {
    /// Create config for OpenAI
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Create config for Groq
    pub fn groq(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: Some(api_key.into()),
            model: "llama-3.3-70b-versatile".to_string(),
            timeout_secs: 60,
        }
    }

    /// Create config for a local server (vLLM, LM Studio, etc.)
    pub fn local(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            timeout_secs: 300, // Local inference can be slower
        }
    }

    /// Overlay `[llm]` settings on a preset
    pub fn apply(&mut self, settings: &LlmSettings) {
        if let Some(ref endpoint) = settings.endpoint {
            self.base_url = endpoint.clone();
        }
        if !settings.model.is_empty() {
            self.model = settings.model.clone();
        }
        self.timeout_secs = settings.timeout_secs;
    }
}

/// OpenAI-compatible API provider
pub struct OpenAICompatProvider {
    config: OpenAICompatConfig,
    client: Client,
}

impl OpenAICompatProvider {
    /// Create a new provider with the given configuration
    pub fn new(config: OpenAICompatConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn request(&self, messages: &[Message], stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: messages.iter().map(ChatMessage::from).collect(),
            temperature: Some(0.7),
            max_tokens: Some(4096),
            stream,
        }
    }

    async fn post(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let mut req_builder = self.client.post(&url);

        // Add authorization if API key is provided
        if let Some(ref api_key) = self.config.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req_builder
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await?;
        if let Ok(error_resp) = serde_json::from_str::<ErrorResponse>(&body) {
            return Err(ProviderError::InvalidResponse(format!(
                "API error: {}",
                error_resp.error.message
            )));
        }
        Err(ProviderError::InvalidResponse(format!(
            "HTTP {}: {}",
            status, body
        )))
    }
}

#[async_trait]
impl ChatModel for OpenAICompatProvider {
    fn name(&self) -> String {
        format!("openai-compat/{}", self.config.model)
    }

    async fn invoke(&self, messages: &[Message]) -> Result<ModelOutput, ProviderError> {
        let response = self.post(&self.request(messages, false)).await?;
        let body = response.text().await?;

        let raw: Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {} - Body: {}", e, body))
        })?;
        let completion: ChatCompletionResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".to_string()))?;

        Ok(ModelOutput {
            text: choice.message.content.unwrap_or_default(),
            raw,
        })
    }

    async fn invoke_stream(&self, messages: &[Message]) -> Result<TextStream, ProviderError> {
        let response = self.post(&self.request(messages, true)).await?;
        let mut lines = body_lines(response);

        Ok(Box::pin(async_stream::stream! {
            while let Some(line) = lines.next().await {
                match line.and_then(|line| parse_sse_line(&line)) {
                    Ok(SseEvent::Delta(text)) => yield Ok(text),
                    Ok(SseEvent::Done) => break,
                    Ok(SseEvent::Ignore) => {}
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
enum SseEvent {
    Delta(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> Result<SseEvent, ProviderError> {
    let Some(data) = line.strip_prefix("data:") else {
        // Comments, `event:` and `id:` fields carry no text
        return Ok(SseEvent::Ignore);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|e| ProviderError::Stream(format!("bad event '{}': {}", data, e)))?;

    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();

    if text.is_empty() {
        Ok(SseEvent::Ignore)
    } else {
        Ok(SseEvent::Delta(text))
    }
}
