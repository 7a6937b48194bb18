//! Service settings loaded from a TOML file
//!
//! Every section is optional; a missing file means all defaults.
//!
//! ```toml
//! [llm]
//! provider = "ollama"
//! model = "qwen2.5"
//!
//! [memory]
//! backend = "sqlite"   # "in_memory", "file" or "sqlite"
//! retrieve_size = 10
//!
//! [rag]
//! top_k = 3
//! similarity_threshold = 0.5
//!
//! [guard]
//! banned_words = ["暴力", "色情", "赌博", "违法"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::memory::MemoryBackendKind;

/// Root settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// LLM provider settings
    #[serde(default)]
    pub llm: LlmSettings,

    /// Embedding model used by the vector store
    #[serde(default)]
    pub embedding: EmbeddingSettings,

    /// Conversation memory backend
    #[serde(default)]
    pub memory: MemorySettings,

    /// Retrieval settings
    #[serde(default)]
    pub rag: RagSettings,

    /// Authorization and content policy
    #[serde(default)]
    pub guard: GuardSettings,

    /// Request/response logging
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Prompt template and size limits
    #[serde(default)]
    pub prompt: PromptSettings,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rag.top_k == 0 {
            return Err(ConfigError::Validation("rag.top_k must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.rag.similarity_threshold) {
            return Err(ConfigError::Validation(
                "rag.similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if self.memory.retrieve_size == 0 {
            return Err(ConfigError::Validation(
                "memory.retrieve_size must be at least 1".into(),
            ));
        }
        if self.guard.banned_words.iter().any(|w| w.is_empty()) {
            return Err(ConfigError::Validation(
                "guard.banned_words must not contain empty terms".into(),
            ));
        }
        if self.prompt.max_prompt_chars == 0 {
            return Err(ConfigError::Validation(
                "prompt.max_prompt_chars must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Provider name: "ollama", "openai", "groq", "local"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Custom API endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    /// API key environment variable name (for cloud providers)
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "qwen2.5".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            endpoint: None,
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// Ollama embedding model
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// "in_memory", "file" or "sqlite"
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    /// Directory (file backend) or database file (sqlite backend);
    /// defaults to a location under the data directory
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// History window length injected into each prompt
    #[serde(default = "default_retrieve_size")]
    pub retrieve_size: usize,
}

fn default_memory_backend() -> String {
    "sqlite".to_string()
}

fn default_retrieve_size() -> usize {
    10
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            path: None,
            retrieve_size: default_retrieve_size(),
        }
    }
}

impl MemorySettings {
    /// Resolve the configured backend against the data directory
    pub fn backend_kind(&self, data_dir: &Path) -> Result<MemoryBackendKind, ConfigError> {
        match self.backend.to_lowercase().as_str() {
            "in_memory" | "memory" => Ok(MemoryBackendKind::InMemory),
            "file" => Ok(MemoryBackendKind::File(
                self.path.clone().unwrap_or_else(|| data_dir.join("chat-memory")),
            )),
            "sqlite" => Ok(MemoryBackendKind::Sqlite(
                self.path.clone().unwrap_or_else(|| data_dir.join("amity.db")),
            )),
            other => Err(ConfigError::Validation(format!(
                "unknown memory backend '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSettings {
    /// Whether turns are enriched with retrieved documents by default
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Category used when the request names none
    #[serde(default)]
    pub default_category: Option<String>,

    /// Rewrite queries before retrieval
    #[serde(default = "default_true")]
    pub rewrite_enabled: bool,

    #[serde(default = "default_rewrite_timeout_ms")]
    pub rewrite_timeout_ms: u64,

    /// Bound on each backend search
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,

    /// Knowledge base database; defaults to the memory database file
    #[serde(default)]
    pub knowledge_db: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_top_k() -> usize {
    3
}

fn default_similarity_threshold() -> f32 {
    0.5
}

fn default_rewrite_timeout_ms() -> u64 {
    5_000
}

fn default_search_timeout_ms() -> u64 {
    3_000
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            default_category: None,
            rewrite_enabled: true,
            rewrite_timeout_ms: default_rewrite_timeout_ms(),
            search_timeout_ms: default_search_timeout_ms(),
            knowledge_db: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardSettings {
    /// Role that is never allowed through
    #[serde(default = "default_lowest_role")]
    pub lowest_role: String,

    /// User ids that pass authorization regardless of role
    #[serde(default)]
    pub allowed_users: Vec<String>,

    /// User ids that are always rejected unless allow-listed
    #[serde(default)]
    pub blocked_users: Vec<String>,

    /// Terms rejected by case-sensitive substring match
    #[serde(default = "default_banned_words")]
    pub banned_words: Vec<String>,
}

fn default_lowest_role() -> String {
    "GUEST".to_string()
}

fn default_banned_words() -> Vec<String> {
    ["暴力", "色情", "赌博", "违法"]
        .iter()
        .map(|w| w.to_string())
        .collect()
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            lowest_role: default_lowest_role(),
            allowed_users: vec![],
            blocked_users: vec![],
            banned_words: default_banned_words(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Characters of the response logged at info level
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,

    /// Characters of the system prompt previewed at info level
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,

    /// Log the full response at debug level
    #[serde(default = "default_true")]
    pub log_full_response: bool,
}

fn default_summary_chars() -> usize {
    100
}

fn default_preview_chars() -> usize {
    200
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            summary_chars: default_summary_chars(),
            preview_chars: default_preview_chars(),
            log_full_response: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSettings {
    /// Persona template file; the built-in template is used when unset
    #[serde(default)]
    pub template_path: Option<PathBuf>,

    /// Upper bound on system prompt + history + user text, in characters
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

fn default_max_prompt_chars() -> usize {
    12_000
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            template_path: None,
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
