//! Application configuration

pub mod prompts;
pub mod settings;

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use prompts::{PromptError, PromptTemplate};
pub use settings::{
    ConfigError, EmbeddingSettings, GuardSettings, LlmSettings, LoggingSettings, MemorySettings,
    PromptSettings, RagSettings, Settings,
};

/// Process-level configuration taken from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub openai_api_key: Option<String>,
    pub ollama_url: Option<String>,
    /// Path of the TOML settings file, if any
    pub settings_path: Option<PathBuf>,
    /// Root for databases and file-backed memory
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            ollama_url: env::var("OLLAMA_URL").ok(),
            settings_path: env::var("AMITY_CONFIG").ok().map(PathBuf::from),
            data_dir: env::var("AMITY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
        })
    }

    /// Load the settings file named by `AMITY_CONFIG`, or defaults
    pub fn load_settings(&self) -> Result<Settings, ConfigError> {
        let settings = match self.settings_path {
            Some(ref path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            openai_api_key: None,
            ollama_url: None,
            settings_path: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}
