//! Persona prompt templates
//!
//! Templates are TOML files whose system prompt may reference `{variable}`
//! placeholders. Placeholders without a value are left as written.
//!
//! # Example Prompt File
//!
//! ```toml
//! [persona]
//! name = "Relationship Advisor"
//! description = "Counsels users on dating and marriage"
//!
//! [system_prompt]
//! content = """
//! You are {advisor_name}, a {profession}. Speak in a {tone} tone.
//! """
//!
//! [defaults]
//! advisor_name = "Amity"
//! tone = "warm and professional"
//! ```

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

const PLACEHOLDER_PATTERN: &str = r"\{([^{}]+)\}";

/// A persona/prompt template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Persona metadata
    pub persona: PersonaInfo,

    /// The system prompt, with placeholders
    pub system_prompt: SystemPrompt,

    /// Values used for placeholders the caller does not supply
    #[serde(default)]
    pub defaults: HashMap<String, String>,
}

/// Persona metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaInfo {
    /// Display name of the persona
    pub name: String,

    /// Brief description
    #[serde(default)]
    pub description: String,
}

/// System prompt content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub content: String,
}

impl PromptTemplate {
    /// Load a template from a TOML file
    pub async fn load_from_file(path: &Path) -> Result<Self, PromptError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| PromptError::IoError(format!("{}: {}", path.display(), e)))?;

        let template: PromptTemplate =
            toml::from_str(&content).map_err(|e| PromptError::ParseError(e.to_string()))?;
        tracing::info!("Loaded prompt template '{}' from {}", template.persona.name, path.display());
        Ok(template)
    }

    /// The template shipped with the binary
    pub fn builtin() -> Self {
        let defaults = builtin::DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            persona: PersonaInfo {
                name: "Relationship Advisor".to_string(),
                description: "Counsels users who are single, dating or married".to_string(),
            },
            system_prompt: SystemPrompt {
                content: builtin::SYSTEM_PROMPT.to_string(),
            },
            defaults,
        }
    }

    /// Substitute placeholders; `variables` take precedence over template defaults
    pub fn render(&self, variables: &HashMap<String, String>) -> Result<String, PromptError> {
        let mut merged = self.defaults.clone();
        merged.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        fill_template(&self.system_prompt.content, &merged)
    }
}

/// Replace every `{name}` that has a value; unknown names are kept verbatim
pub fn fill_template(
    template: &str,
    variables: &HashMap<String, String>,
) -> Result<String, PromptError> {
    let pattern = Regex::new(PLACEHOLDER_PATTERN)?;
    let filled = pattern.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        variables
            .get(name)
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    });
    Ok(filled.into_owned())
}

/// Errors from prompt loading
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Template pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

/// Built-in template that doesn't require files
pub mod builtin {
    pub const SYSTEM_PROMPT: &str = r#"You are {advisor_name}, a {profession} focused on {problem_type}. Introduce yourself at the start of a conversation and let the user know they can share any relationship difficulty with you.

Tailor your questions to the user's situation:
- Single: ask about widening their social circle and the obstacles in approaching someone they like.
- Dating: ask about communication and conflicts caused by different habits.
- Married: ask about family responsibilities and dealing with relatives.

Encourage the user to describe what happened, how the other person reacted and what they themselves think, so your advice fits their case.

The user's name is {user_name} and they work as a {user_profession}. Speak in a {tone} tone and keep each answer under {max_words} words."#;

    pub const DEFAULTS: &[(&str, &str)] = &[
        ("advisor_name", "Amity"),
        ("profession", "relationship psychologist"),
        ("problem_type", "relationship counselling"),
        ("tone", "warm and professional"),
        ("max_words", "300"),
        ("user_name", "friend"),
        ("user_profession", "professional"),
    ];
}
