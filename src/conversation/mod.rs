//! Conversation types shared by the memory store, the assembler and providers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Length in characters, used for prompt budgeting
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Lowercase wire name used by chat-completion APIs
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Upper-case message type stored in the `chat_memory` table
    pub fn message_type(&self) -> &'static str {
        match self {
            Role::System => "SYSTEM",
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
        }
    }

    /// Parse a stored message type; unknown values read back as user messages
    pub fn from_message_type(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "SYSTEM" => Role::System,
            "ASSISTANT" => Role::Assistant,
            _ => Role::User,
        }
    }
}

/// Generate a fresh conversation id for callers that did not supply one
pub fn new_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(Role::from_message_type(role.message_type()), role);
        }
        assert_eq!(Role::from_message_type("tool"), Role::User);
    }

    #[test]
    fn test_char_len_counts_characters() {
        assert_eq!(Message::user("你好").char_len(), 2);
        assert_eq!(Message::user("hi").char_len(), 2);
    }
}
