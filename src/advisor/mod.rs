//! Advisor pipeline
//!
//! Advisors are interceptors around a model invocation. Each one has a name, a
//! priority (lower runs first) and a [`Capability`]: it may transform the
//! request before the model runs, observe the final response afterwards, or
//! both. The [`AdvisorChain`] drives them in order for unary and streaming calls.
//!
//! # Example
//!
//! ```ignore
//! use async_trait::async_trait;
//! use crate::advisor::{Advisor, AdvisorError, Capability, PipelineRequest};
//!
//! pub struct TagAdvisor;
//!
//! #[async_trait]
//! impl Advisor for TagAdvisor {
//!     fn name(&self) -> &str { "TagAdvisor" }
//!     fn priority(&self) -> i32 { 50 }
//!     fn capability(&self) -> Capability { Capability::Transform }
//!
//!     async fn before(&self, mut request: PipelineRequest) -> Result<PipelineRequest, AdvisorError> {
//!         request.context.insert("tagged", true);
//!         Ok(request)
//!     }
//! }
//! ```

pub mod chain;
pub mod guard;
pub mod logger;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::conversation::Message;

pub use chain::{AdvisorChain, AdvisorChainBuilder, ChainState, PipelineError, PreparedRequest};
pub use guard::{AuthCheckAdvisor, GuardPolicy};
pub use logger::LoggerAdvisor;

/// Context key: conversation the turn belongs to
pub const CONVERSATION_ID_KEY: &str = "conversationId";
/// Context key: history window length
pub const RETRIEVE_SIZE_KEY: &str = "retrieveSize";
/// Context key: caller identity
pub const USER_ID_KEY: &str = "userId";
/// Context key: caller privilege tier
pub const USER_ROLE_KEY: &str = "userRole";

/// String-keyed values carried alongside a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdvisorContext(BTreeMap<String, Value>);

impl AdvisorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.get_str(CONVERSATION_ID_KEY)
    }

    pub fn retrieve_size(&self) -> Option<usize> {
        self.get(RETRIEVE_SIZE_KEY)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.get_str(USER_ID_KEY)
    }

    pub fn user_role(&self) -> Option<&str> {
        self.get_str(USER_ROLE_KEY)
    }
}

/// Everything handed to the model for one turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub system_prompt: String,
    pub user_text: String,
    /// Recent conversation window, oldest-first
    pub history: Vec<Message>,
    pub context: AdvisorContext,
}

impl PipelineRequest {
    pub fn new(user_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            ..Self::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_context(mut self, context: AdvisorContext) -> Self {
        self.context = context;
        self
    }

    /// Flatten into the message list sent to the model
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if !self.system_prompt.is_empty() {
            messages.push(Message::system(&self.system_prompt));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(Message::user(&self.user_text));
        messages
    }
}

/// How a response ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    /// The model produced its whole answer
    Completed,
    /// A stream failed part-way; the text is what arrived before the error
    Errored,
}

/// The model's answer as seen by observing advisors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub output_text: String,
    /// Provider payload (null for streamed responses)
    #[serde(default)]
    pub raw: Value,
    pub finish: FinishStatus,
}

impl PipelineResponse {
    pub fn completed(output_text: impl Into<String>, raw: Value) -> Self {
        Self {
            output_text: output_text.into(),
            raw,
            finish: FinishStatus::Completed,
        }
    }
}

/// What an advisor takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Before-phase only
    Transform,
    /// After-phase only
    Observe,
    Both,
}

impl Capability {
    pub fn transforms(self) -> bool {
        matches!(self, Capability::Transform | Capability::Both)
    }

    pub fn observes(self) -> bool {
        matches!(self, Capability::Observe | Capability::Both)
    }
}

/// Errors raised by advisors
#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    #[error("Access denied: {0}")]
    Unauthorized(String),

    #[error("Request contains disallowed content")]
    ContentPolicy { term: String },

    #[error("{0}")]
    Failed(String),
}

/// A stage of the pipeline
#[async_trait]
pub trait Advisor: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first; ties keep registration order
    fn priority(&self) -> i32;

    fn capability(&self) -> Capability {
        Capability::Both
    }

    /// Inspect or rewrite the request; an error aborts the whole chain
    async fn before(&self, request: PipelineRequest) -> Result<PipelineRequest, AdvisorError> {
        Ok(request)
    }

    /// Observe the final response; errors are logged and otherwise ignored
    async fn after(
        &self,
        _request: &PipelineRequest,
        _response: &PipelineResponse,
    ) -> Result<(), AdvisorError> {
        Ok(())
    }
}
