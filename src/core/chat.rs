//! Chat engine: one user turn from request to persisted answer
//!
//! The ChatEngine:
//! 1. Resolves the conversation and the caller's identity
//! 2. Assembles the prompt (template, history window)
//! 3. Runs the chain's before-phase, where the guard may reject the turn
//! 4. Retrieves knowledge for the admitted request
//! 5. Invokes the model and runs the observers
//! 6. Appends the user message and the answer to conversation memory
//!
//! Nothing is persisted when the chain rejects the request or the model
//! fails, and a rejected turn never reaches retrieval. A streamed answer is
//! persisted only once the stream completes.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::assembler::{PromptAssembler, TurnInput};
use super::report::{Report, ReportError, REPORT_INSTRUCTION};
use crate::advisor::{AdvisorChain, PipelineError, PipelineResponse};
use crate::config::PromptError;
use crate::conversation::{new_conversation_id, Message};
use crate::memory::{MemoryError, MemoryStore, StoredMessage};
use crate::providers::TextStream;
use crate::rag::{RetrievedDocument, SearchOutcome};

/// Request to the chat engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The user's message
    pub message: String,

    /// Conversation to continue; a new one is started when absent
    #[serde(default)]
    pub conversation_id: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,

    /// Privilege tier checked by the guard
    #[serde(default)]
    pub user_role: Option<String>,

    /// Fills `{user_name}` in the persona template
    #[serde(default)]
    pub user_name: Option<String>,

    /// Fills `{user_profession}` in the persona template
    #[serde(default)]
    pub user_profession: Option<String>,

    /// Knowledge category used to filter retrieval, e.g. "married"
    #[serde(default)]
    pub category: Option<String>,

    /// Override whether retrieval runs for this turn
    #[serde(default)]
    pub rag: Option<bool>,

    /// Override the history window length
    #[serde(default)]
    pub retrieve_size: Option<usize>,
}

/// Response from the chat engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The assistant's response
    pub message: String,

    /// Conversation ID for continuation
    pub conversation_id: String,

    /// Documents used as context
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<RetrievedDocument>,

    /// Retrieval ran without the vector backend
    #[serde(default)]
    pub degraded: bool,
}

/// A structured report and the turn it belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub report: Report,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<RetrievedDocument>,
    #[serde(default)]
    pub degraded: bool,
}

/// A streamed answer and the metadata known before the first chunk
pub struct ChatStream {
    pub conversation_id: String,
    pub sources: Vec<RetrievedDocument>,
    pub degraded: bool,
    pub chunks: BoxStream<'static, Result<String, ChatError>>,
}

/// Errors from the chat engine
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),
}

/// Per-turn defaults taken from settings
#[derive(Debug, Clone, Copy)]
pub struct ChatDefaults {
    pub retrieve_size: usize,
    pub rag_enabled: bool,
}

/// The core chat engine
pub struct ChatEngine {
    assembler: PromptAssembler,
    chain: AdvisorChain,
    memory: Arc<MemoryStore>,
    defaults: ChatDefaults,
}

impl ChatEngine {
    pub fn new(
        assembler: PromptAssembler,
        chain: AdvisorChain,
        memory: Arc<MemoryStore>,
        defaults: ChatDefaults,
    ) -> Self {
        Self {
            assembler,
            chain,
            memory,
            defaults,
        }
    }

    /// Process one turn and return the full answer
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        let input = self.turn_input(request)?;
        let (response, retrieval) = self.run(&input).await?;
        self.record_turn(&input, &response.output_text).await?;

        let (sources, degraded) = split_retrieval(retrieval);
        Ok(ChatResponse {
            message: response.output_text,
            conversation_id: input.conversation_id,
            sources,
            degraded,
        })
    }

    /// Process one turn and parse the answer as a [`Report`]
    ///
    /// A reply that does not parse is an error and is not persisted.
    pub async fn chat_with_report(&self, request: ChatRequest) -> Result<ReportResponse, ChatError> {
        let mut input = self.turn_input(request)?;
        input.instructions = Some(REPORT_INSTRUCTION.to_string());
        let (response, retrieval) = self.run(&input).await?;

        let report = Report::parse(&response.output_text).map_err(|e| {
            tracing::warn!(conversation_id = %input.conversation_id, "Unusable report reply: {}", e);
            e
        })?;
        self.record_turn(&input, &response.output_text).await?;

        tracing::info!(
            conversation_id = %input.conversation_id,
            "Report '{}' with {} suggestions",
            report.title,
            report.suggestions.len()
        );

        let (sources, degraded) = split_retrieval(retrieval);
        Ok(ReportResponse {
            report,
            conversation_id: input.conversation_id,
            sources,
            degraded,
        })
    }

    /// Process one turn as a stream of text chunks
    ///
    /// The turn is appended to memory after the last chunk. A failed append
    /// surfaces as a final error item. Dropping the stream early skips the append.
    pub async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, ChatError> {
        let input = self.turn_input(request)?;
        let (mut chunks, retrieval) = self.run_stream(&input).await?;

        let memory = Arc::clone(&self.memory);
        let id = input.conversation_id.clone();
        let user_text = input.message;

        let stream = async_stream::stream! {
            let mut answer = String::new();

            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(text) => {
                        answer.push_str(&text);
                        yield Ok(text);
                    }
                    Err(e) => {
                        yield Err(ChatError::Pipeline(PipelineError::Model(e)));
                        return;
                    }
                }
            }

            let turn = vec![Message::user(user_text), Message::assistant(answer)];
            if let Err(e) = memory.append(&id, turn).await {
                tracing::error!(conversation_id = %id, "Failed to persist streamed turn: {}", e);
                yield Err(ChatError::Memory(e));
            }
        };

        let (sources, degraded) = split_retrieval(retrieval);
        Ok(ChatStream {
            conversation_id: input.conversation_id,
            sources,
            degraded,
            chunks: Box::pin(stream),
        })
    }

    /// The most recent `limit` messages of a conversation, oldest-first
    pub async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, ChatError> {
        Ok(self.memory.get(conversation_id, limit).await?)
    }

    pub async fn clear(&self, conversation_id: &str) -> Result<(), ChatError> {
        Ok(self.memory.clear(conversation_id).await?)
    }

    pub async fn list_conversations(&self) -> Result<Vec<String>, ChatError> {
        Ok(self.memory.list_conversations().await?)
    }

    /// Run one turn through the chain
    ///
    /// With retrieval the before-phase runs first and only an admitted request
    /// is enriched with retrieved context before the model is invoked.
    async fn run(
        &self,
        input: &TurnInput,
    ) -> Result<(PipelineResponse, Option<SearchOutcome>), ChatError> {
        let request = self.assembler.assemble(input).await?;
        if !self.assembler.retrieves(input) {
            return Ok((self.chain.execute(request).await?, None));
        }

        let mut prepared = self.chain.prepare(request).await?;
        let retrieval = self.assembler.augment(prepared.request_mut(), input).await;
        Ok((self.chain.invoke(prepared).await?, retrieval))
    }

    async fn run_stream(
        &self,
        input: &TurnInput,
    ) -> Result<(TextStream, Option<SearchOutcome>), ChatError> {
        let request = self.assembler.assemble(input).await?;
        if !self.assembler.retrieves(input) {
            return Ok((self.chain.execute_stream(request).await?, None));
        }

        let mut prepared = self.chain.prepare(request).await?;
        let retrieval = self.assembler.augment(prepared.request_mut(), input).await;
        Ok((self.chain.invoke_stream(prepared).await?, retrieval))
    }

    async fn record_turn(&self, input: &TurnInput, answer: &str) -> Result<(), ChatError> {
        self.memory
            .append(
                &input.conversation_id,
                vec![Message::user(input.message.as_str()), Message::assistant(answer)],
            )
            .await?;
        Ok(())
    }

    fn turn_input(&self, request: ChatRequest) -> Result<TurnInput, ChatError> {
        if request.message.trim().is_empty() {
            return Err(ChatError::InvalidRequest("message must not be empty".into()));
        }

        let conversation_id = match request.conversation_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => new_conversation_id(),
        };

        let mut variables = HashMap::new();
        if let Some(name) = request.user_name {
            variables.insert("user_name".to_string(), name);
        }
        if let Some(profession) = request.user_profession {
            variables.insert("user_profession".to_string(), profession);
        }

        Ok(TurnInput {
            conversation_id,
            message: request.message,
            user_id: request.user_id,
            user_role: request.user_role,
            variables,
            retrieve_size: request.retrieve_size.unwrap_or(self.defaults.retrieve_size),
            use_rag: request.rag.unwrap_or(self.defaults.rag_enabled),
            category: request.category,
            instructions: None,
        })
    }
}

fn split_retrieval(retrieval: Option<SearchOutcome>) -> (Vec<RetrievedDocument>, bool) {
    retrieval
        .map(|r| (r.documents, r.degraded))
        .unwrap_or_default()
}
