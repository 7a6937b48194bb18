//! Builds the per-turn request handed to the advisor chain
//!
//! Assembly runs in two steps. [`PromptAssembler::assemble`] renders the
//! persona template and reads the history window; the chain's before-phase
//! then screens the request. Only an admitted request is passed to
//! [`PromptAssembler::augment`], which runs retrieval and appends the context
//! block.
//!
//! When the prompt would exceed the configured character budget the context
//! block is shortened first, then the oldest history messages are dropped.
//! The template and the user message are never cut.

use std::collections::HashMap;
use std::sync::Arc;

use super::chat::ChatError;
use crate::advisor::{
    AdvisorContext, PipelineRequest, CONVERSATION_ID_KEY, RETRIEVE_SIZE_KEY, USER_ID_KEY,
    USER_ROLE_KEY,
};
use crate::config::PromptTemplate;
use crate::conversation::Message;
use crate::memory::MemoryStore;
use crate::rag::{HybridSearch, SearchOutcome};

const CONTEXT_HEADER: &str = "\n\nContext information is below.\n---------------------\n";
const CONTEXT_FOOTER: &str = "\n---------------------\n\
Use the context above where it helps to answer the user's question. \
If it does not contain the answer, rely on your own expertise and do not mention the context.";

/// Everything the assembler needs to know about one user turn
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub conversation_id: String,
    pub message: String,
    pub user_id: Option<String>,
    pub user_role: Option<String>,
    /// Template variables supplied by the caller
    pub variables: HashMap<String, String>,
    /// History window length
    pub retrieve_size: usize,
    pub use_rag: bool,
    pub category: Option<String>,
    /// Appended to the rendered persona prompt
    pub instructions: Option<String>,
}

/// Retrieval parameters used for every turn
#[derive(Debug, Clone, Copy)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub threshold: f32,
}

pub struct PromptAssembler {
    template: PromptTemplate,
    memory: Arc<MemoryStore>,
    retrieval: Option<(Arc<HybridSearch>, RetrievalParams)>,
    max_prompt_chars: usize,
}

impl PromptAssembler {
    pub fn new(template: PromptTemplate, memory: Arc<MemoryStore>, max_prompt_chars: usize) -> Self {
        Self {
            template,
            memory,
            retrieval: None,
            max_prompt_chars,
        }
    }

    pub fn with_retrieval(mut self, search: Arc<HybridSearch>, params: RetrievalParams) -> Self {
        self.retrieval = Some((search, params));
        self
    }

    /// Whether this turn gets a retrieval step
    pub fn retrieves(&self, input: &TurnInput) -> bool {
        self.retrieval.is_some() && input.use_rag
    }

    /// Render the system prompt and read the history window
    pub async fn assemble(&self, input: &TurnInput) -> Result<PipelineRequest, ChatError> {
        let mut variables = input.variables.clone();
        variables.insert("question".to_string(), input.message.clone());
        let mut system_prompt = self.template.render(&variables)?;
        if let Some(ref instructions) = input.instructions {
            system_prompt.push_str(instructions);
        }

        let history: Vec<Message> = self
            .memory
            .get(&input.conversation_id, input.retrieve_size)
            .await?
            .into_iter()
            .map(Message::from)
            .collect();

        let budget = self.budget_after(&system_prompt, &input.message);
        let (_, history) = fit_to_budget(budget, None, history);

        let mut context = AdvisorContext::new()
            .with(CONVERSATION_ID_KEY, input.conversation_id.as_str())
            .with(RETRIEVE_SIZE_KEY, input.retrieve_size);
        if let Some(ref user_id) = input.user_id {
            context.insert(USER_ID_KEY, user_id.as_str());
        }
        if let Some(ref role) = input.user_role {
            context.insert(USER_ROLE_KEY, role.as_str());
        }

        Ok(PipelineRequest {
            system_prompt,
            user_text: input.message.clone(),
            history,
            context,
        })
    }

    /// Retrieve knowledge for an admitted request and append the context block
    ///
    /// Returns `None` when retrieval is not configured or not wanted for this turn.
    pub async fn augment(
        &self,
        request: &mut PipelineRequest,
        input: &TurnInput,
    ) -> Option<SearchOutcome> {
        let (search, params) = match self.retrieval {
            Some((ref search, params)) if self.retrieves(input) => (search, params),
            _ => return None,
        };

        let outcome = search
            .search(
                &input.message,
                input.category.as_deref(),
                params.top_k,
                params.threshold,
            )
            .await;

        if !outcome.documents.is_empty() {
            let context = outcome
                .documents
                .iter()
                .map(|d| d.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");

            let budget = self.budget_after(&request.system_prompt, &request.user_text);
            let history = std::mem::take(&mut request.history);
            let (context, history) = fit_to_budget(budget, Some(context), history);
            request.history = history;

            if let Some(context) = context {
                request.system_prompt.push_str(CONTEXT_HEADER);
                request.system_prompt.push_str(&context);
                request.system_prompt.push_str(CONTEXT_FOOTER);
            }
        }

        Some(outcome)
    }

    /// Chars left for context and history once the fixed parts are counted
    fn budget_after(&self, system_prompt: &str, user_text: &str) -> usize {
        let fixed = system_prompt.chars().count() + user_text.chars().count();
        self.max_prompt_chars.saturating_sub(fixed)
    }
}

fn context_overhead() -> usize {
    CONTEXT_HEADER.chars().count() + CONTEXT_FOOTER.chars().count()
}

/// Shrink the context block, then drop the oldest history, until both fit in `budget` chars
fn fit_to_budget(
    budget: usize,
    context: Option<String>,
    mut history: Vec<Message>,
) -> (Option<String>, Vec<Message>) {
    let history_chars: usize = history.iter().map(Message::char_len).sum();

    let context = context.and_then(|context| {
        let available = budget.saturating_sub(history_chars + context_overhead());
        let kept: String = context.chars().take(available).collect();
        if kept.chars().count() < context.chars().count() {
            tracing::debug!(
                "Context block truncated to {} of {} chars",
                available,
                context.chars().count()
            );
        }
        (!kept.is_empty()).then_some(kept)
    });

    let context_chars = context
        .as_ref()
        .map(|c| c.chars().count() + context_overhead())
        .unwrap_or(0);
    let history_budget = budget.saturating_sub(context_chars);

    let mut total = history_chars;
    let mut dropped = 0;
    while total > history_budget && dropped < history.len() {
        total -= history[dropped].char_len();
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!("Dropped {} oldest history messages to fit prompt budget", dropped);
        history.drain(..dropped);
    }

    (context, history)
}
