//! Ordered advisor execution around a model call
//!
//! The chain is sorted once when built. Every execution walks the same state
//! machine:
//!
//! ```text
//! Idle -> BeforePhase -> Invoking -> AfterPhase -> Completed
//!              |             |
//!              +--> Aborted <+
//! ```

use futures::StreamExt;
use std::sync::Arc;
use uuid::Uuid;

use super::{Advisor, AdvisorError, FinishStatus, PipelineRequest, PipelineResponse};
use crate::providers::{ChatModel, ProviderError, TextStream};

/// Errors that end an execution
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Rejected by {advisor}: {source}")]
    Rejected {
        advisor: String,
        #[source]
        source: AdvisorError,
    },

    #[error("Model invocation failed: {0}")]
    Model(#[from] ProviderError),
}

/// Execution state of a single chain run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Idle,
    BeforePhase,
    Invoking,
    AfterPhase,
    Completed,
    Aborted,
}

impl ChainState {
    pub fn can_transition_to(self, next: ChainState) -> bool {
        use ChainState::*;
        matches!(
            (self, next),
            (Idle, BeforePhase)
                | (BeforePhase, Invoking)
                | (BeforePhase, Aborted)
                | (Invoking, AfterPhase)
                | (Invoking, Aborted)
                | (AfterPhase, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChainState::Completed | ChainState::Aborted)
    }
}

/// Bookkeeping for one run
struct Execution {
    id: Uuid,
    state: ChainState,
}

impl Execution {
    fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ChainState::Idle,
        }
    }

    fn advance(&mut self, next: ChainState) {
        if !self.state.can_transition_to(next) {
            tracing::error!(
                execution = %self.id,
                "Illegal chain transition {:?} -> {:?}",
                self.state,
                next
            );
            return;
        }
        tracing::trace!(execution = %self.id, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!(execution = %self.id, "Execution cancelled in {:?}", self.state);
        }
    }
}

/// A request that passed every before-phase advisor and waits for the model
///
/// Callers may still enrich the request, e.g. with retrieved context, before
/// handing it to [`AdvisorChain::invoke`] or [`AdvisorChain::invoke_stream`].
pub struct PreparedRequest {
    execution: Execution,
    request: PipelineRequest,
}

impl PreparedRequest {
    pub fn request(&self) -> &PipelineRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut PipelineRequest {
        &mut self.request
    }
}

/// Builder that collects advisors in registration order
pub struct AdvisorChainBuilder {
    advisors: Vec<Arc<dyn Advisor>>,
    model: Arc<dyn ChatModel>,
}

impl AdvisorChainBuilder {
    pub fn advisor<A: Advisor + 'static>(self, advisor: A) -> Self {
        self.advisor_arc(Arc::new(advisor))
    }

    pub fn advisor_arc(mut self, advisor: Arc<dyn Advisor>) -> Self {
        self.advisors.push(advisor);
        self
    }

    /// Sort by priority; the sort is stable so ties keep registration order
    pub fn build(mut self) -> AdvisorChain {
        self.advisors.sort_by_key(|a| a.priority());

        for advisor in &self.advisors {
            tracing::debug!(
                "Registered advisor {} (priority {}, {:?})",
                advisor.name(),
                advisor.priority(),
                advisor.capability()
            );
        }

        AdvisorChain {
            advisors: self.advisors.into(),
            model: self.model,
        }
    }
}

/// Immutable, pre-sorted advisor chain shared across requests
pub struct AdvisorChain {
    advisors: Arc<[Arc<dyn Advisor>]>,
    model: Arc<dyn ChatModel>,
}

impl AdvisorChain {
    pub fn builder(model: Arc<dyn ChatModel>) -> AdvisorChainBuilder {
        AdvisorChainBuilder {
            advisors: Vec::new(),
            model,
        }
    }

    /// Advisor names in execution order
    pub fn names(&self) -> Vec<String> {
        self.advisors.iter().map(|a| a.name().to_string()).collect()
    }

    /// Run the chain for a unary completion
    pub async fn execute(
        &self,
        request: PipelineRequest,
    ) -> Result<PipelineResponse, PipelineError> {
        let prepared = self.prepare(request).await?;
        self.invoke(prepared).await
    }

    /// Run the chain for a streaming completion
    pub async fn execute_stream(&self, request: PipelineRequest) -> Result<TextStream, PipelineError> {
        let prepared = self.prepare(request).await?;
        self.invoke_stream(prepared).await
    }

    /// Run the before-phase only
    ///
    /// A rejection ends the execution here; nothing downstream has run.
    pub async fn prepare(&self, mut request: PipelineRequest) -> Result<PreparedRequest, PipelineError> {
        let mut execution = Execution::start();
        execution.advance(ChainState::BeforePhase);

        for advisor in self.advisors.iter().filter(|a| a.capability().transforms()) {
            match advisor.before(request).await {
                Ok(next) => request = next,
                Err(source) => {
                    execution.advance(ChainState::Aborted);
                    tracing::warn!(
                        execution = %execution.id,
                        "Advisor {} rejected request: {}",
                        advisor.name(),
                        source
                    );
                    return Err(PipelineError::Rejected {
                        advisor: advisor.name().to_string(),
                        source,
                    });
                }
            }
        }

        Ok(PreparedRequest { execution, request })
    }

    /// Invoke the model for a prepared request, then run the observers
    pub async fn invoke(&self, prepared: PreparedRequest) -> Result<PipelineResponse, PipelineError> {
        let PreparedRequest {
            mut execution,
            request,
        } = prepared;

        execution.advance(ChainState::Invoking);
        let output = match self.model.invoke(&request.to_messages()).await {
            Ok(output) => output,
            Err(e) => {
                execution.advance(ChainState::Aborted);
                tracing::error!(execution = %execution.id, "Model {} failed: {}", self.model.name(), e);
                return Err(e.into());
            }
        };

        execution.advance(ChainState::AfterPhase);
        let response = PipelineResponse::completed(output.text, output.raw);
        observe(&self.advisors, &request, &response).await;
        execution.advance(ChainState::Completed);

        Ok(response)
    }

    /// Open the model stream for a prepared request
    ///
    /// Observers run once, after the last chunk or on the first error. If the
    /// returned stream is dropped early they never run.
    pub async fn invoke_stream(&self, prepared: PreparedRequest) -> Result<TextStream, PipelineError> {
        let PreparedRequest {
            mut execution,
            request,
        } = prepared;

        execution.advance(ChainState::Invoking);
        let mut chunks = match self.model.invoke_stream(&request.to_messages()).await {
            Ok(stream) => stream,
            Err(e) => {
                execution.advance(ChainState::Aborted);
                tracing::error!(execution = %execution.id, "Model {} failed to stream: {}", self.model.name(), e);
                return Err(e.into());
            }
        };

        let advisors = Arc::clone(&self.advisors);

        Ok(Box::pin(async_stream::stream! {
            let mut aggregated = String::new();

            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(text) => {
                        aggregated.push_str(&text);
                        yield Ok(text);
                    }
                    Err(e) => {
                        tracing::warn!(execution = %execution.id, "Stream failed after {} chars: {}", aggregated.chars().count(), e);
                        execution.advance(ChainState::AfterPhase);
                        let response = PipelineResponse {
                            output_text: std::mem::take(&mut aggregated),
                            raw: serde_json::Value::Null,
                            finish: FinishStatus::Errored,
                        };
                        observe(&advisors, &request, &response).await;
                        execution.advance(ChainState::Completed);
                        yield Err(e);
                        return;
                    }
                }
            }

            execution.advance(ChainState::AfterPhase);
            let response = PipelineResponse {
                output_text: aggregated,
                raw: serde_json::Value::Null,
                finish: FinishStatus::Completed,
            };
            observe(&advisors, &request, &response).await;
            execution.advance(ChainState::Completed);
        }))
    }
}

/// Run every observing advisor; failures are logged only
async fn observe(
    advisors: &[Arc<dyn Advisor>],
    request: &PipelineRequest,
    response: &PipelineResponse,
) {
    for advisor in advisors.iter().filter(|a| a.capability().observes()) {
        if let Err(e) = advisor.after(request, response).await {
            tracing::warn!("Advisor {} failed in after-phase: {}", advisor.name(), e);
        }
    }
}
