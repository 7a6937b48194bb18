//! Request/response logging stage

use async_trait::async_trait;

use super::{Advisor, AdvisorError, Capability, FinishStatus, PipelineRequest, PipelineResponse};
use crate::config::LoggingSettings;

/// Logs inbound text and a bounded summary of each answer; priority 1
pub struct LoggerAdvisor {
    settings: LoggingSettings,
}

impl LoggerAdvisor {
    pub fn new(settings: LoggingSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Advisor for LoggerAdvisor {
    fn name(&self) -> &str {
        "LoggerAdvisor"
    }

    fn priority(&self) -> i32 {
        1
    }

    async fn before(&self, request: PipelineRequest) -> Result<PipelineRequest, AdvisorError> {
        tracing::info!(
            conversation = request.context.conversation_id().unwrap_or("-"),
            "AI request: {}",
            request.user_text
        );

        if !request.system_prompt.is_empty() {
            tracing::info!(
                "System prompt: {} chars, preview: {}",
                request.system_prompt.chars().count(),
                truncate_chars(&request.system_prompt, self.settings.preview_chars)
            );
        }

        Ok(request)
    }

    async fn after(
        &self,
        request: &PipelineRequest,
        response: &PipelineResponse,
    ) -> Result<(), AdvisorError> {
        let summary = truncate_chars(&response.output_text, self.settings.summary_chars);

        match response.finish {
            FinishStatus::Completed => tracing::info!(
                conversation = request.context.conversation_id().unwrap_or("-"),
                "AI response: {}",
                summary
            ),
            FinishStatus::Errored => tracing::warn!(
                conversation = request.context.conversation_id().unwrap_or("-"),
                "AI response interrupted: {}",
                summary
            ),
        }

        if self.settings.log_full_response {
            tracing::debug!("Full response: {}", response.output_text);
        }

        Ok(())
    }
}

/// Keep at most `max_chars` characters, marking the cut with `...`
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
