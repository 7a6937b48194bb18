//! Core turn processing
//!
//! The assembler turns a user message into a pipeline request; the chat
//! engine runs it through the advisor chain and records the result.

mod assembler;
mod chat;
mod report;

pub use assembler::{PromptAssembler, RetrievalParams, TurnInput};
pub use chat::{
    ChatDefaults, ChatEngine, ChatError, ChatRequest, ChatResponse, ChatStream, ReportResponse,
};
pub use report::{Report, ReportError};
