//! API routes

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{delete, get, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::advisor::PipelineError;
use crate::core::{ChatError, ChatRequest, ChatResponse, ChatStream, ReportResponse};
use crate::memory::{MemoryError, StoredMessage};
use crate::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ConversationsResponse {
    conversations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

impl ChatError {
    fn status_code(&self) -> StatusCode {
        match self {
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::Pipeline(PipelineError::Rejected { .. }) => StatusCode::FORBIDDEN,
            ChatError::Pipeline(PipelineError::Model(_)) | ChatError::Report(_) => {
                StatusCode::BAD_GATEWAY
            }
            ChatError::Memory(MemoryError::InvalidConversationId(_)) => StatusCode::BAD_REQUEST,
            ChatError::Memory(_) | ChatError::Prompt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ChatError> {
    Ok(Json(state.chat_engine.chat(request).await?))
}

async fn chat_report(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ReportResponse>, ChatError> {
    Ok(Json(state.chat_engine.chat_with_report(request).await?))
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ChatError> {
    let ChatStream {
        conversation_id,
        sources,
        degraded,
        mut chunks,
    } = state.chat_engine.chat_stream(request).await?;

    let meta = json!({
        "conversation_id": conversation_id,
        "sources": sources,
        "degraded": degraded,
    });

    let events = async_stream::stream! {
        yield Ok(Event::default().event("meta").data(meta.to_string()));

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(text) => yield Ok(Event::default().data(text.replace('\r', ""))),
                Err(e) => {
                    tracing::error!("Stream for {} failed: {}", conversation_id, e);
                    yield Ok(Event::default().event("error").data(e.to_string().replace('\r', "")));
                    return;
                }
            }
        }

        yield Ok(Event::default().event("done").data("[DONE]"));
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn list_conversations(
    State(state): State<AppState>,
) -> Result<Json<ConversationsResponse>, ChatError> {
    let conversations = state.chat_engine.list_conversations().await?;
    Ok(Json(ConversationsResponse { conversations }))
}

async fn conversation_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<StoredMessage>>, ChatError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.chat_engine.history(&id, limit).await?))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ChatError> {
    state.chat_engine.clear(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat", post(chat))
        .route("/v1/chat/stream", post(chat_stream))
        .route("/v1/chat/report", post(chat_report))
        .route("/v1/conversations", get(list_conversations))
        .route("/v1/conversations/:id", delete(delete_conversation))
        .route("/v1/conversations/:id/messages", get(conversation_messages))
}
