//! Amity - relationship advice assistant API
//!
//! Every user turn is assembled from a persona template, the recent
//! conversation window and retrieved knowledge, then passed through an
//! ordered advisor chain (guard, logging) around the language model. Answers
//! are persisted to a strictly ordered per-conversation memory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod advisor;
mod config;
mod conversation;
mod core;
mod memory;
mod providers;
mod rag;
mod routes;
#[cfg(test)]
mod testing;

use advisor::{AdvisorChain, AuthCheckAdvisor, GuardPolicy, LoggerAdvisor};
use config::{Config, PromptTemplate, Settings};
use crate::core::{ChatDefaults, ChatEngine, PromptAssembler, RetrievalParams};
use memory::MemoryStore;
use providers::{ChatModel, OllamaProvider, Provider};
use rag::{HybridSearch, InMemoryVectorStore, QueryRewriter, SqliteKnowledgeBase, VectorDocument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub chat_engine: Arc<ChatEngine>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amity=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let settings = config.load_settings()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let memory = Arc::new(MemoryStore::open(&settings.memory.backend_kind(&config.data_dir)?).await?);
    tracing::info!("Conversation memory backend: {}", memory.backend_name());

    let model: Arc<dyn ChatModel> = Arc::new(Provider::from_settings(&settings.llm, &config)?);
    tracing::info!("Using model {}", model.name());

    let template = match settings.prompt.template_path {
        Some(ref path) => PromptTemplate::load_from_file(path).await?,
        None => PromptTemplate::builtin(),
    };

    let mut assembler = PromptAssembler::new(
        template,
        Arc::clone(&memory),
        settings.prompt.max_prompt_chars,
    );
    if settings.rag.enabled {
        let search = build_retrieval(&settings, &config, Arc::clone(&model)).await?;
        assembler = assembler.with_retrieval(
            Arc::new(search),
            RetrievalParams {
                top_k: settings.rag.top_k,
                threshold: settings.rag.similarity_threshold,
            },
        );
    }

    let chain = AdvisorChain::builder(model)
        .advisor(AuthCheckAdvisor::new(Arc::new(GuardPolicy::from(&settings.guard))))
        .advisor(LoggerAdvisor::new(settings.logging.clone()))
        .build();
    tracing::info!("Advisor chain: {}", chain.names().join(" -> "));

    let chat_engine = Arc::new(ChatEngine::new(
        assembler,
        chain,
        memory,
        ChatDefaults {
            retrieve_size: settings.memory.retrieve_size,
            rag_enabled: settings.rag.enabled,
        },
    ));

    let app = Router::new()
        .merge(routes::router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(AppState { chat_engine });

    tracing::info!("Amity API running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Wire the knowledge base, the vector index and the rewriter together
async fn build_retrieval(
    settings: &Settings,
    config: &Config,
    model: Arc<dyn ChatModel>,
) -> anyhow::Result<HybridSearch> {
    let knowledge_path = settings
        .rag
        .knowledge_db
        .clone()
        .unwrap_or_else(|| config.data_dir.join("knowledge.db"));
    let knowledge = Arc::new(SqliteKnowledgeBase::new(&knowledge_path).await?);
    tracing::info!(
        "Knowledge base at {} (full-text search: {})",
        knowledge_path.display(),
        knowledge.has_full_text()
    );

    let ollama_url = config
        .ollama_url
        .clone()
        .unwrap_or_else(|| "http://localhost:11434".into());
    let embedder = OllamaProvider::new(
        ollama_url,
        settings.embedding.model.clone(),
        settings.llm.timeout_secs,
    )?;
    let vector = Arc::new(InMemoryVectorStore::new(Arc::new(embedder)));

    // Index the knowledge base; without embeddings retrieval stays relational
    let documents: Vec<VectorDocument> = knowledge
        .entries()
        .await?
        .into_iter()
        .map(|entry| VectorDocument {
            id: entry.id.to_string(),
            category: entry.category.clone(),
            content: entry.into_document().content,
        })
        .collect();
    if !documents.is_empty() {
        match vector.add_documents(documents).await {
            Ok(count) => tracing::info!("Indexed {} knowledge entries for vector search", count),
            Err(e) => tracing::warn!("Vector indexing failed, retrieval will run degraded: {}", e),
        }
    }

    let rewriter = if settings.rag.rewrite_enabled {
        QueryRewriter::new(model, Duration::from_millis(settings.rag.rewrite_timeout_ms))
    } else {
        QueryRewriter::disabled()
    };

    Ok(HybridSearch::new(
        rewriter,
        vector,
        knowledge,
        Duration::from_millis(settings.rag.search_timeout_ms),
    ))
}
