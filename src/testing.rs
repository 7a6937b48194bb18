//! Shared test doubles

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::advisor::{
    Advisor, AdvisorChain, AdvisorError, AuthCheckAdvisor, Capability, FinishStatus, GuardPolicy,
    LoggerAdvisor, PipelineRequest, PipelineResponse,
};
use crate::config::{LoggingSettings, PromptTemplate};
use crate::conversation::Message;
use crate::core::{ChatDefaults, ChatEngine, PromptAssembler, RetrievalParams};
use crate::memory::{MemoryBackend, MemoryError, MemoryStore, StoredMessage};
use crate::providers::{ChatModel, ModelOutput, ProviderError, TextStream};
use crate::rag::{
    HybridSearch, KnowledgeBase, KnowledgeEntry, NewKnowledgeEntry, QueryRewriter,
    RetrievalError, ScoredDocument, VectorSearchRequest, VectorStore,
};

/// Scripted chat model with call counters
pub struct MockModel {
    reply: String,
    chunks: Vec<String>,
    fail: bool,
    fail_stream_after: Option<usize>,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<Message>>,
}

impl MockModel {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            chunks: vec![reply.to_string()],
            fail: false,
            fail_stream_after: None,
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        }
    }

    pub fn streaming(chunks: &[&str]) -> Self {
        Self {
            reply: chunks.concat(),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            ..Self::replying("")
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::replying("")
        }
    }

    /// Yield `n` chunks, then an error
    pub fn failing_stream_after(mut self, n: usize) -> Self {
        self.fail_stream_after = Some(n);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<Message> {
        self.last_messages.lock().unwrap().clone()
    }

    fn record(&self, messages: &[Message]) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages.to_vec();
        if self.fail {
            return Err(ProviderError::InvalidResponse("mock failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatModel for MockModel {
    fn name(&self) -> String {
        "mock".to_string()
    }

    async fn invoke(&self, messages: &[Message]) -> Result<ModelOutput, ProviderError> {
        self.record(messages)?;
        Ok(ModelOutput {
            text: self.reply.clone(),
            raw: serde_json::json!({ "mock": true }),
        })
    }

    async fn invoke_stream(&self, messages: &[Message]) -> Result<TextStream, ProviderError> {
        self.record(messages)?;
        let mut items: Vec<Result<String, ProviderError>> =
            self.chunks.iter().cloned().map(Ok).collect();
        if let Some(n) = self.fail_stream_after {
            items.truncate(n);
            items.push(Err(ProviderError::Stream("mock stream failure".into())));
        }
        Ok(futures::stream::iter(items).boxed())
    }
}

/// Advisor that records each hook it runs into a shared log
pub struct RecordingAdvisor {
    name: String,
    priority: i32,
    capability: Capability,
    log: Arc<Mutex<Vec<String>>>,
    fail_before: bool,
    fail_after: bool,
    suffix: Option<String>,
}

impl RecordingAdvisor {
    pub fn shared_log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    pub fn new(
        name: &str,
        priority: i32,
        capability: Capability,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            priority,
            capability,
            log: Arc::clone(log),
            fail_before: false,
            fail_after: false,
            suffix: None,
        }
    }

    pub fn failing_before(mut self) -> Self {
        self.fail_before = true;
        self
    }

    pub fn failing_after(mut self) -> Self {
        self.fail_after = true;
        self
    }

    /// Append `suffix` to the user text in the before-phase
    pub fn appending(mut self, suffix: &str) -> Self {
        self.suffix = Some(suffix.to_string());
        self
    }
}

#[async_trait]
impl Advisor for RecordingAdvisor {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    async fn before(&self, mut request: PipelineRequest) -> Result<PipelineRequest, AdvisorError> {
        self.log.lock().unwrap().push(format!("before:{}", self.name));
        if self.fail_before {
            return Err(AdvisorError::Unauthorized("recording advisor".into()));
        }
        if let Some(ref suffix) = self.suffix {
            request.user_text.push_str(suffix);
        }
        Ok(request)
    }

    async fn after(
        &self,
        _request: &PipelineRequest,
        response: &PipelineResponse,
    ) -> Result<(), AdvisorError> {
        let marker = match response.finish {
            FinishStatus::Completed => "",
            FinishStatus::Errored => " (errored)",
        };
        self.log
            .lock()
            .unwrap()
            .push(format!("after:{}:{}{}", self.name, response.output_text, marker));
        if self.fail_after {
            return Err(AdvisorError::Failed("recording advisor".into()));
        }
        Ok(())
    }
}

/// Vector store returning fixed documents
pub struct MockVectorStore {
    documents: Vec<ScoredDocument>,
    fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_request: Mutex<Option<VectorSearchRequest>>,
}

impl MockVectorStore {
    pub fn returning(documents: Vec<ScoredDocument>) -> Self {
        Self {
            documents,
            fail: false,
            delay: None,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::returning(Vec::new())
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::returning(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<VectorSearchRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn similarity_search(
        &self,
        request: &VectorSearchRequest,
    ) -> Result<Vec<ScoredDocument>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(RetrievalError::Backend("mock vector outage".into()));
        }
        Ok(self
            .documents
            .iter()
            .take(request.top_k)
            .cloned()
            .collect())
    }
}

/// Knowledge base returning fixed entries per search mode
pub struct MockKnowledgeBase {
    full_text: Vec<KnowledgeEntry>,
    contains: Vec<KnowledgeEntry>,
    full_text_calls: AtomicUsize,
    contains_calls: AtomicUsize,
    limits: Mutex<Vec<usize>>,
}

impl MockKnowledgeBase {
    pub fn new(full_text: Vec<KnowledgeEntry>, contains: Vec<KnowledgeEntry>) -> Self {
        Self {
            full_text,
            contains,
            full_text_calls: AtomicUsize::new(0),
            contains_calls: AtomicUsize::new(0),
            limits: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn full_text_calls(&self) -> usize {
        self.full_text_calls.load(Ordering::SeqCst)
    }

    pub fn contains_calls(&self) -> usize {
        self.contains_calls.load(Ordering::SeqCst)
    }

    /// Limits passed to each search, in call order
    pub fn limits(&self) -> Vec<usize> {
        self.limits.lock().unwrap().clone()
    }
}

#[async_trait]
impl KnowledgeBase for MockKnowledgeBase {
    async fn full_text_search(
        &self,
        _query: &str,
        _category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>, RetrievalError> {
        self.full_text_calls.fetch_add(1, Ordering::SeqCst);
        self.limits.lock().unwrap().push(limit);
        Ok(self.full_text.iter().take(limit).cloned().collect())
    }

    async fn contains_search(
        &self,
        _query: &str,
        _category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>, RetrievalError> {
        self.contains_calls.fetch_add(1, Ordering::SeqCst);
        self.limits.lock().unwrap().push(limit);
        Ok(self.contains.iter().take(limit).cloned().collect())
    }

    async fn insert(&self, _entry: NewKnowledgeEntry) -> Result<i64, RetrievalError> {
        Err(RetrievalError::Backend("read-only mock".into()))
    }
}

pub fn scored(id: &str, content: &str, score: f32) -> ScoredDocument {
    ScoredDocument {
        id: id.to_string(),
        content: content.to_string(),
        category: Some("married".to_string()),
        score,
    }
}

pub fn entry(id: i64, title: &str, content: &str) -> KnowledgeEntry {
    let now = chrono::Utc::now();
    KnowledgeEntry {
        id,
        title: title.to_string(),
        content: content.to_string(),
        category: Some("married".to_string()),
        keywords: None,
        source: None,
        created_at: now,
        updated_at: now,
    }
}

/// Memory backend that reads as empty and refuses every write
pub struct ReadOnlyBackend;

#[async_trait]
impl MemoryBackend for ReadOnlyBackend {
    fn name(&self) -> &'static str {
        "read-only"
    }

    async fn count(&self, _conversation_id: &str) -> Result<u64, MemoryError> {
        Ok(0)
    }

    async fn insert(
        &self,
        _conversation_id: &str,
        _messages: &[StoredMessage],
    ) -> Result<(), MemoryError> {
        Err(MemoryError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only backend",
        )))
    }

    async fn recent(
        &self,
        _conversation_id: &str,
        _limit: usize,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        Ok(Vec::new())
    }

    async fn clear(&self, _conversation_id: &str) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<String>, MemoryError> {
        Ok(Vec::new())
    }
}

/// Chat engine with the guard and logger advisors over the given store
pub fn chat_engine_with(
    model: Arc<MockModel>,
    memory: Arc<MemoryStore>,
    search: Option<Arc<HybridSearch>>,
) -> ChatEngine {
    let mut assembler = PromptAssembler::new(PromptTemplate::builtin(), Arc::clone(&memory), 12_000);
    if let Some(search) = search.clone() {
        assembler = assembler.with_retrieval(
            search,
            RetrievalParams {
                top_k: 3,
                threshold: 0.5,
            },
        );
    }
    let chain = AdvisorChain::builder(model)
        .advisor(AuthCheckAdvisor::new(Arc::new(GuardPolicy::default())))
        .advisor(LoggerAdvisor::new(LoggingSettings::default()))
        .build();
    let defaults = ChatDefaults {
        retrieve_size: 10,
        rag_enabled: search.is_some(),
    };
    ChatEngine::new(assembler, chain, memory, defaults)
}

/// Chat engine over an in-memory store without retrieval
pub fn chat_engine(model: Arc<MockModel>) -> (ChatEngine, Arc<MemoryStore>) {
    let memory = Arc::new(MemoryStore::in_memory());
    (chat_engine_with(model, Arc::clone(&memory), None), memory)
}

/// Retrieval-enabled engine and handles on its backends
pub struct RagEngine {
    pub engine: ChatEngine,
    pub memory: Arc<MemoryStore>,
    pub vector: Arc<MockVectorStore>,
    pub knowledge: Arc<MockKnowledgeBase>,
}

/// Chat engine whose query rewriter shares the chat model, as in production wiring
pub fn rag_chat_engine(
    model: Arc<MockModel>,
    vector: MockVectorStore,
    knowledge: MockKnowledgeBase,
) -> RagEngine {
    let memory = Arc::new(MemoryStore::in_memory());
    let vector = Arc::new(vector);
    let knowledge = Arc::new(knowledge);
    let search = Arc::new(HybridSearch::new(
        QueryRewriter::new(model.clone(), Duration::from_secs(1)),
        vector.clone(),
        knowledge.clone(),
        Duration::from_secs(1),
    ));
    RagEngine {
        engine: chat_engine_with(model, Arc::clone(&memory), Some(search)),
        memory,
        vector,
        knowledge,
    }
}
