//! Common test utilities and helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use serde_json::{json, Value};

use memora_core::db::{self, DbPool};
use memora_core::services::{
    ChatMessage, ChatOptions, EmbeddingConfig, EmbeddingService, GenerationError, HybridParams,
    InMemoryIndex, IndexEntry, IndexFilter, IndexMatch, Memora, MemoraOptions, SemanticIndex,
    TextGenerator,
};
use memora_core::{Error, Result};
use memora_models::{Agent, InteractionWrite, MessageBlock, Organization, User};

// ============================================================================
// Scripted generator
// ============================================================================

/// Replies with queued answers in order and records every prompt.
/// An empty queue answers with a transport error.
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<std::result::Result<String, GenerationError>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: GenerationError) {
        self.replies.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> std::result::Result<String, GenerationError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::Transport("no scripted reply".to_string())))
    }
}

/// Extraction reply with every memory in the first pass.
pub fn extraction_reply(memories: &[(&str, &[i64])]) -> String {
    let pass: Vec<Value> = memories
        .iter()
        .map(|(memory, sources)| json!({ "memory": memory, "msg_source_ids": sources }))
        .collect();
    json!({ "memories_first_pass": pass }).to_string()
}

/// Reconciliation reply. `contrary` items are (memory, pos id, contradicted id).
pub fn reconciliation_reply(new: &[(&str, i64)], contrary: &[(&str, i64, &str)]) -> String {
    json!({
        "new_memories": new
            .iter()
            .map(|(m, pos)| json!({ "memory": m, "source_candidate_pos_id": pos }))
            .collect::<Vec<_>>(),
        "contrary_memories": contrary
            .iter()
            .map(|(m, pos, id)| json!({
                "memory": m,
                "source_candidate_pos_id": pos,
                "contradicted_memory_id": id
            }))
            .collect::<Vec<_>>(),
    })
    .to_string()
}

// ============================================================================
// Index with switchable upsert failures
// ============================================================================

pub struct FlakyIndex {
    inner: InMemoryIndex,
    fail_upserts: AtomicBool,
}

impl FlakyIndex {
    pub fn new() -> Self {
        Self {
            inner: InMemoryIndex::new(embeddings(), HybridParams::default()),
            fail_upserts: AtomicBool::new(false),
        }
    }

    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.inner.len().await
    }
}

#[async_trait]
impl SemanticIndex for FlakyIndex {
    async fn setup(&self) -> Result<()> {
        self.inner.setup().await
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(Error::VectorStore("index unavailable".to_string()));
        }
        self.inner.upsert(entries).await
    }

    async fn search_batch(
        &self,
        queries: &[String],
        filter: &IndexFilter,
    ) -> Result<Vec<Vec<IndexMatch>>> {
        self.inner.search_batch(queries, filter).await
    }

    async fn delete(&self, memory_ids: &[String]) -> Result<()> {
        self.inner.delete(memory_ids).await
    }

    async fn delete_by_filter(&self, filter: &IndexFilter) -> Result<usize> {
        self.inner.delete_by_filter(filter).await
    }
}

// ============================================================================
// Setup
// ============================================================================

pub fn embeddings() -> EmbeddingService {
    EmbeddingService::from_config(&EmbeddingConfig::default()).expect("hash embeddings")
}

pub fn test_options() -> MemoraOptions {
    MemoraOptions {
        max_retries: 1,
        max_retries_cap: 3,
        generation_timeout: Duration::from_secs(5),
        search_across_agents: true,
        recall_filter: true,
        min_score: 0.35,
    }
}

/// Fresh in-memory database with the schema applied.
pub async fn setup_test_db() -> DbPool {
    let pool = db::init_pool(":memory:")
        .await
        .expect("Failed to init pool");
    db::initialize_schema(&pool)
        .await
        .expect("Failed to initialize schema");
    pool
}

/// A service over an in-memory graph and index, with one org, user and agent.
pub struct Harness {
    pub memora: Memora,
    pub generator: Arc<ScriptedGenerator>,
    pub index: Arc<FlakyIndex>,
    pub org: Organization,
    pub user: User,
    pub agent: Agent,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(test_options()).await
    }

    pub async fn with_options(options: MemoraOptions) -> Self {
        let pool = setup_test_db().await;
        let generator = Arc::new(ScriptedGenerator::new());
        let index = Arc::new(FlakyIndex::new());

        let memora = Memora::new(
            pool,
            Some(index.clone() as Arc<dyn SemanticIndex>),
            generator.clone() as Arc<dyn TextGenerator>,
            generator.clone() as Arc<dyn TextGenerator>,
            options,
        );

        let org = memora.create_organization("Acme").await.expect("org");
        let user = memora.create_user(&org.id, "Ava").await.expect("user");
        let agent = memora
            .create_agent(&org.id, "Chef", None)
            .await
            .expect("agent");

        Self {
            memora,
            generator,
            index,
            org,
            user,
            agent,
        }
    }

    pub fn write(&self, messages: Vec<MessageBlock>) -> InteractionWrite {
        write_for(&self.agent.id, messages)
    }
}

pub fn write_for(agent_id: &str, messages: Vec<MessageBlock>) -> InteractionWrite {
    InteractionWrite {
        agent_id: agent_id.to_string(),
        messages,
        interaction_date: None,
        search_across_agents: None,
        extract_agent_memories: false,
    }
}

// ============================================================================
// HTTP helpers
// ============================================================================

/// Extract JSON body from response
pub async fn extract_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

/// Create a GET request
pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Create a POST request with JSON body
pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    json_request("POST", uri, body)
}

/// Create a PUT request with JSON body
pub fn put_json(uri: &str, body: Value) -> Request<Body> {
    json_request("PUT", uri, body)
}

/// Create a DELETE request
pub fn delete_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}
