//! Semantic index over memory text.
//!
//! [`SemanticIndex`] is what the write coordinator and the retrieval engine
//! talk to. [`QdrantIndex`] is the production adapter (dense + sparse named
//! vectors fused with RRF); [`InMemoryIndex`] ranks the same way inside the
//! process and is used for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use memora_embeddings::{cosine_similarity, sparse_embed, EmbeddingService, SparseVector};
use memora_qdrant::{
    org_user_key, HybridParams, HybridPoint, HybridVectors, QdrantService, SearchFilter,
    KEY_AGENT_ID, KEY_INTERACTION_ID, KEY_ORG_ID, KEY_ORG_USER_ID, KEY_USER_ID,
};

use crate::Result;

/// One memory as stored in the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub memory_id: String,
    pub org_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub interaction_id: String,
    /// Placeholder-form text, identical to the graph copy.
    pub text: String,
    pub obtained_at: DateTime<Utc>,
}

/// Tenant scope of an index query or bulk delete. All set fields must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFilter {
    pub org_id: String,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub interaction_id: Option<String>,
}

impl IndexFilter {
    pub fn org(org_id: &str) -> Self {
        Self {
            org_id: org_id.to_string(),
            user_id: None,
            agent_id: None,
            interaction_id: None,
        }
    }

    pub fn user(org_id: &str, user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::org(org_id)
        }
    }

    pub fn with_agent(mut self, agent_id: Option<&str>) -> Self {
        self.agent_id = agent_id.map(str::to_string);
        self
    }

    pub fn with_interaction(mut self, interaction_id: &str) -> Self {
        self.interaction_id = Some(interaction_id.to_string());
        self
    }

    fn matches(&self, entry: &IndexEntry) -> bool {
        entry.org_id == self.org_id
            && self.user_id.as_ref().map_or(true, |u| *u == entry.user_id)
            && self.agent_id.as_ref().map_or(true, |a| *a == entry.agent_id)
            && self
                .interaction_id
                .as_ref()
                .map_or(true, |i| *i == entry.interaction_id)
    }

    fn to_search_filter(&self) -> SearchFilter {
        let mut filter = match &self.user_id {
            Some(user_id) => SearchFilter::new().with_org_user(&self.org_id, user_id),
            None => SearchFilter::new().with_org(&self.org_id),
        };
        if let Some(agent_id) = &self.agent_id {
            filter = filter.with_agent(agent_id);
        }
        if let Some(interaction_id) = &self.interaction_id {
            filter = filter.with_interaction(interaction_id);
        }
        filter
    }
}

/// A memory id matched by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub memory_id: String,
    pub score: f32,
}

#[async_trait]
pub trait SemanticIndex: Send + Sync {
    /// Prepare backing storage.
    async fn setup(&self) -> Result<()>;

    /// Insert or replace entries. Idempotent for the same ids.
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()>;

    /// Run every query under one filter. Results are in query order, each
    /// list best match first, all above the minimum score.
    async fn search_batch(
        &self,
        queries: &[String],
        filter: &IndexFilter,
    ) -> Result<Vec<Vec<IndexMatch>>>;

    async fn delete(&self, memory_ids: &[String]) -> Result<()>;

    /// Delete every entry in scope. Returns the number removed.
    async fn delete_by_filter(&self, filter: &IndexFilter) -> Result<usize>;
}

// ============================================================================
// Qdrant
// ============================================================================

/// Hybrid dense + sparse index backed by Qdrant.
pub struct QdrantIndex {
    qdrant: QdrantService,
    embeddings: EmbeddingService,
    params: HybridParams,
}

impl QdrantIndex {
    pub fn new(qdrant: QdrantService, embeddings: EmbeddingService, params: HybridParams) -> Self {
        Self {
            qdrant,
            embeddings,
            params,
        }
    }

    async fn vectors(&self, texts: &[String]) -> Result<Vec<HybridVectors>> {
        let dense = self.embeddings.embed(texts.to_vec()).await?;
        Ok(texts
            .iter()
            .zip(dense)
            .map(|(text, dense)| {
                let sparse = sparse_embed(text);
                HybridVectors {
                    dense,
                    sparse_indices: sparse.indices,
                    sparse_values: sparse.values,
                }
            })
            .collect())
    }
}

fn payload(entry: &IndexEntry) -> HashMap<String, Value> {
    HashMap::from([
        (KEY_ORG_ID.to_string(), json!(entry.org_id)),
        (
            KEY_ORG_USER_ID.to_string(),
            json!(org_user_key(&entry.org_id, &entry.user_id)),
        ),
        (KEY_USER_ID.to_string(), json!(entry.user_id)),
        (KEY_AGENT_ID.to_string(), json!(entry.agent_id)),
        (KEY_INTERACTION_ID.to_string(), json!(entry.interaction_id)),
        ("memory".to_string(), json!(entry.text)),
        ("obtained_at".to_string(), json!(entry.obtained_at.to_rfc3339())),
    ])
}

#[async_trait]
impl SemanticIndex for QdrantIndex {
    async fn setup(&self) -> Result<()> {
        self.qdrant
            .ensure_collection(self.embeddings.dimension())
            .await?;
        info!(collection = %self.qdrant.collection_name(), "Semantic index ready");
        Ok(())
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = entries.iter().map(|e| e.text.clone()).collect();
        let vectors = self.vectors(&texts).await?;

        let points = entries
            .iter()
            .zip(vectors)
            .map(|(entry, vectors)| HybridPoint {
                id: entry.memory_id.clone(),
                vectors,
                payload: payload(entry),
            })
            .collect();

        self.qdrant.upsert_batch(points).await?;
        Ok(())
    }

    async fn search_batch(
        &self,
        queries: &[String],
        filter: &IndexFilter,
    ) -> Result<Vec<Vec<IndexMatch>>> {
        if queries.is_empty() {
            return Ok(vec![]);
        }

        let vectors = self.vectors(queries).await?;
        let results = self
            .qdrant
            .query_hybrid_batch(vectors, Some(filter.to_search_filter()), self.params)
            .await?;

        Ok(results
            .into_iter()
            .map(|hits| {
                hits.into_iter()
                    .map(|hit| IndexMatch {
                        memory_id: hit.id,
                        score: hit.score,
                    })
                    .collect()
            })
            .collect())
    }

    async fn delete(&self, memory_ids: &[String]) -> Result<()> {
        self.qdrant.delete_batch(memory_ids.to_vec()).await?;
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &IndexFilter) -> Result<usize> {
        Ok(self.qdrant.delete_by_filter(filter.to_search_filter()).await?)
    }
}

// ============================================================================
// In-process
// ============================================================================

struct StoredEntry {
    entry: IndexEntry,
    dense: Vec<f32>,
    sparse: SparseVector,
}

/// Index held in process memory. Contents are lost on restart.
///
/// Ranks with the same shape as the Qdrant query: a lexical list and a
/// dense list above the dense threshold, fused by reciprocal rank
/// (`1 / (rank + 1)`, rank starting at 1), then cut at the minimum score.
pub struct InMemoryIndex {
    embeddings: EmbeddingService,
    params: HybridParams,
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl InMemoryIndex {
    pub fn new(embeddings: EmbeddingService, params: HybridParams) -> Self {
        Self {
            embeddings,
            params,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn rank(
        &self,
        query_dense: &[f32],
        query_sparse: &SparseVector,
        candidates: &[&StoredEntry],
    ) -> Vec<IndexMatch> {
        let prefetch = self.params.prefetch_limit as usize;

        let mut lexical: Vec<(&str, f32)> = candidates
            .iter()
            .map(|s| (s.entry.memory_id.as_str(), query_sparse.dot(&s.sparse)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        sort_desc(&mut lexical);
        lexical.truncate(prefetch);

        let mut dense: Vec<(&str, f32)> = candidates
            .iter()
            .map(|s| (s.entry.memory_id.as_str(), cosine_similarity(query_dense, &s.dense)))
            .filter(|(_, score)| *score >= self.params.dense_threshold)
            .collect();
        sort_desc(&mut dense);
        dense.truncate(prefetch);

        let mut fused: HashMap<&str, f32> = HashMap::new();
        for list in [&lexical, &dense] {
            for (rank, (id, _)) in list.iter().enumerate() {
                *fused.entry(*id).or_default() += 1.0 / (rank as f32 + 2.0);
            }
        }

        let mut ranked: Vec<(&str, f32)> = fused
            .into_iter()
            .filter(|(_, score)| *score > self.params.min_score)
            .collect();
        sort_desc(&mut ranked);
        ranked.truncate(self.params.limit as usize);

        ranked
            .into_iter()
            .map(|(id, score)| IndexMatch {
                memory_id: id.to_string(),
                score,
            })
            .collect()
    }
}

fn sort_desc(list: &mut [(&str, f32)]) {
    list.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
}

#[async_trait]
impl SemanticIndex for InMemoryIndex {
    async fn setup(&self) -> Result<()> {
        info!(dimension = self.embeddings.dimension(), "Using in-process semantic index");
        Ok(())
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        let texts: Vec<String> = entries.iter().map(|e| e.text.clone()).collect();
        let dense = self.embeddings.embed(texts).await?;

        let mut stored = self.entries.write().await;
        for (entry, dense) in entries.iter().zip(dense) {
            stored.insert(
                entry.memory_id.clone(),
                StoredEntry {
                    sparse: sparse_embed(&entry.text),
                    entry: entry.clone(),
                    dense,
                },
            );
        }
        debug!(count = entries.len(), total = stored.len(), "Upserted index entries");
        Ok(())
    }

    async fn search_batch(
        &self,
        queries: &[String],
        filter: &IndexFilter,
    ) -> Result<Vec<Vec<IndexMatch>>> {
        let dense = self.embeddings.embed(queries.to_vec()).await?;

        let stored = self.entries.read().await;
        let candidates: Vec<&StoredEntry> =
            stored.values().filter(|s| filter.matches(&s.entry)).collect();

        Ok(queries
            .iter()
            .zip(dense)
            .map(|(query, dense)| self.rank(&dense, &sparse_embed(query), &candidates))
            .collect())
    }

    async fn delete(&self, memory_ids: &[String]) -> Result<()> {
        let mut stored = self.entries.write().await;
        for id in memory_ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &IndexFilter) -> Result<usize> {
        let mut stored = self.entries.write().await;
        let before = stored.len();
        stored.retain(|_, s| !filter.matches(&s.entry));
        Ok(before - stored.len())
    }
}
