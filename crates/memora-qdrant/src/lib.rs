//! Qdrant service for hybrid memory search.
//!
//! One collection holds every memory of every tenant. Each point carries a
//! named dense vector (`dense`, cosine) and a named sparse vector (`sparse`,
//! IDF-weighted) and a keyword payload used for tenant scoping. Queries
//! prefetch both vectors and fuse the candidate lists with reciprocal rank
//! fusion on the server.

use std::collections::HashMap;
use std::sync::Arc;

use qdrant_client::qdrant::{
    condition::ConditionOneOf, point_id::PointIdOptions, r#match::MatchValue, Condition,
    CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance,
    FieldCondition, FieldType, Filter, Fusion, Match, Modifier, NamedVectors, PointId,
    PointStruct, PrefetchQueryBuilder, Query, QueryBatchPointsBuilder, QueryPoints,
    QueryPointsBuilder, ScoredPoint, ScrollPointsBuilder, SparseVectorParamsBuilder,
    SparseVectorsConfigBuilder, UpsertPointsBuilder, Value as QdrantValue, Vector,
    VectorInput, VectorParamsBuilder, VectorsConfigBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Error types for the Qdrant service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Vector store error: {0}")]
    VectorStore(String),
}

/// Result type for the Qdrant service.
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the dense vector on every point.
pub const DENSE_VECTOR: &str = "dense";
/// Name of the sparse vector on every point.
pub const SPARSE_VECTOR: &str = "sparse";

/// Point payload key names
pub const KEY_ORG_ID: &str = "org_id";
pub const KEY_ORG_USER_ID: &str = "org_user_id";
pub const KEY_USER_ID: &str = "user_id";
pub const KEY_AGENT_ID: &str = "agent_id";
pub const KEY_INTERACTION_ID: &str = "interaction_id";

/// Page size used when scrolling for filter deletes.
const SCROLL_PAGE: usize = 1000;

/// Configuration for the Qdrant service.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
    pub api_key: Option<String>,
}

impl QdrantConfig {
    pub fn new(url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            collection: collection.into(),
            api_key: None,
        }
    }
}

/// Dense and sparse representation of one text.
#[derive(Debug, Clone, Default)]
pub struct HybridVectors {
    pub dense: Vec<f32>,
    pub sparse_indices: Vec<u32>,
    pub sparse_values: Vec<f32>,
}

/// A point to upsert.
#[derive(Debug, Clone)]
pub struct HybridPoint {
    pub id: String,
    pub vectors: HybridVectors,
    pub payload: HashMap<String, Value>,
}

/// Tuning for a hybrid query.
#[derive(Debug, Clone, Copy)]
pub struct HybridParams {
    /// Candidates fetched from each of the dense and sparse lists.
    pub prefetch_limit: u64,
    /// Minimum dense cosine score for a candidate to enter fusion.
    pub dense_threshold: f32,
    /// Results returned after fusion.
    pub limit: u64,
    /// Fused scores must exceed this.
    pub min_score: f32,
}

impl Default for HybridParams {
    fn default() -> Self {
        Self {
            prefetch_limit: 10,
            dense_threshold: 0.35,
            limit: 10,
            min_score: 0.35,
        }
    }
}

/// Service for vector storage using Qdrant.
#[derive(Clone)]
pub struct QdrantService {
    inner: Arc<QdrantServiceInner>,
}

struct QdrantServiceInner {
    client: Qdrant,
    collection: String,
}

/// Search result from Qdrant
#[derive(Debug, Clone)]
pub struct VectorSearchResult {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, Value>,
}

impl QdrantService {
    /// Connect to Qdrant.
    pub async fn new(config: &QdrantConfig) -> Result<Self> {
        let mut builder = Qdrant::from_url(&config.url);
        if let Some(key) = &config.api_key {
            builder = builder.api_key(key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| Error::VectorStore(format!("Failed to connect to Qdrant: {}", e)))?;

        client
            .list_collections()
            .await
            .map_err(|e| Error::VectorStore(format!("Qdrant connection test failed: {}", e)))?;

        info!(url = %config.url, collection = %config.collection, "Qdrant service connected");

        Ok(Self {
            inner: Arc::new(QdrantServiceInner {
                client,
                collection: config.collection.clone(),
            }),
        })
    }

    pub fn collection_name(&self) -> &str {
        &self.inner.collection
    }

    /// Create the collection and its payload indexes if missing.
    ///
    /// An existing collection with a different dense dimension is an error:
    /// memories are not re-embeddable from the index alone.
    pub async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        let collection = self.collection_name();

        let exists = self
            .inner
            .client
            .collection_exists(collection)
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to check collection: {}", e)))?;

        if exists {
            let existing_dim = self.dense_dimension().await?;
            if existing_dim != dimension {
                return Err(Error::VectorStore(format!(
                    "Collection {} has dense dimension {}, expected {}",
                    collection, existing_dim, dimension
                )));
            }
            debug!(collection = %collection, dimension, "Collection already exists");
        } else {
            let mut vectors = VectorsConfigBuilder::default();
            vectors.add_named_vector_params(
                DENSE_VECTOR,
                VectorParamsBuilder::new(dimension as u64, Distance::Cosine),
            );

            let mut sparse = SparseVectorsConfigBuilder::default();
            sparse.add_named_vector_params(
                SPARSE_VECTOR,
                SparseVectorParamsBuilder::default().modifier(Modifier::Idf),
            );

            self.inner
                .client
                .create_collection(
                    CreateCollectionBuilder::new(collection)
                        .vectors_config(vectors)
                        .sparse_vectors_config(sparse),
                )
                .await
                .map_err(|e| Error::VectorStore(format!("Failed to create collection: {}", e)))?;

            info!(collection = %collection, dimension, "Created Qdrant collection");
        }

        for key in [KEY_ORG_ID, KEY_ORG_USER_ID, KEY_AGENT_ID] {
            self.inner
                .client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    collection,
                    key,
                    FieldType::Keyword,
                ))
                .await
                .map_err(|e| {
                    Error::VectorStore(format!("Failed to index payload field {}: {}", key, e))
                })?;
        }

        Ok(())
    }

    async fn dense_dimension(&self) -> Result<usize> {
        use qdrant_client::qdrant::vectors_config::Config;

        let info = self
            .inner
            .client
            .collection_info(self.collection_name())
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to get collection info: {}", e)))?;

        let dim = info
            .result
            .as_ref()
            .and_then(|r| r.config.as_ref())
            .and_then(|c| c.params.as_ref())
            .and_then(|p| p.vectors_config.as_ref())
            .and_then(|vc| match vc.config.as_ref() {
                Some(Config::ParamsMap(map)) => {
                    map.map.get(DENSE_VECTOR).map(|params| params.size as usize)
                }
                Some(Config::Params(params)) => Some(params.size as usize),
                None => None,
            })
            .unwrap_or(0);

        Ok(dim)
    }

    /// Upsert points. Idempotent for stable ids.
    pub async fn upsert_batch(&self, points: Vec<HybridPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let collection = self.collection_name();

        let qdrant_points: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let payload: HashMap<String, QdrantValue> = point
                    .payload
                    .into_iter()
                    .filter_map(|(k, v)| json_to_qdrant_value(v).map(|qv| (k, qv)))
                    .collect();

                let vectors = NamedVectors::default()
                    .add_vector(DENSE_VECTOR, point.vectors.dense)
                    .add_vector(
                        SPARSE_VECTOR,
                        Vector::new_sparse(point.vectors.sparse_indices, point.vectors.sparse_values),
                    );

                PointStruct::new(point.id, vectors, payload)
            })
            .collect();

        let count = qdrant_points.len();

        self.inner
            .client
            .upsert_points(UpsertPointsBuilder::new(collection, qdrant_points).wait(true))
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to upsert points: {}", e)))?;

        debug!(collection = %collection, count, "Upserted points");

        Ok(())
    }

    /// Run one hybrid query per input in a single batched request.
    ///
    /// Results are returned in input order.
    pub async fn query_hybrid_batch(
        &self,
        queries: Vec<HybridVectors>,
        filter: Option<SearchFilter>,
        params: HybridParams,
    ) -> Result<Vec<Vec<VectorSearchResult>>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let collection = self.collection_name();
        let filter = filter.map(|f| f.to_qdrant_filter());

        let requests: Vec<QueryPoints> = queries
            .into_iter()
            .map(|q| build_hybrid_query(collection, q, filter.clone(), params))
            .collect();
        let count = requests.len();

        let response = self
            .inner
            .client
            .query_batch(QueryBatchPointsBuilder::new(collection, requests))
            .await
            .map_err(|e| Error::VectorStore(format!("Hybrid query failed: {}", e)))?;

        let results: Vec<Vec<VectorSearchResult>> = response
            .result
            .into_iter()
            .map(|batch| {
                batch
                    .result
                    .into_iter()
                    .map(scored_point_to_result)
                    .filter(|r| r.score > params.min_score)
                    .collect()
            })
            .collect();

        if results.len() != count {
            warn!(expected = count, got = results.len(), "Hybrid batch size mismatch");
        }

        debug!(collection = %collection, queries = count, "Hybrid batch query complete");

        Ok(results)
    }

    /// Delete multiple points by ID.
    pub async fn delete_batch(&self, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let collection = self.collection_name();
        let count = ids.len();
        let point_ids: Vec<PointId> = ids.into_iter().map(PointId::from).collect();

        self.inner
            .client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(point_ids)
                    .wait(true),
            )
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to delete points: {}", e)))?;

        debug!(collection = %collection, count, "Deleted points");

        Ok(())
    }

    /// Delete every point matching a filter.
    ///
    /// Scrolls matching ids page by page and deletes them by id.
    pub async fn delete_by_filter(&self, filter: SearchFilter) -> Result<usize> {
        let mut deleted = 0;
        loop {
            let (results, _) = self.scroll(SCROLL_PAGE, None, Some(filter.clone())).await?;
            if results.is_empty() {
                break;
            }
            let page_len = results.len();
            deleted += page_len;
            self.delete_batch(results.into_iter().map(|r| r.id).collect())
                .await?;
            if page_len < SCROLL_PAGE {
                break;
            }
        }
        Ok(deleted)
    }

    /// Number of points currently stored.
    pub async fn points_count(&self) -> Result<u64> {
        let info = self
            .inner
            .client
            .collection_info(self.collection_name())
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to get collection info: {}", e)))?;

        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0))
    }

    /// Scroll through points, optionally filtered.
    pub async fn scroll(
        &self,
        limit: usize,
        offset: Option<String>,
        filter: Option<SearchFilter>,
    ) -> Result<(Vec<VectorSearchResult>, Option<String>)> {
        let mut builder = ScrollPointsBuilder::new(self.collection_name())
            .limit(limit as u32)
            .with_payload(true);

        if let Some(off) = offset {
            builder = builder.offset(PointId::from(off));
        }

        if let Some(f) = filter {
            builder = builder.filter(f.to_qdrant_filter());
        }

        let response = self
            .inner
            .client
            .scroll(builder)
            .await
            .map_err(|e| Error::VectorStore(format!("Scroll failed: {}", e)))?;

        let results = response
            .result
            .into_iter()
            .map(|point| VectorSearchResult {
                id: point_id_to_string(point.id),
                score: 1.0,
                payload: payload_to_json(point.payload),
            })
            .collect();

        let next_offset = response
            .next_page_offset
            .map(|id| point_id_to_string(Some(id)))
            .filter(|id| !id.is_empty());

        Ok((results, next_offset))
    }
}

/// Build a dense + sparse prefetch query fused with RRF.
fn build_hybrid_query(
    collection: &str,
    vectors: HybridVectors,
    filter: Option<Filter>,
    params: HybridParams,
) -> QueryPoints {
    let mut builder = QueryPointsBuilder::new(collection);

    if !vectors.sparse_indices.is_empty() {
        let mut sparse = PrefetchQueryBuilder::default()
            .query(Query::new_nearest(VectorInput::new_sparse(
                vectors.sparse_indices,
                vectors.sparse_values,
            )))
            .using(SPARSE_VECTOR)
            .limit(params.prefetch_limit);
        if let Some(f) = &filter {
            sparse = sparse.filter(f.clone());
        }
        builder = builder.add_prefetch(sparse);
    }

    let mut dense = PrefetchQueryBuilder::default()
        .query(Query::new_nearest(vectors.dense))
        .using(DENSE_VECTOR)
        .score_threshold(params.dense_threshold)
        .limit(params.prefetch_limit);
    if let Some(f) = &filter {
        dense = dense.filter(f.clone());
    }

    builder = builder
        .add_prefetch(dense)
        .query(Query::new_fusion(Fusion::Rrf))
        .limit(params.limit)
        .with_payload(true);

    if let Some(f) = filter {
        builder = builder.filter(f);
    }

    builder.build()
}

/// Search filter for Qdrant queries. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub org_id: Option<String>,
    pub org_user_id: Option<String>,
    pub agent_id: Option<String>,
    pub interaction_id: Option<String>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_org(mut self, org_id: &str) -> Self {
        self.org_id = Some(org_id.to_string());
        self
    }

    /// Restrict to one user; the key is `"{org_id}:{user_id}"`.
    pub fn with_org_user(mut self, org_id: &str, user_id: &str) -> Self {
        self.org_user_id = Some(org_user_key(org_id, user_id));
        self
    }

    pub fn with_agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    pub fn with_interaction(mut self, interaction_id: &str) -> Self {
        self.interaction_id = Some(interaction_id.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.org_id.is_none()
            && self.org_user_id.is_none()
            && self.agent_id.is_none()
            && self.interaction_id.is_none()
    }

    fn to_qdrant_filter(&self) -> Filter {
        let mut conditions = Vec::new();

        if let Some(ref o) = self.org_id {
            conditions.push(make_match_condition(KEY_ORG_ID, o));
        }

        if let Some(ref ou) = self.org_user_id {
            conditions.push(make_match_condition(KEY_ORG_USER_ID, ou));
        }

        if let Some(ref a) = self.agent_id {
            conditions.push(make_match_condition(KEY_AGENT_ID, a));
        }

        if let Some(ref i) = self.interaction_id {
            conditions.push(make_match_condition(KEY_INTERACTION_ID, i));
        }

        Filter {
            must: conditions,
            ..Default::default()
        }
    }
}

/// Payload value for the `org_user_id` key.
pub fn org_user_key(org_id: &str, user_id: &str) -> String {
    format!("{}:{}", org_id, user_id)
}

/// Create a match condition for a field
fn make_match_condition(key: &str, value: &str) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: key.to_string(),
            r#match: Some(Match {
                match_value: Some(MatchValue::Keyword(value.to_string())),
            }),
            ..Default::default()
        })),
    }
}

/// Convert JSON value to Qdrant value
fn json_to_qdrant_value(value: Value) -> Option<QdrantValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(QdrantValue::from(b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(QdrantValue::from(i))
            } else {
                n.as_f64().map(QdrantValue::from)
            }
        }
        Value::String(s) => Some(QdrantValue::from(s)),
        Value::Array(arr) => {
            let values: Vec<QdrantValue> =
                arr.into_iter().filter_map(json_to_qdrant_value).collect();
            if values.is_empty() {
                None
            } else {
                Some(QdrantValue::from(values))
            }
        }
        // Nested objects are stored serialized
        Value::Object(_) => Some(QdrantValue::from(value.to_string())),
    }
}

/// Convert Qdrant value to JSON value
fn qdrant_value_to_json(value: QdrantValue) -> Option<Value> {
    use qdrant_client::qdrant::value::Kind;

    match value.kind {
        Some(Kind::NullValue(_)) => Some(Value::Null),
        Some(Kind::BoolValue(b)) => Some(Value::Bool(b)),
        Some(Kind::IntegerValue(i)) => Some(Value::Number(i.into())),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d).map(Value::Number),
        Some(Kind::StringValue(s)) => Some(Value::String(s)),
        Some(Kind::ListValue(list)) => Some(Value::Array(
            list.values
                .into_iter()
                .filter_map(qdrant_value_to_json)
                .collect(),
        )),
        Some(Kind::StructValue(obj)) => Some(Value::Object(
            obj.fields
                .into_iter()
                .filter_map(|(k, v)| qdrant_value_to_json(v).map(|jv| (k, jv)))
                .collect(),
        )),
        None => None,
    }
}

fn payload_to_json(payload: HashMap<String, QdrantValue>) -> HashMap<String, Value> {
    payload
        .into_iter()
        .filter_map(|(k, v)| qdrant_value_to_json(v).map(|jv| (k, jv)))
        .collect()
}

fn point_id_to_string(id: Option<PointId>) -> String {
    match id.and_then(|id| id.point_id_options) {
        Some(PointIdOptions::Uuid(uuid)) => uuid,
        Some(PointIdOptions::Num(num)) => num.to_string(),
        None => String::new(),
    }
}

/// Convert scored point to search result
fn scored_point_to_result(point: ScoredPoint) -> VectorSearchResult {
    VectorSearchResult {
        id: point_id_to_string(point.id),
        score: point.score,
        payload: payload_to_json(point.payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keyword_of(condition: &Condition) -> (String, String) {
        match &condition.condition_one_of {
            Some(ConditionOneOf::Field(field)) => match &field.r#match {
                Some(Match {
                    match_value: Some(MatchValue::Keyword(k)),
                }) => (field.key.clone(), k.clone()),
                other => panic!("unexpected match {:?}", other),
            },
            other => panic!("unexpected condition {:?}", other),
        }
    }

    #[test]
    fn test_user_scope_filter_uses_compound_key() {
        let filter = SearchFilter::new()
            .with_org_user("org1", "user1")
            .with_agent("agent1")
            .to_qdrant_filter();

        let keys: Vec<(String, String)> = filter.must.iter().map(keyword_of).collect();
        assert_eq!(
            keys,
            vec![
                ("org_user_id".to_string(), "org1:user1".to_string()),
                ("agent_id".to_string(), "agent1".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_filter() {
        assert!(SearchFilter::new().is_empty());
        assert!(SearchFilter::new().to_qdrant_filter().must.is_empty());
        assert!(!SearchFilter::new().with_org("o").is_empty());
    }

    #[test]
    fn test_json_value_round_trip() {
        let original = json!({"org_id": "o", "n": 3, "tags": ["a", "b"]});
        let Value::Object(map) = original.clone() else {
            unreachable!()
        };
        let converted: HashMap<String, QdrantValue> = map
            .into_iter()
            .filter_map(|(k, v)| json_to_qdrant_value(v).map(|qv| (k, qv)))
            .collect();
        let back = payload_to_json(converted);
        assert_eq!(back["org_id"], json!("o"));
        assert_eq!(back["n"], json!(3));
        assert_eq!(back["tags"], json!(["a", "b"]));
    }

    #[test]
    fn test_point_id_strings() {
        assert_eq!(point_id_to_string(Some(PointId::from(7u64))), "7");
        assert_eq!(point_id_to_string(None), "");
    }
}
