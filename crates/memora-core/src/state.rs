//! Application state for Memora.
//!
//! Contains the shared state that is passed to all handlers.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Config, IndexBackend};
use crate::db::DbPool;
use crate::services::{
    EmbeddingService, HybridParams, InMemoryIndex, LlmService, Memora, MemoraOptions,
    QdrantConfig, QdrantIndex, QdrantService, SemanticIndex, TextGenerator,
};
use crate::{config, Result};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Relationship graph connection pool.
    pub db: DbPool,
    /// Memory pipeline facade.
    pub memora: Memora,
    /// Model clients by role, for health reporting.
    pub llm: Vec<(&'static str, LlmService)>,
}

impl AppState {
    /// Create a new application state from the global configuration.
    pub async fn new() -> Result<Self> {
        Self::from_config(config::config()).await
    }

    /// Create application state, initializing every service.
    pub async fn from_config(config: &Config) -> Result<Self> {
        // Initialize database
        let db = crate::db::init_pool(&config.database.path).await?;

        // Initialize database schema
        crate::db::initialize_schema(&db).await?;

        let index = build_index(config).await?;

        if config.llm.extraction.providers.is_empty() {
            warn!("No extraction LLM provider configured; saves will fail");
        }
        if config.llm.search.providers.is_empty() {
            warn!("No search LLM provider configured; recall will fail");
        }
        let extraction_llm = LlmService::new(&config.llm.extraction);
        let search_llm = LlmService::new(&config.llm.search);

        let memora = Memora::new(
            db.clone(),
            index,
            Arc::new(extraction_llm.clone()) as Arc<dyn TextGenerator>,
            Arc::new(search_llm.clone()) as Arc<dyn TextGenerator>,
            MemoraOptions::from(config),
        );

        Ok(Self {
            db,
            memora,
            llm: vec![("extraction", extraction_llm), ("search", search_llm)],
        })
    }

    /// State over an existing pool and facade, with no model clients to report on.
    pub fn with_memora(memora: Memora) -> Self {
        Self {
            db: memora.pool().clone(),
            memora,
            llm: Vec::new(),
        }
    }
}

async fn build_index(config: &Config) -> Result<Option<Arc<dyn SemanticIndex>>> {
    let params = HybridParams {
        prefetch_limit: config.index.prefetch_limit,
        min_score: config.index.min_score,
        ..HybridParams::default()
    };

    let index: Arc<dyn SemanticIndex> = match config.index.backend {
        IndexBackend::None => {
            info!("No semantic index configured; running graph only");
            return Ok(None);
        }
        IndexBackend::Memory => Arc::new(InMemoryIndex::new(embeddings(config)?, params)),
        IndexBackend::Qdrant => {
            let embeddings = embeddings(config)?;
            let qdrant = QdrantService::new(&QdrantConfig {
                url: config.index.qdrant_url.clone(),
                collection: config.index.collection.clone(),
                api_key: config.index.qdrant_api_key.clone(),
            })
            .await?;
            Arc::new(QdrantIndex::new(qdrant, embeddings, params))
        }
    };

    index.setup().await?;
    Ok(Some(index))
}

fn embeddings(config: &Config) -> Result<EmbeddingService> {
    let embeddings = EmbeddingService::from_config(&config.embedding)?;
    if !embeddings.has_providers() {
        warn!("No embedding provider configured; using hash placeholder embeddings");
    }
    Ok(embeddings)
}
