//! Text embeddings for hybrid memory search.
//!
//! Dense vectors come from Gemini, OpenAI or Ollama embedding APIs with
//! automatic fallback when a provider fails. Without providers the service
//! falls back to deterministic feature-hashed vectors, which are lexical
//! rather than semantic but stable across restarts.
//!
//! Sparse vectors (see [`sparse`]) are term-frequency bags keyed by a
//! stable hash of each term; the vector store applies IDF weighting.
//!
//! # Example
//!
//! ```no_run
//! use memora_embeddings::{EmbeddingService, EmbeddingConfig, EmbeddingProviderConfig};
//!
//! # async fn example() -> Result<(), memora_embeddings::Error> {
//! let config = EmbeddingConfig {
//!     providers: vec![EmbeddingProviderConfig {
//!         name: "openai".to_string(),
//!         base_url: "https://api.openai.com/v1".to_string(),
//!         model: "text-embedding-3-small".to_string(),
//!         api_key: "your-api-key".to_string(),
//!         priority: 1,
//!     }],
//!     dimension: 768,
//! };
//!
//! let service = EmbeddingService::from_config(&config)?;
//! let vectors = service.embed(vec!["User loves tacos".to_string()]).await?;
//! # Ok(())
//! # }
//! ```

pub mod sparse;

pub use sparse::{sparse_embed, tokenize, SparseVector};

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Maximum retries per provider before fallback
const MAX_RETRIES: u32 = 2;

/// Delay between retries (doubles each time)
const RETRY_DELAY_MS: u64 = 500;

/// Maximum texts per API call
const MAX_BATCH_SIZE: usize = 100;

// ============================================================================
// Error types
// ============================================================================

/// Errors that can occur in the embedding service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Internal error (HTTP client, parsing, etc.)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Provider API error
    #[error("Provider error: {0}")]
    Provider(String),

    /// No credentials configured
    #[error("No credentials configured")]
    NoCredentials,

    /// All providers failed
    #[error("All embedding providers failed")]
    AllProvidersFailed,
}

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Configuration types
// ============================================================================

/// Configuration for the embedding service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding providers; tried in priority order.
    pub providers: Vec<EmbeddingProviderConfig>,
    /// Dense vector dimension. Must match the vector collection.
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            dimension: 384,
        }
    }
}

/// Configuration for a single embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingProviderConfig {
    /// Provider name ("gemini", "openai", "ollama").
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Empty for providers that need no authentication.
    pub api_key: String,
    /// Lower = tried first.
    pub priority: u8,
}

impl EmbeddingProviderConfig {
    fn has_credentials(&self) -> bool {
        self.name == "ollama" || !self.api_key.is_empty()
    }
}

/// Get default endpoint for a provider.
pub fn default_endpoint(name: &str) -> String {
    match name {
        "gemini" => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        "ollama" => "http://localhost:11434".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

/// Get default model for a provider.
pub fn default_model(name: &str) -> String {
    match name {
        "gemini" => "text-embedding-004".to_string(),
        "ollama" => "nomic-embed-text".to_string(),
        _ => "text-embedding-3-small".to_string(),
    }
}

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
    code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct GeminiBatchResponse {
    embeddings: Option<Vec<GeminiEmbedding>>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbedResponse {
    data: Option<Vec<OpenAIEmbedding>>,
    error: Option<OpenAIError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Option<Vec<Vec<f32>>>,
    error: Option<String>,
}

// ============================================================================
// Embedding service
// ============================================================================

/// Service for generating dense text embeddings with multi-provider fallback.
#[derive(Clone)]
pub struct EmbeddingService {
    inner: Arc<EmbeddingServiceInner>,
}

struct EmbeddingServiceInner {
    providers: Vec<EmbeddingProviderConfig>,
    dimension: usize,
    client: Client,
}

impl EmbeddingService {
    /// Create a new embedding service from configuration.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let mut providers = config.providers.clone();
        providers.sort_by_key(|p| p.priority);

        if providers.is_empty() {
            warn!(
                dimension = config.dimension,
                "No embedding providers configured - using hash-based placeholders"
            );
        } else {
            info!(
                providers = ?providers.iter().map(|p| &p.name).collect::<Vec<_>>(),
                dimension = config.dimension,
                "Embedding service initialized from config"
            );
        }

        Ok(Self {
            inner: Arc::new(EmbeddingServiceInner {
                providers,
                dimension: config.dimension,
                client,
            }),
        })
    }

    /// Dense vector dimension.
    pub fn dimension(&self) -> usize {
        self.inner.dimension
    }

    /// Check if real embedding providers are configured.
    pub fn has_providers(&self) -> bool {
        !self.inner.providers.is_empty()
    }

    /// Generate dense embeddings for multiple texts, preserving order.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        if self.inner.providers.is_empty() {
            debug!(
                count = texts.len(),
                "Generating hash-based placeholder embeddings"
            );
            return Ok(texts
                .iter()
                .map(|t| hash_embed(t, self.inner.dimension))
                .collect());
        }

        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH_SIZE) {
            all.extend(self.embed_with_fallback(chunk).await?);
        }
        Ok(all)
    }

    async fn embed_with_fallback(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        debug!(count = texts.len(), "Generating API embeddings");

        let mut last_error = None;

        for provider in &self.inner.providers {
            if !provider.has_credentials() {
                debug!(provider = %provider.name, "Skipping provider without credentials");
                continue;
            }

            match self.try_provider(provider, texts).await {
                Ok(embeddings) if embeddings.len() == texts.len() => return Ok(embeddings),
                Ok(embeddings) => {
                    warn!(
                        provider = %provider.name,
                        expected = texts.len(),
                        got = embeddings.len(),
                        "Embedding count mismatch, trying next"
                    );
                    last_error = Some(Error::Provider(format!(
                        "{} returned {} embeddings for {} texts",
                        provider.name,
                        embeddings.len(),
                        texts.len()
                    )));
                }
                Err(e) => {
                    warn!(
                        provider = %provider.name,
                        error = %e,
                        "Embedding provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        // No hash fallback once providers are configured
        Err(last_error.unwrap_or(Error::AllProvidersFailed))
    }

    async fn try_provider(
        &self,
        provider: &EmbeddingProviderConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let mut delay = Duration::from_millis(RETRY_DELAY_MS);

        for attempt in 0..MAX_RETRIES {
            match self.call_provider(provider, texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) => {
                    if is_retryable(&e) && attempt < MAX_RETRIES - 1 {
                        debug!(
                            provider = %provider.name,
                            attempt,
                            delay_ms = delay.as_millis(),
                            "Retrying after error"
                        );
                        sleep(delay).await;
                        delay *= 2;
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(Error::Internal("Max retries exceeded".to_string()))
    }

    async fn call_provider(
        &self,
        provider: &EmbeddingProviderConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        match provider.name.as_str() {
            "gemini" => self.call_gemini(provider, texts).await,
            "openai" => self.call_openai(provider, texts).await,
            "ollama" => self.call_ollama(provider, texts).await,
            _ => Err(Error::Internal(format!(
                "Unknown embedding provider: {}",
                provider.name
            ))),
        }
    }

    async fn call_gemini(
        &self,
        provider: &EmbeddingProviderConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let url = format!(
            "{}/models/{}:batchEmbedContents",
            provider.base_url, provider.model
        );

        let requests: Vec<_> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", provider.model),
                    "content": {"parts": [{"text": text}]},
                    "outputDimensionality": self.inner.dimension
                })
            })
            .collect();

        let response = self
            .inner
            .client
            .post(&url)
            .header("x-goog-api-key", &provider.api_key)
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("Gemini batch request failed: {}", e)))?;

        let status = response.status();
        let resp: GeminiBatchResponse = response.json().await.map_err(|e| {
            Error::Internal(format!("Failed to parse Gemini batch response: {}", e))
        })?;

        if let Some(error) = resp.error {
            return Err(Error::Provider(format!(
                "Gemini batch error ({}): {}",
                error.code.unwrap_or(status.as_u16() as i32),
                error.message
            )));
        }

        resp.embeddings
            .map(|embs| embs.into_iter().map(|e| e.values).collect())
            .ok_or_else(|| Error::Internal("No embeddings in Gemini batch response".to_string()))
    }

    async fn call_openai(
        &self,
        provider: &EmbeddingProviderConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", provider.base_url);

        let body = json!({
            "model": provider.model,
            "input": texts,
            "dimensions": self.inner.dimension
        });

        let response = self
            .inner
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", provider.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("OpenAI batch request failed: {}", e)))?;

        let status = response.status();
        let resp: OpenAIEmbedResponse = response.json().await.map_err(|e| {
            Error::Internal(format!(
                "Failed to parse OpenAI batch response ({}): {}",
                status, e
            ))
        })?;

        if let Some(error) = resp.error {
            return Err(Error::Provider(format!(
                "OpenAI batch error ({}): {}",
                status, error.message
            )));
        }

        let mut data = resp
            .data
            .ok_or_else(|| Error::Internal("No embeddings in OpenAI batch response".to_string()))?;

        data.sort_by_key(|e| e.index);

        Ok(data.into_iter().map(|e| e.embedding).collect())
    }

    async fn call_ollama(
        &self,
        provider: &EmbeddingProviderConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", provider.base_url);

        let body = json!({
            "model": provider.model,
            "input": texts
        });

        let response = self
            .inner
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("Ollama batch request failed: {}", e)))?;

        let resp: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Failed to parse Ollama response: {}", e)))?;

        if let Some(error) = resp.error {
            return Err(Error::Provider(format!("Ollama error: {}", error)));
        }

        resp.embeddings
            .ok_or_else(|| Error::Internal("No embeddings in Ollama response".to_string()))
    }
}

/// Check if an error is retryable (rate limit, temporary failure).
fn is_retryable(error: &Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("rate")
        || msg.contains("429")
        || msg.contains("503")
        || msg.contains("timeout")
        || msg.contains("temporarily")
}

/// Deterministic feature-hashed embedding.
///
/// Each token adds a signed unit to one dimension chosen by its SHA-256
/// digest, so texts sharing words have positive cosine similarity. Not
/// semantic; used when no provider is configured.
pub fn hash_embed(text: &str, dim: usize) -> Vec<f32> {
    let mut embedding = vec![0.0f32; dim.max(1)];

    for token in tokenize(text) {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        let index = (bucket % embedding.len() as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        embedding[index] += sign;
    }

    // Normalize to unit length
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut embedding {
            *x /= norm;
        }
    }

    embedding
}

/// Cosine similarity of two dense vectors; 0 when either is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

// ============================================================================
// Tests
// ============================================================================
