//! Configuration management for Memora.
//!
//! Loads configuration from environment variables (and `.env`) with support for:
//! - Separate extraction and search LLM provider lists with fallback priority
//! - Dense embedding providers with a hash placeholder fallback
//! - Selectable semantic index backend (Qdrant, in-process, or none)

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use memora_embeddings::{EmbeddingConfig, EmbeddingProviderConfig};
use memora_llm::{LlmConfig, LlmProviderConfig};

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Initialize configuration (call once at startup)
pub fn init() -> &'static Config {
    config()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub index: IndexConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmSettings,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Which semantic index implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackend {
    Qdrant,
    /// In-process index; contents are lost on restart.
    Memory,
    /// Graph only. Reconciliation treats every candidate as new.
    None,
}

impl std::str::FromStr for IndexBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qdrant" => Ok(Self::Qdrant),
            "memory" | "local" => Ok(Self::Memory),
            "none" | "off" => Ok(Self::None),
            _ => Err(format!("Unknown index backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub backend: IndexBackend,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub collection: String,
    /// Minimum fused score for a match.
    pub min_score: f32,
    /// Candidates per dense/sparse prefetch.
    pub prefetch_limit: u64,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Used for extraction and reconciliation.
    pub extraction: LlmConfig,
    /// Used for recall query generation and filtering.
    pub search: LlmConfig,
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Extraction/reconciliation attempts after the first one.
    pub max_retries: u32,
    /// Upper bound for the `max_retries` query override.
    pub max_retries_cap: u32,
    pub generation_timeout: Duration,
    /// Compare candidates against memories from every agent of the user.
    pub search_across_agents: bool,
    /// Run the downstream filter step during recall.
    pub recall_filter: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            max_retries_cap: 5,
            generation_timeout: Duration::from_secs(120),
            search_across_agents: true,
            recall_filter: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let request_timeout = Duration::from_secs(parse_or("LLM_REQUEST_TIMEOUT_SECS", 60));

        Self {
            server: ServerConfig {
                host: env_or("HOST", "0.0.0.0"),
                port: parse_or("PORT", 8766),
                max_body_bytes: parse_or("MAX_BODY_BYTES", 2 * 1024 * 1024),
            },
            database: DatabaseConfig {
                path: env_or("DATABASE_PATH", "./data/memora.db"),
            },
            index: IndexConfig {
                backend: env_or("INDEX_BACKEND", "qdrant")
                    .parse()
                    .unwrap_or(IndexBackend::Qdrant),
                qdrant_url: env_or("QDRANT_URL", "http://localhost:6334"),
                qdrant_api_key: env::var("QDRANT_API_KEY").ok(),
                collection: env_or("QDRANT_COLLECTION", "memory_collection"),
                min_score: parse_or("INDEX_MIN_SCORE", 0.35),
                prefetch_limit: parse_or("INDEX_PREFETCH_LIMIT", 10),
            },
            embedding: Self::parse_embedding_config(),
            llm: LlmSettings {
                extraction: LlmConfig {
                    providers: Self::parse_llm_providers("EXTRACTION_LLM"),
                    request_timeout,
                },
                search: LlmConfig {
                    providers: Self::parse_llm_providers("SEARCH_LLM"),
                    request_timeout,
                },
            },
            memory: MemoryConfig {
                max_retries: parse_or("MEMORY_MAX_RETRIES", 1),
                max_retries_cap: parse_or("MEMORY_MAX_RETRIES_CAP", 5),
                generation_timeout: Duration::from_secs(parse_or("GENERATION_TIMEOUT_SECS", 120)),
                search_across_agents: parse_bool("SEARCH_ACROSS_AGENTS", true),
                recall_filter: parse_bool("RECALL_FILTER_ENABLED", true),
            },
        }
    }

    /// Parse LLM providers for one role.
    ///
    /// Pattern: {ROLE}_{NAME}_{FIELD}
    /// Example:
    ///   EXTRACTION_LLM_OPENAI_API_KEY=sk-...
    ///   EXTRACTION_LLM_OPENAI_MODEL=gpt-4o
    ///   EXTRACTION_LLM_OPENAI_PRIORITY=1
    ///   SEARCH_LLM_GROQ_API_KEY=...
    ///
    /// Falls back to the shared OPENAI_API_KEY / ANTHROPIC_API_KEY /
    /// GOOGLE_API_KEY variables when no role-specific provider is set.
    fn parse_llm_providers(role: &str) -> Vec<LlmProviderConfig> {
        let prefix = format!("{}_", role);
        let mut names: Vec<String> = env::vars()
            .filter_map(|(key, _)| {
                let rest = key.strip_prefix(&prefix)?;
                let idx = rest.rfind('_')?;
                let name = &rest[..idx];
                // Only the last segment is the field; names may contain underscores
                let field = &rest[idx + 1..];
                matches!(field, "KEY" | "MODEL" | "URL" | "PRIORITY")
                    .then(|| name.trim_end_matches("_API").to_lowercase())
            })
            .collect();
        names.sort();
        names.dedup();

        let mut providers: Vec<LlmProviderConfig> = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let upper = format!("{}{}_", prefix, name.to_uppercase());
                LlmProviderConfig {
                    base_url: env::var(format!("{}URL", upper))
                        .unwrap_or_else(|_| memora_llm::default_endpoint(&name)),
                    model: env::var(format!("{}MODEL", upper))
                        .unwrap_or_else(|_| memora_llm::default_model(&name)),
                    api_key: env::var(format!("{}API_KEY", upper)).ok(),
                    priority: parse_or(&format!("{}PRIORITY", upper), i as u8 + 1),
                    name,
                }
            })
            .collect();

        if providers.is_empty() {
            for (priority, (name, key_var)) in [
                ("openai", "OPENAI_API_KEY"),
                ("anthropic", "ANTHROPIC_API_KEY"),
                ("gemini", "GOOGLE_API_KEY"),
            ]
            .into_iter()
            .enumerate()
            {
                if let Ok(api_key) = env::var(key_var) {
                    providers.push(LlmProviderConfig::named(
                        name,
                        Some(api_key),
                        priority as u8 + 1,
                    ));
                }
            }
        }

        providers.sort_by_key(|p| p.priority);
        providers
    }

    /// Parse embedding providers from environment.
    fn parse_embedding_config() -> EmbeddingConfig {
        let mut providers = Vec::new();

        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            providers.push(EmbeddingProviderConfig {
                name: "openai".to_string(),
                base_url: env_or("OPENAI_EMBEDDING_URL", "https://api.openai.com/v1"),
                model: env_or("OPENAI_EMBEDDING_MODEL", "text-embedding-3-small"),
                api_key,
                priority: parse_or("OPENAI_EMBEDDING_PRIORITY", 2),
            });
        }

        if let Ok(api_key) = env::var("GOOGLE_API_KEY") {
            providers.push(EmbeddingProviderConfig {
                name: "gemini".to_string(),
                base_url: memora_embeddings::default_endpoint("gemini"),
                model: env_or("GEMINI_EMBEDDING_MODEL", "text-embedding-004"),
                api_key,
                priority: parse_or("GEMINI_EMBEDDING_PRIORITY", 3),
            });
        }

        // Local/self-hosted, preferred when available
        if let Ok(ollama_url) = env::var("OLLAMA_URL") {
            providers.push(EmbeddingProviderConfig {
                name: "ollama".to_string(),
                base_url: ollama_url,
                model: env_or("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text"),
                api_key: String::new(),
                priority: parse_or("OLLAMA_PRIORITY", 1),
            });
        }

        providers.sort_by_key(|p| p.priority);

        let default_dim = if providers.is_empty() { 384 } else { 768 };

        EmbeddingConfig {
            providers,
            dimension: parse_or("EMBEDDING_DIMENSION", default_dim),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no" | "off"))
        .unwrap_or(default)
}
