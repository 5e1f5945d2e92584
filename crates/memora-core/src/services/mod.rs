//! Service layer for Memora.
//!
//! Contains the memory pipeline and its integrations:
//! - Chain (message chain diffing and application)
//! - Extraction (candidate memories from a conversation)
//! - Reconciliation (new vs. contradicting candidates)
//! - Commit (graph transaction followed by index upsert)
//! - Index (Qdrant hybrid index and an in-process equivalent)
//! - Retrieval (index search resolved through the graph)
//! - Recall (query generation, search and filtering for one message)
//! - Memora (the facade the API talks to)

pub mod chain;
mod commit;
pub mod extraction;
mod generation;
mod index;
mod memora;
pub mod placeholder;
pub mod prompts;
pub mod recall;
pub mod reconciliation;
pub mod retrieval;

pub use commit::{CommitRequest, InteractionRef, PendingIndexWrite, WriteCoordinator};
pub use generation::{generate_structured, generate_text, GenerationError, TextGenerator};
pub use index::{IndexEntry, IndexFilter, IndexMatch, InMemoryIndex, QdrantIndex, SemanticIndex};
pub use memora::{Memora, MemoraOptions};
pub use retrieval::{Retriever, SearchTarget};

pub use memora_embeddings::{EmbeddingConfig, EmbeddingService};
pub use memora_llm::{ChatMessage, ChatOptions, LlmConfig, LlmService};
pub use memora_qdrant::{HybridParams, QdrantConfig, QdrantService};
