//! Memory model: atomic, versioned facts extracted from interactions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "sqlx")]
use sqlx::FromRow;

use crate::PositionedMessage;

/// A stored memory.
///
/// `memory` holds the text exactly as written to both stores, with
/// `user_<id>` / `agent_<id>` placeholders. Rendering to display names
/// happens at read time and never mutates the stored text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
#[serde(rename_all = "snake_case")]
pub struct Memory {
    pub org_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub interaction_id: String,
    pub id: String,
    pub memory: String,
    pub obtained_at: DateTime<Utc>,

    /// Copies of the messages this memory was drawn from, taken at write time.
    #[cfg_attr(feature = "sqlx", sqlx(skip))]
    #[serde(default)]
    pub message_sources: Vec<PositionedMessage>,
}

/// A memory and the score it matched with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub score: f32,
}

/// Filter parameters for listing a user's memories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryListParams {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub skip: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}
