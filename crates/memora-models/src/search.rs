//! Search and recall request/response models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageBlock, ScoredMemory};

/// How wide a search reaches inside an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    /// Every memory of the organization.
    Organization,
    /// Only the memories of one user. Requires a user id.
    #[default]
    User,
}

impl SearchScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchScope::Organization => "organization",
            SearchScope::User => "user",
        }
    }
}

impl std::fmt::Display for SearchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request model for a multi-query memory search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub queries: Vec<String>,
    #[serde(default)]
    pub scope: SearchScope,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Merge per-query results into one list keeping each memory's best score.
    #[serde(default)]
    pub flatten: bool,
    /// Cumulative score share to keep from the flattened list, in (0, 1].
    #[serde(default)]
    pub top_p: Option<f32>,
}

/// Response model for a search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchResponse {
    /// One ranked list per query, in query order.
    PerQuery(Vec<Vec<ScoredMemory>>),
    Flattened(Vec<ScoredMemory>),
}

/// Request model for recalling memories relevant to the latest message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallRequest {
    pub latest_message: MessageBlock,
    #[serde(default)]
    pub preceding_messages: Vec<MessageBlock>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub current_time: Option<DateTime<Utc>>,
    /// Overrides the configured downstream filtering switch.
    #[serde(default)]
    pub filter: Option<bool>,
}

/// Why a recall produced no memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    /// Retrieval found nothing above the score threshold.
    NoMatches,
    /// The filter model judged none of the matches relevant.
    FilteredOut,
}

/// Outcome of a recall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecallOutcome {
    Recalled {
        memories: Vec<ScoredMemory>,
        /// True when the filter model narrowed the list.
        filtered: bool,
    },
    Empty {
        reason: EmptyReason,
    },
}

impl RecallOutcome {
    pub fn memories(&self) -> &[ScoredMemory] {
        match self {
            RecallOutcome::Recalled { memories, .. } => memories,
            RecallOutcome::Empty { .. } => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RecallOutcome::Empty { .. })
    }
}
