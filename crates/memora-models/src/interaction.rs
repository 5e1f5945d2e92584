//! Interaction model: an ordered chain of messages between a user and an agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "sqlx")]
use sqlx::FromRow;

use crate::Memory;

/// A single message as supplied by the caller.
///
/// Roles are free-form (`user`, `assistant`, `system`, `tool`, ...).
/// Two blocks are the same message when both role and content match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBlock {
    pub role: String,
    pub content: String,
}

impl MessageBlock {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// A message stored at a fixed position of an interaction chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
pub struct PositionedMessage {
    pub position: i64,
    pub role: String,
    pub content: String,
}

impl PositionedMessage {
    pub fn block(&self) -> MessageBlock {
        MessageBlock::new(self.role.clone(), self.content.clone())
    }
}

/// Interaction header record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
#[serde(rename_all = "snake_case")]
pub struct Interaction {
    pub org_id: String,
    pub user_id: String,
    pub id: String,
    /// Agent of the most recent save or update.
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An interaction with its message chain and the memories sourced from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionDetail {
    #[serde(flatten)]
    pub interaction: Interaction,
    pub messages: Vec<PositionedMessage>,
    pub memories: Vec<Memory>,
}

/// Request model for saving or updating an interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionWrite {
    pub agent_id: String,
    pub messages: Vec<MessageBlock>,
    /// Defaults to the current time.
    #[serde(default)]
    pub interaction_date: Option<DateTime<Utc>>,
    /// Compare against memories of every agent, not just this one.
    #[serde(default)]
    pub search_across_agents: Option<bool>,
    /// Extract facts about the agent as well as the user.
    #[serde(default)]
    pub extract_agent_memories: bool,
}

/// Result of a save or update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionSaved {
    pub interaction_id: String,
    /// Ids of every memory created by the operation, in write order.
    pub memory_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}
