//! Interaction message chain updates.
//!
//! An update carries the whole conversation as the caller now sees it.
//! It is compared position by position with the stored chain; everything
//! before the first difference is kept and the rest is rewritten.

use sqlx::SqliteConnection;
use tracing::debug;

use memora_models::{MessageBlock, PositionedMessage};

use crate::db;
use crate::Result;

/// Change to apply to a stored chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOp {
    /// Write `messages` from `start`; nothing is deleted.
    Append {
        start: usize,
        messages: Vec<MessageBlock>,
    },
    /// Delete every message at or after `from`, then write `messages` from `from`.
    Rewrite {
        from: usize,
        messages: Vec<MessageBlock>,
    },
    Unchanged,
}

impl ChainOp {
    /// Chain for a brand new interaction.
    pub fn create(messages: Vec<MessageBlock>) -> Self {
        Self::Append { start: 0, messages }
    }

    /// Messages this op writes, with their positions.
    pub fn written(&self) -> Vec<PositionedMessage> {
        let (start, messages) = match self {
            Self::Append { start, messages } => (*start, messages),
            Self::Rewrite { from, messages } => (*from, messages),
            Self::Unchanged => return vec![],
        };
        messages
            .iter()
            .enumerate()
            .map(|(i, m)| PositionedMessage {
                position: (start + i) as i64,
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect()
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

/// First position where the chains differ, or `None` when identical.
///
/// If one chain is a strict prefix of the other, the answer is the length
/// of the shorter one.
pub fn first_difference(existing: &[MessageBlock], new: &[MessageBlock]) -> Option<usize> {
    let shared = existing.len().min(new.len());
    match (0..shared).find(|&i| existing[i] != new[i]) {
        Some(k) => Some(k),
        None if existing.len() == new.len() => None,
        None => Some(shared),
    }
}

/// Work out how to turn `existing` into `new`.
pub fn diff(existing: &[MessageBlock], new: &[MessageBlock]) -> ChainOp {
    if existing.is_empty() {
        return if new.is_empty() {
            ChainOp::Unchanged
        } else {
            ChainOp::create(new.to_vec())
        };
    }

    match first_difference(existing, new) {
        None => ChainOp::Unchanged,
        Some(k) if k >= existing.len() => ChainOp::Append {
            start: existing.len(),
            messages: new[k..].to_vec(),
        },
        Some(k) => ChainOp::Rewrite {
            from: k,
            messages: new[k..].to_vec(),
        },
    }
}

/// Apply `op` to the stored chain of one interaction.
pub async fn apply(
    conn: &mut SqliteConnection,
    org_id: &str,
    user_id: &str,
    interaction_id: &str,
    op: &ChainOp,
) -> Result<()> {
    match op {
        ChainOp::Unchanged => {}
        ChainOp::Append { start, messages } => {
            db::append_messages(conn, org_id, user_id, interaction_id, *start as i64, messages)
                .await?;
        }
        ChainOp::Rewrite { from, messages } => {
            let removed =
                db::truncate_messages(&mut *conn, org_id, user_id, interaction_id, *from as i64)
                    .await?;
            debug!(interaction_id, from, removed, "Truncated message chain");
            db::append_messages(conn, org_id, user_id, interaction_id, *from as i64, messages)
                .await?;
        }
    }
    Ok(())
}
