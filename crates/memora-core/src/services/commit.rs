//! Dual-store write coordinator.
//!
//! The graph side of a write (chain change, memories with source copies,
//! supersedes edges) runs in one SQLite transaction. The index upsert
//! follows. If the upsert fails the graph is already committed; the caller
//! gets [`Error::PartialCommit`] with everything needed to replay the index
//! write through [`WriteCoordinator::retry_index_write`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use memora_models::{InteractionSaved, Memory, MessageBlock, PositionedMessage};

use super::chain::{self, ChainOp};
use super::index::{IndexEntry, SemanticIndex};
use super::reconciliation::WriteSet;
use crate::db::{self, DbPool};
use crate::{Error, Result};

/// Index entries that were not written after their graph commit.
#[derive(Debug, Clone)]
pub struct PendingIndexWrite {
    pub interaction_id: String,
    pub entries: Vec<IndexEntry>,
    /// Error text of the failed attempt.
    pub reason: String,
}

impl PendingIndexWrite {
    pub fn memory_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.memory_id.clone()).collect()
    }
}

/// Interaction a commit writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionRef<'a> {
    /// Create a new interaction with a fresh id.
    New,
    Existing(&'a str),
}

#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    pub org_id: &'a str,
    pub user_id: &'a str,
    pub agent_id: &'a str,
    pub interaction: InteractionRef<'a>,
    pub chain_op: &'a ChainOp,
    /// The full message list after this write; sources are copied from it.
    pub messages: &'a [MessageBlock],
    pub write_set: &'a WriteSet,
    pub when: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WriteCoordinator {
    pool: DbPool,
    index: Option<Arc<dyn SemanticIndex>>,
}

fn copy_sources(messages: &[MessageBlock], positions: &[usize]) -> Vec<PositionedMessage> {
    positions
        .iter()
        .filter_map(|&pos| {
            messages.get(pos).map(|m| PositionedMessage {
                position: pos as i64,
                role: m.role.clone(),
                content: m.content.clone(),
            })
        })
        .collect()
}

impl WriteCoordinator {
    pub fn new(pool: DbPool, index: Option<Arc<dyn SemanticIndex>>) -> Self {
        Self { pool, index }
    }

    /// Write one save or update to both stores.
    pub async fn commit(&self, req: CommitRequest<'_>) -> Result<InteractionSaved> {
        let interaction_id = match req.interaction {
            InteractionRef::New => memora_models::short_id(),
            InteractionRef::Existing(id) => id.to_string(),
        };

        // Ids are fixed before either store is touched
        let memory = |text: &str, sources: &[usize]| Memory {
            org_id: req.org_id.to_string(),
            user_id: req.user_id.to_string(),
            agent_id: req.agent_id.to_string(),
            interaction_id: interaction_id.clone(),
            id: memora_models::new_id(),
            memory: text.to_string(),
            obtained_at: req.when,
            message_sources: copy_sources(req.messages, sources),
        };
        let new_memories: Vec<Memory> = req
            .write_set
            .new_memories
            .iter()
            .map(|m| memory(&m.text, &m.sources))
            .collect();
        let contrary_memories: Vec<(Memory, &str)> = req
            .write_set
            .contrary_memories
            .iter()
            .map(|m| (memory(&m.text, &m.sources), m.supersedes.as_str()))
            .collect();

        let mut tx = self.pool.begin().await?;

        // (a) interaction header and message chain
        match req.interaction {
            InteractionRef::New => {
                db::insert_interaction(
                    &mut *tx,
                    &memora_models::Interaction {
                        org_id: req.org_id.to_string(),
                        user_id: req.user_id.to_string(),
                        id: interaction_id.clone(),
                        agent_id: req.agent_id.to_string(),
                        created_at: req.when,
                        updated_at: req.when,
                    },
                )
                .await?;
            }
            InteractionRef::Existing(id) => {
                db::touch_interaction(&mut *tx, req.org_id, req.user_id, id, req.agent_id, req.when)
                    .await?;
            }
        }
        chain::apply(&mut tx, req.org_id, req.user_id, &interaction_id, req.chain_op).await?;

        // (b) memories with source copies
        for m in new_memories.iter().chain(contrary_memories.iter().map(|(m, _)| m)) {
            db::insert_memory(&mut tx, m).await?;
        }

        // (c) supersedes edges
        for (m, older_id) in &contrary_memories {
            if !db::memory_belongs_to(&mut *tx, req.org_id, req.user_id, older_id).await? {
                return Err(Error::Validation(format!(
                    "Superseded memory {} does not belong to this user",
                    older_id
                )));
            }
            db::insert_supersedes(&mut tx, older_id, &m.id, req.when).await?;
        }

        tx.commit().await?;

        let written: Vec<Memory> = new_memories
            .into_iter()
            .chain(contrary_memories.into_iter().map(|(m, _)| m))
            .collect();
        let memory_ids: Vec<String> = written.iter().map(|m| m.id.clone()).collect();

        info!(
            interaction_id = %interaction_id,
            memories = memory_ids.len(),
            "Committed interaction to graph"
        );

        // (d) index
        if let Some(index) = &self.index {
            let entries: Vec<IndexEntry> = written
                .iter()
                .map(|m| IndexEntry {
                    memory_id: m.id.clone(),
                    org_id: m.org_id.clone(),
                    user_id: m.user_id.clone(),
                    agent_id: m.agent_id.clone(),
                    interaction_id: m.interaction_id.clone(),
                    text: m.memory.clone(),
                    obtained_at: m.obtained_at,
                })
                .collect();

            if !entries.is_empty() {
                if let Err(e) = index.upsert(&entries).await {
                    warn!(
                        interaction_id = %interaction_id,
                        error = %e,
                        "Index write failed after graph commit"
                    );
                    return Err(Error::PartialCommit(Box::new(PendingIndexWrite {
                        interaction_id,
                        entries,
                        reason: e.to_string(),
                    })));
                }
            }
        }

        Ok(InteractionSaved {
            interaction_id,
            memory_ids,
            updated_at: req.when,
        })
    }

    /// Replay a failed index write. Upserts are idempotent on memory id.
    pub async fn retry_index_write(&self, pending: &PendingIndexWrite) -> Result<()> {
        let index = self.index.as_ref().ok_or(Error::IndexNotConfigured)?;
        index.upsert(&pending.entries).await?;
        info!(
            interaction_id = %pending.interaction_id,
            memories = pending.entries.len(),
            "Replayed pending index write"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_sources_skips_missing_positions() {
        let messages = vec![MessageBlock::user("a"), MessageBlock::assistant("b")];
        let copied = copy_sources(&messages, &[1, 5]);
        assert_eq!(
            copied,
            vec![PositionedMessage {
                position: 1,
                role: "assistant".to_string(),
                content: "b".to_string(),
            }]
        );
    }
}
