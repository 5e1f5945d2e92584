//! Reconciliation of candidate memories against what is already stored.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use memora_llm::ChatMessage;
use memora_models::Memory;

use super::extraction::Candidate;
use super::generation::{generate_structured, TextGenerator};
use super::retrieval::{flatten_by_max_score, Retriever, SearchTarget};
use super::{placeholder, prompts};
use crate::Result;

/// A memory to write that supersedes nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMemory {
    pub text: String,
    pub sources: Vec<usize>,
}

/// A memory to write that supersedes an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContraryMemory {
    pub text: String,
    pub sources: Vec<usize>,
    pub supersedes: String,
}

/// What a save or update will write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub new_memories: Vec<NewMemory>,
    pub contrary_memories: Vec<ContraryMemory>,
}

impl WriteSet {
    pub fn all_new(candidates: Vec<Candidate>) -> Self {
        Self {
            new_memories: candidates
                .into_iter()
                .map(|c| NewMemory {
                    text: c.text,
                    sources: c.sources,
                })
                .collect(),
            contrary_memories: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_memories.is_empty() && self.contrary_memories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.new_memories.len() + self.contrary_memories.len()
    }
}

#[derive(Debug, Deserialize)]
struct GleanedMemory {
    memory: String,
    source_candidate_pos_id: i64,
}

#[derive(Debug, Deserialize)]
struct ContraryReply {
    memory: String,
    source_candidate_pos_id: i64,
    contradicted_memory_id: String,
}

#[derive(Debug, Deserialize)]
struct ComparisonReply {
    #[serde(default)]
    new_memories: Vec<GleanedMemory>,
    #[serde(default)]
    contrary_memories: Vec<ContraryReply>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileInput<'a> {
    pub org_id: &'a str,
    pub user_id: &'a str,
    pub agent_id: &'a str,
    /// Compare against every agent's memories of this user.
    pub search_across_agents: bool,
    pub when: DateTime<Utc>,
}

/// Classify candidates as new or contradicting stored memories.
pub async fn reconcile(
    generator: &dyn TextGenerator,
    retriever: &Retriever,
    input: ReconcileInput<'_>,
    candidates: Vec<Candidate>,
    timeout: Duration,
) -> Result<WriteSet> {
    if candidates.is_empty() {
        return Ok(WriteSet::default());
    }
    if !retriever.has_index() {
        debug!("No semantic index; every candidate is new");
        return Ok(WriteSet::all_new(candidates));
    }

    let agent_filter = (!input.search_across_agents).then_some(input.agent_id);
    let target = SearchTarget::user(input.org_id, input.user_id, agent_filter);
    let queries: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();

    let matches = retriever.search_matches(target, &queries).await?;
    let existing: Vec<Memory> = flatten_by_max_score(retriever.resolve(target, matches).await?)
        .into_iter()
        .map(|s| s.memory)
        .collect();

    if existing.is_empty() {
        debug!(candidates = candidates.len(), "No similar memories; every candidate is new");
        return Ok(WriteSet::all_new(candidates));
    }

    let messages = [
        ChatMessage::system(prompts::reconciliation_system(
            input.user_id,
            input.agent_id,
            input.when,
        )),
        ChatMessage::user(prompts::reconciliation_input(&existing, &queries)),
    ];
    let reply: ComparisonReply =
        generate_structured(generator, &messages, prompts::reconciliation_schema(), timeout)
            .await?;

    let write_set = build_write_set(reply, &candidates, &existing, input.user_id, input.agent_id);
    debug!(
        new = write_set.new_memories.len(),
        contrary = write_set.contrary_memories.len(),
        existing = existing.len(),
        "Reconciled candidates"
    );
    Ok(write_set)
}

fn candidate_at<'c>(candidates: &'c [Candidate], pos_id: i64) -> Option<&'c Candidate> {
    usize::try_from(pos_id).ok().and_then(|i| candidates.get(i))
}

fn build_write_set(
    reply: ComparisonReply,
    candidates: &[Candidate],
    existing: &[Memory],
    user_id: &str,
    agent_id: &str,
) -> WriteSet {
    let mut write_set = WriteSet::default();

    for gleaned in reply.new_memories {
        let Some(candidate) = candidate_at(candidates, gleaned.source_candidate_pos_id) else {
            warn!(pos_id = gleaned.source_candidate_pos_id, "Dropping new memory with unknown POS_ID");
            continue;
        };
        let text = placeholder::to_stored(&gleaned.memory, user_id, agent_id);
        if text.is_empty() {
            continue;
        }
        write_set.new_memories.push(NewMemory {
            text,
            sources: candidate.sources.clone(),
        });
    }

    for contrary in reply.contrary_memories {
        let Some(candidate) = candidate_at(candidates, contrary.source_candidate_pos_id) else {
            warn!(pos_id = contrary.source_candidate_pos_id, "Dropping contrary memory with unknown POS_ID");
            continue;
        };
        let text = placeholder::to_stored(&contrary.memory, user_id, agent_id);
        if text.is_empty() {
            continue;
        }

        let contradicted = contrary.contradicted_memory_id.trim();
        if existing.iter().any(|m| m.id == contradicted) {
            write_set.contrary_memories.push(ContraryMemory {
                text,
                sources: candidate.sources.clone(),
                supersedes: contradicted.to_string(),
            });
        } else {
            warn!(
                contradicted_memory_id = contradicted,
                "Contradicted memory was not presented; keeping as new"
            );
            write_set.new_memories.push(NewMemory {
                text,
                sources: candidate.sources.clone(),
            });
        }
    }

    write_set
}
