//! The Memora service.
//!
//! Ties the pipeline together: extraction and reconciliation (with retry),
//! the write coordinator, retrieval and recall, and record management for
//! the tenancy tree. Reads render placeholders with current names; writes
//! store placeholder form only.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use memora_models::{
    Agent, Interaction, InteractionDetail, InteractionSaved, InteractionWrite, Memory,
    MemoryListParams, MessageBlock, Organization, Page, RecallOutcome, RecallRequest,
    SearchRequest, SearchResponse, User,
};

use super::chain::{self, ChainOp};
use super::commit::{CommitRequest, InteractionRef, PendingIndexWrite, WriteCoordinator};
use super::extraction::{self, ExtractionInput};
use super::generation::TextGenerator;
use super::index::{IndexFilter, SemanticIndex};
use super::placeholder;
use super::recall::{self, RecallInput};
use super::reconciliation::{self, ReconcileInput, WriteSet};
use super::retrieval::{check_top_p, flatten_by_max_score, select_top_p, Retriever, SearchTarget};
use crate::config::Config;
use crate::db::{self, DbPool};
use crate::{Error, Result};

/// Behaviour switches for the service.
#[derive(Debug, Clone)]
pub struct MemoraOptions {
    /// Extraction/reconciliation attempts after the first one.
    pub max_retries: u32,
    /// Largest per-request override of `max_retries` a caller may ask for.
    pub max_retries_cap: u32,
    pub generation_timeout: Duration,
    pub search_across_agents: bool,
    pub recall_filter: bool,
    /// Floor applied again when selecting top-p results.
    pub min_score: f32,
}

impl Default for MemoraOptions {
    fn default() -> Self {
        Self {
            max_retries: 1,
            max_retries_cap: 5,
            generation_timeout: Duration::from_secs(120),
            search_across_agents: true,
            recall_filter: true,
            min_score: 0.35,
        }
    }
}

impl From<&Config> for MemoraOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.memory.max_retries,
            max_retries_cap: config.memory.max_retries_cap,
            generation_timeout: config.memory.generation_timeout,
            search_across_agents: config.memory.search_across_agents,
            recall_filter: config.memory.recall_filter,
            min_score: config.index.min_score,
        }
    }
}

/// Per-write context shared by extraction and reconciliation.
struct WriteContext<'a> {
    org_id: &'a str,
    user: &'a User,
    agent: &'a Agent,
    messages: &'a [MessageBlock],
    previous: &'a [Memory],
    include_agent: bool,
    search_across_agents: bool,
    when: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Memora {
    pool: DbPool,
    index: Option<Arc<dyn SemanticIndex>>,
    extraction_llm: Arc<dyn TextGenerator>,
    search_llm: Arc<dyn TextGenerator>,
    retriever: Retriever,
    writer: WriteCoordinator,
    options: MemoraOptions,
}

impl Memora {
    pub fn new(
        pool: DbPool,
        index: Option<Arc<dyn SemanticIndex>>,
        extraction_llm: Arc<dyn TextGenerator>,
        search_llm: Arc<dyn TextGenerator>,
        options: MemoraOptions,
    ) -> Self {
        Self {
            retriever: Retriever::new(pool.clone(), index.clone()),
            writer: WriteCoordinator::new(pool.clone(), index.clone()),
            pool,
            index,
            extraction_llm,
            search_llm,
            options,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn options(&self) -> &MemoraOptions {
        &self.options
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    // ========================================================================
    // Organizations, users and agents
    // ========================================================================

    pub async fn create_organization(&self, name: &str) -> Result<Organization> {
        let org = db::create_organization(&self.pool, non_blank("name", name)?).await?;
        info!(org_id = %org.id, "Created organization");
        Ok(org)
    }

    pub async fn get_organization(&self, org_id: &str) -> Result<Organization> {
        db::get_organization(&self.pool, org_id).await
    }

    pub async fn list_organizations(&self, page: Page) -> Result<Vec<Organization>> {
        db::list_organizations(&self.pool, page).await
    }

    pub async fn rename_organization(&self, org_id: &str, name: &str) -> Result<Organization> {
        db::rename_organization(&self.pool, org_id, non_blank("name", name)?).await
    }

    /// Delete an organization and everything under it, in both stores.
    pub async fn delete_organization(&self, org_id: &str) -> Result<()> {
        db::delete_organization(&self.pool, org_id).await?;
        let removed = self.delete_from_index(IndexFilter::org(org_id)).await?;
        info!(org_id, index_entries = removed, "Deleted organization");
        Ok(())
    }

    pub async fn create_user(&self, org_id: &str, name: &str) -> Result<User> {
        let user = db::create_user(&self.pool, org_id, non_blank("name", name)?).await?;
        info!(org_id, user_id = %user.id, "Created user");
        Ok(user)
    }

    pub async fn get_user(&self, org_id: &str, user_id: &str) -> Result<User> {
        db::get_user(&self.pool, org_id, user_id).await
    }

    pub async fn list_users(&self, org_id: &str, page: Page) -> Result<Vec<User>> {
        db::get_organization(&self.pool, org_id).await?;
        db::list_users(&self.pool, org_id, page).await
    }

    pub async fn rename_user(&self, org_id: &str, user_id: &str, name: &str) -> Result<User> {
        db::rename_user(&self.pool, org_id, user_id, non_blank("name", name)?).await
    }

    /// Delete a user with their interactions, memories and personal agents.
    pub async fn delete_user(&self, org_id: &str, user_id: &str) -> Result<()> {
        db::delete_user(&self.pool, org_id, user_id).await?;
        let removed = self
            .delete_from_index(IndexFilter::user(org_id, user_id))
            .await?;
        info!(org_id, user_id, index_entries = removed, "Deleted user");
        Ok(())
    }

    pub async fn create_agent(
        &self,
        org_id: &str,
        label: &str,
        user_id: Option<&str>,
    ) -> Result<Agent> {
        let agent = db::create_agent(&self.pool, org_id, non_blank("label", label)?, user_id).await?;
        info!(org_id, agent_id = %agent.id, "Created agent");
        Ok(agent)
    }

    pub async fn get_agent(&self, org_id: &str, agent_id: &str) -> Result<Agent> {
        db::get_agent(&self.pool, org_id, agent_id).await
    }

    pub async fn list_agents(
        &self,
        org_id: &str,
        user_id: Option<&str>,
        page: Page,
    ) -> Result<Vec<Agent>> {
        db::get_organization(&self.pool, org_id).await?;
        db::list_agents(&self.pool, org_id, user_id, page).await
    }

    pub async fn rename_agent(&self, org_id: &str, agent_id: &str, label: &str) -> Result<Agent> {
        db::rename_agent(&self.pool, org_id, agent_id, non_blank("label", label)?).await
    }

    /// Delete an agent record. Its interactions and memories stay.
    pub async fn delete_agent(&self, org_id: &str, agent_id: &str) -> Result<()> {
        db::delete_agent(&self.pool, org_id, agent_id).await?;
        info!(org_id, agent_id, "Deleted agent");
        Ok(())
    }

    // ========================================================================
    // Interactions
    // ========================================================================

    /// Save a new interaction and the memories extracted from it.
    ///
    /// `max_retries` overrides the configured number of extra attempts for
    /// extraction and reconciliation.
    pub async fn save_interaction(
        &self,
        org_id: &str,
        user_id: &str,
        write: InteractionWrite,
        max_retries: Option<u32>,
    ) -> Result<InteractionSaved> {
        if write.messages.is_empty() {
            return Err(Error::Validation("messages must not be empty".to_string()));
        }
        let max_retries = self.retries_for(max_retries)?;
        let user = db::get_user(&self.pool, org_id, user_id).await?;
        let agent = db::get_agent(&self.pool, org_id, &write.agent_id).await?;
        let when = write.interaction_date.unwrap_or_else(memora_models::now);

        let ctx = WriteContext {
            org_id,
            user: &user,
            agent: &agent,
            messages: &write.messages,
            previous: &[],
            include_agent: write.extract_agent_memories,
            search_across_agents: write
                .search_across_agents
                .unwrap_or(self.options.search_across_agents),
            when,
        };
        let write_set = self
            .write_set_with_retry(&ctx, max_retries)
            .await?;

        let chain_op = ChainOp::create(write.messages.clone());
        let saved = self
            .writer
            .commit(CommitRequest {
                org_id,
                user_id,
                agent_id: &agent.id,
                interaction: InteractionRef::New,
                chain_op: &chain_op,
                messages: &write.messages,
                write_set: &write_set,
                when,
            })
            .await?;

        info!(
            org_id,
            user_id,
            interaction_id = %saved.interaction_id,
            memories = saved.memory_ids.len(),
            "Saved interaction"
        );
        Ok(saved)
    }

    /// Replace an interaction's messages with `write.messages`.
    ///
    /// The common prefix is kept; the rest of the stored chain is rewritten.
    /// Memories are extracted again from the whole new conversation, with the
    /// interaction's earlier memories shown to the model.
    pub async fn update_interaction(
        &self,
        org_id: &str,
        user_id: &str,
        interaction_id: &str,
        write: InteractionWrite,
        max_retries: Option<u32>,
    ) -> Result<InteractionSaved> {
        let max_retries = self.retries_for(max_retries)?;
        let user = db::get_user(&self.pool, org_id, user_id).await?;
        let agent = db::get_agent(&self.pool, org_id, &write.agent_id).await?;
        db::get_interaction(&self.pool, org_id, user_id, interaction_id).await?;
        let when = write.interaction_date.unwrap_or_else(memora_models::now);

        let existing: Vec<MessageBlock> =
            db::get_messages(&self.pool, org_id, user_id, interaction_id)
                .await?
                .iter()
                .map(|m| m.block())
                .collect();
        let chain_op = chain::diff(&existing, &write.messages);

        let write_set = if chain_op.is_unchanged() || write.messages.is_empty() {
            WriteSet::default()
        } else {
            let previous = db::interaction_memories(&self.pool, org_id, user_id, interaction_id).await?;
            let ctx = WriteContext {
                org_id,
                user: &user,
                agent: &agent,
                messages: &write.messages,
                previous: &previous,
                include_agent: write.extract_agent_memories,
                search_across_agents: write
                    .search_across_agents
                    .unwrap_or(self.options.search_across_agents),
                when,
            };
            self.write_set_with_retry(&ctx, max_retries).await?
        };

        let saved = self
            .writer
            .commit(CommitRequest {
                org_id,
                user_id,
                agent_id: &agent.id,
                interaction: InteractionRef::Existing(interaction_id),
                chain_op: &chain_op,
                messages: &write.messages,
                write_set: &write_set,
                when,
            })
            .await?;

        info!(
            org_id,
            user_id,
            interaction_id,
            op = ?chain_op_kind(&chain_op),
            memories = saved.memory_ids.len(),
            "Updated interaction"
        );
        Ok(saved)
    }

    /// Replay the index half of a write that failed with [`Error::PartialCommit`].
    pub async fn retry_index_write(&self, pending: &PendingIndexWrite) -> Result<()> {
        self.writer.retry_index_write(pending).await
    }

    pub async fn get_interaction(
        &self,
        org_id: &str,
        user_id: &str,
        interaction_id: &str,
    ) -> Result<InteractionDetail> {
        let interaction = db::get_interaction(&self.pool, org_id, user_id, interaction_id).await?;
        let messages = db::get_messages(&self.pool, org_id, user_id, interaction_id).await?;
        let mut memories =
            db::interaction_memories(&self.pool, org_id, user_id, interaction_id).await?;
        placeholder::render_memories(&self.pool, org_id, memories.iter_mut()).await?;

        Ok(InteractionDetail {
            interaction,
            messages,
            memories,
        })
    }

    pub async fn list_interactions(
        &self,
        org_id: &str,
        user_id: &str,
        page: Page,
    ) -> Result<Vec<Interaction>> {
        db::get_user(&self.pool, org_id, user_id).await?;
        db::list_interactions(&self.pool, org_id, user_id, page).await
    }

    /// Delete an interaction with its messages and memories, in both stores.
    pub async fn delete_interaction(
        &self,
        org_id: &str,
        user_id: &str,
        interaction_id: &str,
    ) -> Result<()> {
        let memory_ids = db::delete_interaction(&self.pool, org_id, user_id, interaction_id).await?;
        let removed = self
            .delete_from_index(IndexFilter::user(org_id, user_id).with_interaction(interaction_id))
            .await?;
        info!(
            org_id,
            user_id,
            interaction_id,
            memories = memory_ids.len(),
            index_entries = removed,
            "Deleted interaction"
        );
        Ok(())
    }

    pub async fn delete_all_interactions(&self, org_id: &str, user_id: &str) -> Result<()> {
        db::get_user(&self.pool, org_id, user_id).await?;
        let memory_ids = db::delete_user_interactions(&self.pool, org_id, user_id).await?;
        self.delete_ids_from_index(&memory_ids).await?;
        info!(org_id, user_id, memories = memory_ids.len(), "Deleted all interactions");
        Ok(())
    }

    // ========================================================================
    // Memories
    // ========================================================================

    pub async fn get_memory(&self, org_id: &str, user_id: &str, memory_id: &str) -> Result<Memory> {
        let mut memory = db::get_memory(&self.pool, org_id, user_id, memory_id).await?;
        placeholder::render_memories(&self.pool, org_id, [&mut memory]).await?;
        Ok(memory)
    }

    pub async fn list_memories(
        &self,
        org_id: &str,
        user_id: &str,
        params: MemoryListParams,
    ) -> Result<Vec<Memory>> {
        db::get_user(&self.pool, org_id, user_id).await?;
        let page = Page::new(
            params.skip.unwrap_or(0),
            params.limit.unwrap_or(Page::default().limit),
        );
        let mut memories =
            db::list_memories(&self.pool, org_id, user_id, params.agent_id.as_deref(), page)
                .await?;
        placeholder::render_memories(&self.pool, org_id, memories.iter_mut()).await?;
        Ok(memories)
    }

    /// Every version of a memory, newest first.
    pub async fn memory_history(
        &self,
        org_id: &str,
        user_id: &str,
        memory_id: &str,
    ) -> Result<Vec<Memory>> {
        let mut history = db::memory_history(&self.pool, org_id, user_id, memory_id).await?;
        placeholder::render_memories(&self.pool, org_id, history.iter_mut()).await?;
        Ok(history)
    }

    pub async fn delete_memory(&self, org_id: &str, user_id: &str, memory_id: &str) -> Result<()> {
        db::delete_memory(&self.pool, org_id, user_id, memory_id).await?;
        self.delete_ids_from_index(&[memory_id.to_string()]).await?;
        info!(org_id, user_id, memory_id, "Deleted memory");
        Ok(())
    }

    pub async fn delete_all_memories(&self, org_id: &str, user_id: &str) -> Result<()> {
        db::get_user(&self.pool, org_id, user_id).await?;
        let memory_ids = db::delete_user_memories(&self.pool, org_id, user_id).await?;
        self.delete_ids_from_index(&memory_ids).await?;
        info!(org_id, user_id, memories = memory_ids.len(), "Deleted all memories");
        Ok(())
    }

    // ========================================================================
    // Retrieval
    // ========================================================================

    /// Run several queries at once in organization or user scope.
    pub async fn search(&self, org_id: &str, request: SearchRequest) -> Result<SearchResponse> {
        if request.queries.iter().all(|q| q.trim().is_empty()) {
            return Err(Error::Validation("queries must not be empty".to_string()));
        }
        let target = SearchTarget {
            org_id,
            scope: request.scope,
            user_id: request.user_id.as_deref(),
            agent_id: request.agent_id.as_deref(),
        };
        target.validate()?;
        if let Some(p) = request.top_p {
            check_top_p(p)?;
        }
        db::get_organization(&self.pool, org_id).await?;

        let results = self.retriever.search(target, &request.queries).await?;

        match request.top_p {
            Some(p) => Ok(SearchResponse::Flattened(select_top_p(
                flatten_by_max_score(results),
                p,
                self.options.min_score,
            )?)),
            None if request.flatten => Ok(SearchResponse::Flattened(flatten_by_max_score(results))),
            None => Ok(SearchResponse::PerQuery(results)),
        }
    }

    /// Memories relevant to the latest message of a conversation.
    pub async fn recall_for_message(
        &self,
        org_id: &str,
        user_id: &str,
        request: RecallRequest,
    ) -> Result<RecallOutcome> {
        if request.latest_message.content.trim().is_empty() {
            return Err(Error::Validation("latest_message must not be empty".to_string()));
        }
        db::get_user(&self.pool, org_id, user_id).await?;

        let input = RecallInput {
            org_id,
            user_id,
            agent_id: request.agent_id.as_deref(),
            latest_message: &request.latest_message.content,
            preceding_messages: &request.preceding_messages,
            when: request.current_time.unwrap_or_else(memora_models::now),
            filter: request.filter.unwrap_or(self.options.recall_filter),
        };

        recall::recall(
            self.search_llm.as_ref(),
            &self.retriever,
            input,
            self.options.generation_timeout,
        )
        .await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Resolve a per-request retry override against the configured cap.
    fn retries_for(&self, requested: Option<u32>) -> Result<u32> {
        match requested {
            None => Ok(self.options.max_retries),
            Some(n) if n <= self.options.max_retries_cap => Ok(n),
            Some(n) => Err(Error::Validation(format!(
                "max_retries must be at most {} (got {})",
                self.options.max_retries_cap, n
            ))),
        }
    }

    /// Extract then reconcile, redoing both from scratch on generation failures.
    async fn write_set_with_retry(&self, ctx: &WriteContext<'_>, max_retries: u32) -> Result<WriteSet> {
        let max_attempts = max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.build_write_set(ctx).await {
                Ok(write_set) => return Ok(write_set),
                Err(e) if e.is_generation_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %e, "Memory generation failed, retrying");
                }
                Err(Error::GenerationParse { message, .. }) => {
                    return Err(Error::GenerationParse {
                        attempts: attempt,
                        message,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn build_write_set(&self, ctx: &WriteContext<'_>) -> Result<WriteSet> {
        let candidates = extraction::extract(
            self.extraction_llm.as_ref(),
            ExtractionInput {
                user_id: &ctx.user.id,
                user_name: &ctx.user.name,
                agent_id: &ctx.agent.id,
                agent_label: &ctx.agent.label,
                messages: ctx.messages,
                previous: ctx.previous,
                include_agent: ctx.include_agent,
                when: ctx.when,
            },
            self.options.generation_timeout,
        )
        .await?;

        reconciliation::reconcile(
            self.extraction_llm.as_ref(),
            &self.retriever,
            ReconcileInput {
                org_id: ctx.org_id,
                user_id: &ctx.user.id,
                agent_id: &ctx.agent.id,
                search_across_agents: ctx.search_across_agents,
                when: ctx.when,
            },
            candidates,
            self.options.generation_timeout,
        )
        .await
    }

    async fn delete_from_index(&self, filter: IndexFilter) -> Result<usize> {
        match &self.index {
            Some(index) => index.delete_by_filter(&filter).await,
            None => Ok(0),
        }
    }

    async fn delete_ids_from_index(&self, memory_ids: &[String]) -> Result<()> {
        match &self.index {
            Some(index) if !memory_ids.is_empty() => index.delete(memory_ids).await,
            _ => Ok(()),
        }
    }
}

fn non_blank<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    Ok(trimmed)
}

fn chain_op_kind(op: &ChainOp) -> &'static str {
    match op {
        ChainOp::Append { .. } => "append",
        ChainOp::Rewrite { .. } => "rewrite",
        ChainOp::Unchanged => "unchanged",
    }
}
