//! Memory queries and version chains.
//!
//! A memory is never edited in place. When a newer memory contradicts an
//! older one, a `memory_updates` edge points from the old id to the new
//! one. Readers always follow those edges forward to the chain head, so
//! a superseded memory is never returned on its own.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqliteExecutor};
use tracing::debug;

use crate::{Error, Result};
use memora_models::{Memory, Page, PositionedMessage};

use super::{placeholders, DbPool};

/// A chain head together with the id it was resolved from.
#[derive(Debug, FromRow)]
struct ResolvedRow {
    start_id: String,
    #[sqlx(flatten)]
    memory: Memory,
}

// ============================================================================
// Writes
// ============================================================================

/// Insert a memory and copies of its source messages.
pub async fn insert_memory(conn: &mut SqliteConnection, memory: &Memory) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO memories (id, org_id, user_id, agent_id, interaction_id, memory, obtained_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&memory.id)
    .bind(&memory.org_id)
    .bind(&memory.user_id)
    .bind(&memory.agent_id)
    .bind(&memory.interaction_id)
    .bind(&memory.memory)
    .bind(memory.obtained_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            Error::AlreadyExists(format!("Memory already exists: {}", memory.id))
        }
        _ => Error::Database(e),
    })?;

    for source in &memory.message_sources {
        sqlx::query(
            "INSERT INTO memory_sources (memory_id, position, role, content) VALUES (?, ?, ?, ?)",
        )
        .bind(&memory.id)
        .bind(source.position)
        .bind(&source.role)
        .bind(&source.content)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Record that `newer_id` supersedes `older_id`.
///
/// If `older_id` was already superseded, the edge is attached to the
/// current head of its chain instead so every chain stays linear.
/// Returns the id the edge was attached to.
pub async fn insert_supersedes(
    conn: &mut SqliteConnection,
    older_id: &str,
    newer_id: &str,
    at: DateTime<Utc>,
) -> Result<String> {
    let head = chain_head(&mut *conn, older_id).await?;
    if head == newer_id {
        return Err(Error::Validation(format!(
            "Memory {} cannot supersede itself",
            newer_id
        )));
    }
    if head != older_id {
        debug!(older_id, head = %head, newer_id, "Attaching update to chain head");
    }

    sqlx::query("INSERT INTO memory_updates (memory_id, superseded_by, created_at) VALUES (?, ?, ?)")
        .bind(&head)
        .bind(newer_id)
        .bind(at)
        .execute(&mut *conn)
        .await?;

    Ok(head)
}

// ============================================================================
// Version chains
// ============================================================================

/// Whether `memory_id` exists and belongs to (org, user).
pub async fn memory_belongs_to<'e>(
    executor: impl SqliteExecutor<'e>,
    org_id: &str,
    user_id: &str,
    memory_id: &str,
) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM memories WHERE org_id = ? AND user_id = ? AND id = ?")
            .bind(org_id)
            .bind(user_id)
            .bind(memory_id)
            .fetch_optional(executor)
            .await?;
    Ok(found.is_some())
}

/// Id of the newest version in the chain containing `memory_id`.
pub async fn chain_head<'e>(executor: impl SqliteExecutor<'e>, memory_id: &str) -> Result<String> {
    let head: Option<String> = sqlx::query_scalar(
        r#"
        WITH RECURSIVE chain(id, depth) AS (
            SELECT ?, 0
            UNION ALL
            SELECT u.superseded_by, chain.depth + 1
            FROM memory_updates u JOIN chain ON u.memory_id = chain.id
        )
        SELECT id FROM chain ORDER BY depth DESC LIMIT 1
        "#,
    )
    .bind(memory_id)
    .fetch_optional(executor)
    .await?;

    Ok(head.unwrap_or_else(|| memory_id.to_string()))
}

/// Resolve memory ids to the current versions of their chains.
///
/// Results come back in the order of `ids`, as `(requested id, head)`.
/// Ids not present in the graph are skipped. With `user_id` set, only
/// that user's memories are resolved.
pub async fn resolve_current(
    pool: &DbPool,
    org_id: &str,
    user_id: Option<&str>,
    ids: &[String],
) -> Result<Vec<(String, Memory)>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }

    let query = format!(
        r#"
        WITH RECURSIVE chain(start_id, id, depth) AS (
            SELECT id, id, 0 FROM memories
            WHERE org_id = ? AND (? IS NULL OR user_id = ?) AND id IN ({})
            UNION ALL
            SELECT chain.start_id, u.superseded_by, chain.depth + 1
            FROM chain JOIN memory_updates u ON u.memory_id = chain.id
        )
        SELECT chain.start_id AS start_id, m.*
        FROM chain JOIN memories m ON m.id = chain.id
        WHERE NOT EXISTS (SELECT 1 FROM memory_updates u WHERE u.memory_id = chain.id)
        "#,
        placeholders(ids.len())
    );

    let mut q = sqlx::query_as::<_, ResolvedRow>(&query)
        .bind(org_id)
        .bind(user_id)
        .bind(user_id);
    for id in ids {
        q = q.bind(id);
    }

    let mut by_start: HashMap<String, Memory> = q
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| (row.start_id, row.memory))
        .collect();

    let mut resolved: Vec<(String, Memory)> = ids
        .iter()
        .filter_map(|id| by_start.remove(id).map(|m| (id.clone(), m)))
        .collect();

    let heads: Vec<Memory> = resolved.iter().map(|(_, m)| m.clone()).collect();
    let heads = attach_sources(pool, heads).await?;
    for ((_, slot), head) in resolved.iter_mut().zip(heads) {
        *slot = head;
    }

    Ok(resolved)
}

/// Every version in the chain containing `memory_id`, newest first.
pub async fn memory_history(
    pool: &DbPool,
    org_id: &str,
    user_id: &str,
    memory_id: &str,
) -> Result<Vec<Memory>> {
    // Existence and tenancy check
    get_memory(pool, org_id, user_id, memory_id).await?;

    let head = chain_head(pool, memory_id).await?;

    let history = sqlx::query_as::<_, Memory>(
        r#"
        WITH RECURSIVE back(id, depth) AS (
            SELECT ?, 0
            UNION ALL
            SELECT u.memory_id, back.depth + 1
            FROM memory_updates u JOIN back ON u.superseded_by = back.id
        )
        SELECT m.* FROM back JOIN memories m ON m.id = back.id
        WHERE m.org_id = ? AND m.user_id = ?
        ORDER BY back.depth
        "#,
    )
    .bind(&head)
    .bind(org_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    attach_sources(pool, history).await
}

// ============================================================================
// Reads
// ============================================================================

pub async fn get_memory(
    pool: &DbPool,
    org_id: &str,
    user_id: &str,
    memory_id: &str,
) -> Result<Memory> {
    let memory = sqlx::query_as::<_, Memory>(
        "SELECT * FROM memories WHERE org_id = ? AND user_id = ? AND id = ?",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(memory_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("Memory not found: {}", memory_id)))?;

    let mut memories = attach_sources(pool, vec![memory]).await?;
    memories
        .pop()
        .ok_or_else(|| Error::Internal("memory vanished while loading sources".to_string()))
}

/// List a user's memories, newest first, optionally for one agent.
pub async fn list_memories(
    pool: &DbPool,
    org_id: &str,
    user_id: &str,
    agent_id: Option<&str>,
    page: Page,
) -> Result<Vec<Memory>> {
    let memories = sqlx::query_as::<_, Memory>(
        r#"
        SELECT * FROM memories
        WHERE org_id = ? AND user_id = ? AND (? IS NULL OR agent_id = ?)
        ORDER BY obtained_at DESC, id
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .bind(agent_id)
    .bind(agent_id)
    .bind(page.limit)
    .bind(page.skip)
    .fetch_all(pool)
    .await?;

    attach_sources(pool, memories).await
}

/// Memories extracted from one interaction, in write order.
pub async fn interaction_memories(
    pool: &DbPool,
    org_id: &str,
    user_id: &str,
    interaction_id: &str,
) -> Result<Vec<Memory>> {
    let memories = sqlx::query_as::<_, Memory>(
        r#"
        SELECT * FROM memories
        WHERE org_id = ? AND user_id = ? AND interaction_id = ?
        ORDER BY obtained_at, rowid
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .bind(interaction_id)
    .fetch_all(pool)
    .await?;

    attach_sources(pool, memories).await
}

/// Fill `message_sources` for each memory.
pub async fn attach_sources(pool: &DbPool, mut memories: Vec<Memory>) -> Result<Vec<Memory>> {
    if memories.is_empty() {
        return Ok(memories);
    }

    let query = format!(
        r#"
        SELECT memory_id, position, role, content FROM memory_sources
        WHERE memory_id IN ({})
        ORDER BY memory_id, position
        "#,
        placeholders(memories.len())
    );
    let mut q = sqlx::query_as::<_, (String, i64, String, String)>(&query);
    for memory in &memories {
        q = q.bind(&memory.id);
    }

    let mut sources: HashMap<String, Vec<PositionedMessage>> = HashMap::new();
    for (memory_id, position, role, content) in q.fetch_all(pool).await? {
        sources.entry(memory_id).or_default().push(PositionedMessage {
            position,
            role,
            content,
        });
    }

    for memory in &mut memories {
        memory.message_sources = sources.remove(&memory.id).unwrap_or_default();
    }

    Ok(memories)
}

// ============================================================================
// Deletes
// ============================================================================

/// Delete one memory. Version edges touching it are removed with it, so
/// an older version it had superseded becomes current again.
pub async fn delete_memory(
    pool: &DbPool,
    org_id: &str,
    user_id: &str,
    memory_id: &str,
) -> Result<()> {
    let result = sqlx::query("DELETE FROM memories WHERE org_id = ? AND user_id = ? AND id = ?")
        .bind(org_id)
        .bind(user_id)
        .bind(memory_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Memory not found: {}", memory_id)));
    }

    Ok(())
}

/// Delete all of a user's memories, keeping their interactions.
/// Returns the deleted ids.
pub async fn delete_user_memories(pool: &DbPool, org_id: &str, user_id: &str) -> Result<Vec<String>> {
    let ids: Vec<String> =
        sqlx::query_scalar("DELETE FROM memories WHERE org_id = ? AND user_id = ? RETURNING id")
            .bind(org_id)
            .bind(user_id)
            .fetch_all(pool)
            .await?;

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        create_organization, create_user, init_pool, initialize_schema, insert_interaction,
    };
    use memora_models::Interaction;

    struct Fixture {
        pool: DbPool,
        org: String,
        user: String,
    }

    async fn setup_test_db() -> Fixture {
        let pool = init_pool(":memory:").await.unwrap();
        initialize_schema(&pool).await.unwrap();
        let org = create_organization(&pool, "Acme").await.unwrap();
        let user = create_user(&pool, &org.id, "Sam").await.unwrap();
        let now = memora_models::now();
        insert_interaction(
            &pool,
            &Interaction {
                org_id: org.id.clone(),
                user_id: user.id.clone(),
                id: "i1".to_string(),
                agent_id: "a1".to_string(),
                created_at: now,
                updated_at: now,
            },
        )
        .await
        .unwrap();
        Fixture {
            pool,
            org: org.id,
            user: user.id,
        }
    }

    fn memory(f: &Fixture, id: &str, text: &str) -> Memory {
        Memory {
            org_id: f.org.clone(),
            user_id: f.user.clone(),
            agent_id: "a1".to_string(),
            interaction_id: "i1".to_string(),
            id: id.to_string(),
            memory: text.to_string(),
            obtained_at: memora_models::now(),
            message_sources: vec![PositionedMessage {
                position: 0,
                role: "user".to_string(),
                content: text.to_string(),
            }],
        }
    }

    async fn insert(f: &Fixture, m: &Memory) {
        let mut conn = f.pool.acquire().await.unwrap();
        insert_memory(&mut conn, m).await.unwrap();
    }

    async fn supersede(f: &Fixture, older: &str, newer: &str) -> String {
        let mut conn = f.pool.acquire().await.unwrap();
        insert_supersedes(&mut conn, older, newer, memora_models::now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_with_sources() {
        let f = setup_test_db().await;
        insert(&f, &memory(&f, "m1", "likes tea")).await;

        let loaded = get_memory(&f.pool, &f.org, &f.user, "m1").await.unwrap();
        assert_eq!(loaded.memory, "likes tea");
        assert_eq!(loaded.message_sources.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_follows_chain_to_head() {
        let f = setup_test_db().await;
        insert(&f, &memory(&f, "m1", "likes cilantro")).await;
        insert(&f, &memory(&f, "m2", "hates cilantro")).await;
        insert(&f, &memory(&f, "m3", "likes tea")).await;
        supersede(&f, "m1", "m2").await;

        let ids = vec!["m3".to_string(), "m1".to_string(), "missing".to_string()];
        let resolved = resolve_current(&f.pool, &f.org, Some(&f.user), &ids)
            .await
            .unwrap();

        let pairs: Vec<(&str, &str)> = resolved
            .iter()
            .map(|(start, m)| (start.as_str(), m.id.as_str()))
            .collect();
        assert_eq!(pairs, vec![("m3", "m3"), ("m1", "m2")]);
        assert_eq!(resolved[1].1.message_sources[0].content, "hates cilantro");
    }

    #[tokio::test]
    async fn test_superseding_old_version_attaches_to_head() {
        let f = setup_test_db().await;
        insert(&f, &memory(&f, "m1", "v1")).await;
        insert(&f, &memory(&f, "m2", "v2")).await;
        insert(&f, &memory(&f, "m3", "v3")).await;

        assert_eq!(supersede(&f, "m1", "m2").await, "m1");
        assert_eq!(supersede(&f, "m1", "m3").await, "m2");

        let history = memory_history(&f.pool, &f.org, &f.user, "m2").await.unwrap();
        let ids: Vec<&str> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m2", "m1"]);
    }

    #[tokio::test]
    async fn test_resolve_respects_user_scope() {
        let f = setup_test_db().await;
        insert(&f, &memory(&f, "m1", "likes tea")).await;

        let ids = vec!["m1".to_string()];
        let other = resolve_current(&f.pool, &f.org, Some("someone-else"), &ids)
            .await
            .unwrap();
        assert!(other.is_empty());

        let org_wide = resolve_current(&f.pool, &f.org, None, &ids).await.unwrap();
        assert_eq!(org_wide.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_head_restores_previous_version() {
        let f = setup_test_db().await;
        insert(&f, &memory(&f, "m1", "v1")).await;
        insert(&f, &memory(&f, "m2", "v2")).await;
        supersede(&f, "m1", "m2").await;

        delete_memory(&f.pool, &f.org, &f.user, "m2").await.unwrap();

        assert_eq!(chain_head(&f.pool, "m1").await.unwrap(), "m1");
    }

    #[tokio::test]
    async fn test_delete_user_memories_keeps_interactions() {
        let f = setup_test_db().await;
        insert(&f, &memory(&f, "m1", "v1")).await;
        insert(&f, &memory(&f, "m2", "v2")).await;

        let mut ids = delete_user_memories(&f.pool, &f.org, &f.user).await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert!(crate::db::get_interaction(&f.pool, &f.org, &f.user, "i1").await.is_ok());
    }
}
