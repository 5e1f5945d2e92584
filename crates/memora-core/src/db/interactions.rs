//! Interaction headers and their positioned message chains.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqliteExecutor};

use crate::{Error, Result};
use memora_models::{Interaction, MessageBlock, Page, PositionedMessage};

use super::DbPool;

// ============================================================================
// Interaction headers
// ============================================================================

pub async fn insert_interaction<'e>(
    executor: impl SqliteExecutor<'e>,
    interaction: &Interaction,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO interactions (org_id, user_id, id, agent_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&interaction.org_id)
    .bind(&interaction.user_id)
    .bind(&interaction.id)
    .bind(&interaction.agent_id)
    .bind(interaction.created_at)
    .bind(interaction.updated_at)
    .execute(executor)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            Error::AlreadyExists(format!("Interaction already exists: {}", interaction.id))
        }
        _ => Error::Database(e),
    })?;

    Ok(())
}

pub async fn get_interaction<'e>(
    executor: impl SqliteExecutor<'e>,
    org_id: &str,
    user_id: &str,
    interaction_id: &str,
) -> Result<Interaction> {
    sqlx::query_as::<_, Interaction>(
        "SELECT * FROM interactions WHERE org_id = ? AND user_id = ? AND id = ?",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(interaction_id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| Error::NotFound(format!("Interaction not found: {}", interaction_id)))
}

/// Record the agent and time of the latest write.
pub async fn touch_interaction<'e>(
    executor: impl SqliteExecutor<'e>,
    org_id: &str,
    user_id: &str,
    interaction_id: &str,
    agent_id: &str,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE interactions SET agent_id = ?, updated_at = ?
        WHERE org_id = ? AND user_id = ? AND id = ?
        "#,
    )
    .bind(agent_id)
    .bind(updated_at)
    .bind(org_id)
    .bind(user_id)
    .bind(interaction_id)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Interaction not found: {}", interaction_id)));
    }

    Ok(())
}

/// List a user's interactions, most recently updated first.
pub async fn list_interactions(
    pool: &DbPool,
    org_id: &str,
    user_id: &str,
    page: Page,
) -> Result<Vec<Interaction>> {
    sqlx::query_as::<_, Interaction>(
        r#"
        SELECT * FROM interactions
        WHERE org_id = ? AND user_id = ?
        ORDER BY updated_at DESC, id
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .bind(page.limit)
    .bind(page.skip)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Delete an interaction with its messages and memories.
///
/// Returns the ids of the deleted memories so the caller can drop them
/// from the semantic index.
pub async fn delete_interaction(
    pool: &DbPool,
    org_id: &str,
    user_id: &str,
    interaction_id: &str,
) -> Result<Vec<String>> {
    let mut tx = pool.begin().await?;

    let memory_ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM memories WHERE org_id = ? AND user_id = ? AND interaction_id = ?",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(interaction_id)
    .fetch_all(&mut *tx)
    .await?;

    let result = sqlx::query("DELETE FROM interactions WHERE org_id = ? AND user_id = ? AND id = ?")
        .bind(org_id)
        .bind(user_id)
        .bind(interaction_id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Interaction not found: {}", interaction_id)));
    }

    tx.commit().await?;
    Ok(memory_ids)
}

/// Delete every interaction of a user. Returns the deleted memory ids.
pub async fn delete_user_interactions(
    pool: &DbPool,
    org_id: &str,
    user_id: &str,
) -> Result<Vec<String>> {
    let mut tx = pool.begin().await?;

    let memory_ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM memories WHERE org_id = ? AND user_id = ?")
            .bind(org_id)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?;

    sqlx::query("DELETE FROM interactions WHERE org_id = ? AND user_id = ?")
        .bind(org_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(memory_ids)
}

// ============================================================================
// Message chain
// ============================================================================

/// Messages of an interaction in chain order.
pub async fn get_messages<'e>(
    executor: impl SqliteExecutor<'e>,
    org_id: &str,
    user_id: &str,
    interaction_id: &str,
) -> Result<Vec<PositionedMessage>> {
    sqlx::query_as::<_, PositionedMessage>(
        r#"
        SELECT position, role, content FROM messages
        WHERE org_id = ? AND user_id = ? AND interaction_id = ?
        ORDER BY position
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .bind(interaction_id)
    .fetch_all(executor)
    .await
    .map_err(Error::Database)
}

/// Write `messages` at positions `start..start + len`.
pub async fn append_messages(
    conn: &mut SqliteConnection,
    org_id: &str,
    user_id: &str,
    interaction_id: &str,
    start: i64,
    messages: &[MessageBlock],
) -> Result<()> {
    for (offset, message) in messages.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO messages (org_id, user_id, interaction_id, position, role, content)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(interaction_id)
        .bind(start + offset as i64)
        .bind(&message.role)
        .bind(&message.content)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Delete every message at or after `from`. Returns the number removed.
pub async fn truncate_messages<'e>(
    executor: impl SqliteExecutor<'e>,
    org_id: &str,
    user_id: &str,
    interaction_id: &str,
    from: i64,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM messages
        WHERE org_id = ? AND user_id = ? AND interaction_id = ? AND position >= ?
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .bind(interaction_id)
    .bind(from)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
