//! Organization, user and agent queries.

use std::collections::HashMap;

use crate::{Error, Result};
use memora_models::{Agent, Organization, Page, User};

use super::{placeholders, DbPool};

// ============================================================================
// Organizations
// ============================================================================

pub async fn create_organization(pool: &DbPool, name: &str) -> Result<Organization> {
    sqlx::query_as::<_, Organization>(
        r#"
        INSERT INTO organizations (id, name, created_at)
        VALUES (?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(memora_models::short_id())
    .bind(name)
    .bind(memora_models::now())
    .fetch_one(pool)
    .await
    .map_err(Error::Database)
}

pub async fn get_organization(pool: &DbPool, org_id: &str) -> Result<Organization> {
    sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = ?")
        .bind(org_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Organization not found: {}", org_id)))
}

pub async fn list_organizations(pool: &DbPool, page: Page) -> Result<Vec<Organization>> {
    sqlx::query_as::<_, Organization>(
        "SELECT * FROM organizations ORDER BY created_at, id LIMIT ? OFFSET ?",
    )
    .bind(page.limit)
    .bind(page.skip)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

pub async fn rename_organization(pool: &DbPool, org_id: &str, name: &str) -> Result<Organization> {
    sqlx::query_as::<_, Organization>(
        "UPDATE organizations SET name = ? WHERE id = ? RETURNING *",
    )
    .bind(name)
    .bind(org_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("Organization not found: {}", org_id)))
}

/// Delete an organization. Users, agents, interactions, messages and
/// memories go with it.
pub async fn delete_organization(pool: &DbPool, org_id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM organizations WHERE id = ?")
        .bind(org_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Organization not found: {}", org_id)));
    }

    Ok(())
}

// ============================================================================
// Users
// ============================================================================

pub async fn create_user(pool: &DbPool, org_id: &str, name: &str) -> Result<User> {
    get_organization(pool, org_id).await?;

    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (org_id, id, name, created_at)
        VALUES (?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(org_id)
    .bind(memora_models::short_id())
    .bind(name)
    .bind(memora_models::now())
    .fetch_one(pool)
    .await
    .map_err(Error::Database)
}

pub async fn get_user(pool: &DbPool, org_id: &str, user_id: &str) -> Result<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE org_id = ? AND id = ?")
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("User not found: {}", user_id)))
}

pub async fn list_users(pool: &DbPool, org_id: &str, page: Page) -> Result<Vec<User>> {
    sqlx::query_as::<_, User>(
        r#"
        SELECT * FROM users
        WHERE org_id = ?
        ORDER BY created_at, id
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(org_id)
    .bind(page.limit)
    .bind(page.skip)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

pub async fn rename_user(pool: &DbPool, org_id: &str, user_id: &str, name: &str) -> Result<User> {
    sqlx::query_as::<_, User>("UPDATE users SET name = ? WHERE org_id = ? AND id = ? RETURNING *")
        .bind(name)
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("User not found: {}", user_id)))
}

/// Delete a user together with their interactions, memories and
/// user-scoped agents.
pub async fn delete_user(pool: &DbPool, org_id: &str, user_id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM users WHERE org_id = ? AND id = ?")
        .bind(org_id)
        .bind(user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("User not found: {}", user_id)));
    }

    Ok(())
}

/// Display names for a set of user ids. Unknown ids are absent.
pub async fn user_names(
    pool: &DbPool,
    org_id: &str,
    user_ids: &[String],
) -> Result<HashMap<String, String>> {
    if user_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let query = format!(
        "SELECT id, name FROM users WHERE org_id = ? AND id IN ({})",
        placeholders(user_ids.len())
    );
    let mut q = sqlx::query_as::<_, (String, String)>(&query).bind(org_id);
    for id in user_ids {
        q = q.bind(id);
    }

    Ok(q.fetch_all(pool).await?.into_iter().collect())
}

// ============================================================================
// Agents
// ============================================================================

pub async fn create_agent(
    pool: &DbPool,
    org_id: &str,
    label: &str,
    user_id: Option<&str>,
) -> Result<Agent> {
    get_organization(pool, org_id).await?;
    if let Some(user_id) = user_id {
        get_user(pool, org_id, user_id).await?;
    }

    sqlx::query_as::<_, Agent>(
        r#"
        INSERT INTO agents (org_id, id, label, user_id, created_at)
        VALUES (?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(org_id)
    .bind(memora_models::short_id())
    .bind(label)
    .bind(user_id)
    .bind(memora_models::now())
    .fetch_one(pool)
    .await
    .map_err(Error::Database)
}

pub async fn get_agent(pool: &DbPool, org_id: &str, agent_id: &str) -> Result<Agent> {
    sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE org_id = ? AND id = ?")
        .bind(org_id)
        .bind(agent_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Agent not found: {}", agent_id)))
}

/// List agents of an organization. With `user_id`, only that user's
/// agents and the organization-wide ones are returned.
pub async fn list_agents(
    pool: &DbPool,
    org_id: &str,
    user_id: Option<&str>,
    page: Page,
) -> Result<Vec<Agent>> {
    sqlx::query_as::<_, Agent>(
        r#"
        SELECT * FROM agents
        WHERE org_id = ?
          AND (? IS NULL OR user_id IS NULL OR user_id = ?)
        ORDER BY created_at, id
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .bind(user_id)
    .bind(page.limit)
    .bind(page.skip)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

pub async fn rename_agent(pool: &DbPool, org_id: &str, agent_id: &str, label: &str) -> Result<Agent> {
    sqlx::query_as::<_, Agent>("UPDATE agents SET label = ? WHERE org_id = ? AND id = ? RETURNING *")
        .bind(label)
        .bind(org_id)
        .bind(agent_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Agent not found: {}", agent_id)))
}

/// Delete an agent. Interactions and memories it produced are kept.
pub async fn delete_agent(pool: &DbPool, org_id: &str, agent_id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM agents WHERE org_id = ? AND id = ?")
        .bind(org_id)
        .bind(agent_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Agent not found: {}", agent_id)));
    }

    Ok(())
}

/// Labels for a set of agent ids. Unknown ids are absent.
pub async fn agent_labels(
    pool: &DbPool,
    org_id: &str,
    agent_ids: &[String],
) -> Result<HashMap<String, String>> {
    if agent_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let query = format!(
        "SELECT id, label FROM agents WHERE org_id = ? AND id IN ({})",
        placeholders(agent_ids.len())
    );
    let mut q = sqlx::query_as::<_, (String, String)>(&query).bind(org_id);
    for id in agent_ids {
        q = q.bind(id);
    }

    Ok(q.fetch_all(pool).await?.into_iter().collect())
}
