//! Tenancy records: organizations own users and agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "sqlx")]
use sqlx::FromRow;

/// Tenant root. Every other record is keyed under an organization id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
#[serde(rename_all = "snake_case")]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A user belonging to exactly one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
#[serde(rename_all = "snake_case")]
pub struct User {
    pub org_id: String,
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An agent belonging to an organization, optionally scoped to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
#[serde(rename_all = "snake_case")]
pub struct Agent {
    pub org_id: String,
    pub id: String,
    pub label: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Request model for creating an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationCreate {
    pub name: String,
}

/// Request model for creating a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCreate {
    pub name: String,
}

/// Request model for creating an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCreate {
    pub label: String,
    /// Ties the agent to a single user of the organization.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Rename request shared by organizations, users and agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rename {
    pub name: String,
}

/// Pagination parameters for list endpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
}

fn default_page_limit() -> i64 {
    100
}

impl Default for Page {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: default_page_limit(),
        }
    }
}

impl Page {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self { skip, limit }
    }
}
