//! Relationship graph store for Memora.
//!
//! The graph lives in SQLite: tenancy rows, interaction headers, the
//! positioned message chain, memories with copied sources, and the
//! `memory_updates` version edges. Composite keys carry the tenancy path
//! so deleting a node removes its whole subgraph through `ON DELETE CASCADE`.
//!
//! Read helpers take `&DbPool`. Anything that must be part of an atomic
//! write takes `&mut SqliteConnection` so it can run inside a transaction.

mod interactions;
mod memories;
mod tenancy;

pub use interactions::*;
pub use memories::*;
pub use tenancy::*;

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Type alias for the SQLite connection pool.
pub type DbPool = sqlx::SqlitePool;

/// Initialize the database connection pool.
///
/// `:memory:` gets a single long-lived connection; every SQLite in-memory
/// connection is its own database.
pub async fn init_pool(path: &str) -> Result<DbPool> {
    let in_memory = path == ":memory:" || path.starts_with("sqlite::memory:");

    if !in_memory {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
    }

    let mut options = SqliteConnectOptions::from_str(path)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(true)
        .pragma("temp_store", "memory");

    if !in_memory {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Negative = KB
            .pragma("cache_size", "-64000");
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
    };

    let pool = pool_options
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    info!("Database pool initialized: {}", path);

    Ok(pool)
}

/// Initialize the database schema.
///
/// Applies the complete schema from schema.sql. Uses IF NOT EXISTS
/// clauses so it's safe to run multiple times.
pub async fn initialize_schema(pool: &DbPool) -> Result<()> {
    let schema = include_str!("../../schema.sql");

    info!("Initializing database schema");

    for statement in schema.split(';') {
        // Strip comment lines, keeping only actual SQL
        let clean_stmt: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let clean_stmt = clean_stmt.trim();
        if clean_stmt.is_empty() {
            continue;
        }
        sqlx::query(clean_stmt).execute(pool).await?;
    }

    info!("Database schema initialized successfully");

    Ok(())
}

/// `?, ?, ?` for a dynamic `IN (...)` list.
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
