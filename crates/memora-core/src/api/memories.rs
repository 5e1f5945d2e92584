//! Memories Routes
//!
//! Read and delete operations for a user's memories. Memories are created
//! and superseded only through interaction writes.
//!
//! Routes (under /orgs/:org_id/users/:user_id/memories):
//! - GET / - List memories (optionally by agent)
//! - DELETE / - Delete every memory of the user
//! - GET /:memory_id - Get one memory with its source messages
//! - DELETE /:memory_id - Delete one memory
//! - GET /:memory_id/history - Version chain, newest first

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use memora_models::{Memory, MemoryListParams};

use crate::{AppState, Result};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_memories).delete(delete_all_memories))
        .route("/:memory_id", get(get_memory).delete(delete_memory))
        .route("/:memory_id/history", get(memory_history))
}

#[derive(Debug, Deserialize)]
pub struct UserPath {
    pub org_id: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MemoryPath {
    pub org_id: String,
    pub user_id: String,
    pub memory_id: String,
}

async fn list_memories(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    Query(params): Query<MemoryListParams>,
) -> Result<Json<Vec<Memory>>> {
    Ok(Json(
        state
            .memora
            .list_memories(&path.org_id, &path.user_id, params)
            .await?,
    ))
}

async fn delete_all_memories(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
) -> Result<Json<serde_json::Value>> {
    state
        .memora
        .delete_all_memories(&path.org_id, &path.user_id)
        .await?;
    Ok(Json(json!({ "deleted": true })))
}

async fn get_memory(
    State(state): State<AppState>,
    Path(path): Path<MemoryPath>,
) -> Result<Json<Memory>> {
    Ok(Json(
        state
            .memora
            .get_memory(&path.org_id, &path.user_id, &path.memory_id)
            .await?,
    ))
}

/// Deleting the newest version makes the previous one current again.
async fn delete_memory(
    State(state): State<AppState>,
    Path(path): Path<MemoryPath>,
) -> Result<Json<serde_json::Value>> {
    state
        .memora
        .delete_memory(&path.org_id, &path.user_id, &path.memory_id)
        .await?;
    Ok(Json(json!({ "deleted": true, "id": path.memory_id })))
}

async fn memory_history(
    State(state): State<AppState>,
    Path(path): Path<MemoryPath>,
) -> Result<Json<Vec<Memory>>> {
    Ok(Json(
        state
            .memora
            .memory_history(&path.org_id, &path.user_id, &path.memory_id)
            .await?,
    ))
}
