//! Interaction Routes
//!
//! Routes (under /orgs/:org_id/users/:user_id/interactions):
//! - POST / - Save a conversation and extract memories
//! - GET / - List interactions, most recently updated first
//! - DELETE / - Delete every interaction of the user
//! - GET /:interaction_id - Messages and memories of one interaction
//! - PUT /:interaction_id - Replace the conversation and re-extract
//! - DELETE /:interaction_id - Delete one interaction with its memories

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use memora_models::{Interaction, InteractionDetail, InteractionSaved, InteractionWrite, Page};

use crate::{AppState, Result};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(list_interactions)
                .post(save_interaction)
                .delete(delete_all_interactions),
        )
        .route(
            "/:interaction_id",
            get(get_interaction)
                .put(update_interaction)
                .delete(delete_interaction),
        )
}

#[derive(Debug, Deserialize)]
pub struct UserPath {
    pub org_id: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct InteractionPath {
    pub org_id: String,
    pub user_id: String,
    pub interaction_id: String,
}

/// Optional override of the configured generation retries.
#[derive(Debug, Deserialize, Default)]
pub struct WriteQuery {
    pub max_retries: Option<u32>,
}

/// POST /orgs/:org_id/users/:user_id/interactions
#[axum::debug_handler]
async fn save_interaction(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    Query(query): Query<WriteQuery>,
    Json(body): Json<InteractionWrite>,
) -> Result<(StatusCode, Json<InteractionSaved>)> {
    let saved = state
        .memora
        .save_interaction(&path.org_id, &path.user_id, body, query.max_retries)
        .await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn list_interactions(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<Interaction>>> {
    Ok(Json(
        state
            .memora
            .list_interactions(&path.org_id, &path.user_id, page)
            .await?,
    ))
}

async fn delete_all_interactions(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
) -> Result<Json<serde_json::Value>> {
    state
        .memora
        .delete_all_interactions(&path.org_id, &path.user_id)
        .await?;
    Ok(Json(json!({ "deleted": true })))
}

async fn get_interaction(
    State(state): State<AppState>,
    Path(path): Path<InteractionPath>,
) -> Result<Json<InteractionDetail>> {
    Ok(Json(
        state
            .memora
            .get_interaction(&path.org_id, &path.user_id, &path.interaction_id)
            .await?,
    ))
}

/// PUT /orgs/:org_id/users/:user_id/interactions/:interaction_id
#[axum::debug_handler]
async fn update_interaction(
    State(state): State<AppState>,
    Path(path): Path<InteractionPath>,
    Query(query): Query<WriteQuery>,
    Json(body): Json<InteractionWrite>,
) -> Result<Json<InteractionSaved>> {
    Ok(Json(
        state
            .memora
            .update_interaction(
                &path.org_id,
                &path.user_id,
                &path.interaction_id,
                body,
                query.max_retries,
            )
            .await?,
    ))
}

async fn delete_interaction(
    State(state): State<AppState>,
    Path(path): Path<InteractionPath>,
) -> Result<Json<serde_json::Value>> {
    state
        .memora
        .delete_interaction(&path.org_id, &path.user_id, &path.interaction_id)
        .await?;
    Ok(Json(json!({ "deleted": true, "id": path.interaction_id })))
}
