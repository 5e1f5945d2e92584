//! Search Routes
//!
//! Routes:
//! - POST /orgs/:org_id/search - Batched hybrid search in org or user scope
//! - POST /orgs/:org_id/users/:user_id/recall - Memories relevant to a message

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;

use memora_models::{RecallOutcome, RecallRequest, SearchRequest, SearchResponse};

use crate::{AppState, Result};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/orgs/:org_id/search", post(search))
        .route("/orgs/:org_id/users/:user_id/recall", post(recall))
}

#[derive(Debug, Deserialize)]
pub struct OrgPath {
    pub org_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UserPath {
    pub org_id: String,
    pub user_id: String,
}

/// POST /orgs/:org_id/search
///
/// Returns one ranked list per query unless `flatten` or `top_p` is set.
#[axum::debug_handler]
async fn search(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    Ok(Json(state.memora.search(&path.org_id, body).await?))
}

/// POST /orgs/:org_id/users/:user_id/recall
#[axum::debug_handler]
async fn recall(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    Json(body): Json<RecallRequest>,
) -> Result<Json<RecallOutcome>> {
    Ok(Json(
        state
            .memora
            .recall_for_message(&path.org_id, &path.user_id, body)
            .await?,
    ))
}
