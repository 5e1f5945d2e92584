//! Tenancy Routes
//!
//! Routes:
//! - POST|GET /orgs, GET|PUT|DELETE /orgs/:org_id
//! - POST|GET /orgs/:org_id/users, GET|PUT|DELETE /orgs/:org_id/users/:user_id
//! - POST|GET /orgs/:org_id/agents, GET|PUT|DELETE /orgs/:org_id/agents/:agent_id

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use memora_models::{
    Agent, AgentCreate, Organization, OrganizationCreate, Page, Rename, User, UserCreate,
};

use crate::{AppState, Result};

pub fn org_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_organizations).post(create_organization))
        .route(
            "/:org_id",
            get(get_organization)
                .put(rename_organization)
                .delete(delete_organization),
        )
}

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_users).post(create_user))
        .route(
            "/:user_id",
            get(get_user).put(rename_user).delete(delete_user),
        )
}

pub fn agent_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents).post(create_agent))
        .route(
            "/:agent_id",
            get(get_agent).put(rename_agent).delete(delete_agent),
        )
}

// ============================================================================
// Path Extractors
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OrgPath {
    pub org_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UserPath {
    pub org_id: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AgentPath {
    pub org_id: String,
    pub agent_id: String,
}

/// Query for listing agents; `user_id` adds that user's personal agents.
#[derive(Debug, Deserialize)]
pub struct ListAgentsQuery {
    pub user_id: Option<String>,
    #[serde(default)]
    pub skip: i64,
    pub limit: Option<i64>,
}

impl ListAgentsQuery {
    fn page(&self) -> Page {
        Page::new(self.skip, self.limit.unwrap_or(Page::default().limit))
    }
}

// ============================================================================
// Organizations
// ============================================================================

async fn create_organization(
    State(state): State<AppState>,
    Json(body): Json<OrganizationCreate>,
) -> Result<(StatusCode, Json<Organization>)> {
    let org = state.memora.create_organization(&body.name).await?;
    Ok((StatusCode::CREATED, Json(org)))
}

async fn list_organizations(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<Organization>>> {
    Ok(Json(state.memora.list_organizations(page).await?))
}

async fn get_organization(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
) -> Result<Json<Organization>> {
    Ok(Json(state.memora.get_organization(&path.org_id).await?))
}

async fn rename_organization(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    Json(body): Json<Rename>,
) -> Result<Json<Organization>> {
    Ok(Json(
        state
            .memora
            .rename_organization(&path.org_id, &body.name)
            .await?,
    ))
}

async fn delete_organization(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
) -> Result<Json<serde_json::Value>> {
    state.memora.delete_organization(&path.org_id).await?;
    Ok(Json(json!({ "deleted": true, "id": path.org_id })))
}

// ============================================================================
// Users
// ============================================================================

async fn create_user(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    Json(body): Json<UserCreate>,
) -> Result<(StatusCode, Json<User>)> {
    let user = state.memora.create_user(&path.org_id, &body.name).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn list_users(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<User>>> {
    Ok(Json(state.memora.list_users(&path.org_id, page).await?))
}

async fn get_user(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
) -> Result<Json<User>> {
    Ok(Json(
        state.memora.get_user(&path.org_id, &path.user_id).await?,
    ))
}

async fn rename_user(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    Json(body): Json<Rename>,
) -> Result<Json<User>> {
    Ok(Json(
        state
            .memora
            .rename_user(&path.org_id, &path.user_id, &body.name)
            .await?,
    ))
}

async fn delete_user(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
) -> Result<Json<serde_json::Value>> {
    state.memora.delete_user(&path.org_id, &path.user_id).await?;
    Ok(Json(json!({ "deleted": true, "id": path.user_id })))
}

// ============================================================================
// Agents
// ============================================================================

async fn create_agent(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    Json(body): Json<AgentCreate>,
) -> Result<(StatusCode, Json<Agent>)> {
    let agent = state
        .memora
        .create_agent(&path.org_id, &body.label, body.user_id.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn list_agents(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<Vec<Agent>>> {
    Ok(Json(
        state
            .memora
            .list_agents(&path.org_id, query.user_id.as_deref(), query.page())
            .await?,
    ))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(path): Path<AgentPath>,
) -> Result<Json<Agent>> {
    Ok(Json(
        state.memora.get_agent(&path.org_id, &path.agent_id).await?,
    ))
}

/// PUT /orgs/:org_id/agents/:agent_id with `{"name": ...}` sets the label.
async fn rename_agent(
    State(state): State<AppState>,
    Path(path): Path<AgentPath>,
    Json(body): Json<Rename>,
) -> Result<Json<Agent>> {
    Ok(Json(
        state
            .memora
            .rename_agent(&path.org_id, &path.agent_id, &body.name)
            .await?,
    ))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(path): Path<AgentPath>,
) -> Result<Json<serde_json::Value>> {
    state
        .memora
        .delete_agent(&path.org_id, &path.agent_id)
        .await?;
    Ok(Json(json!({ "deleted": true, "id": path.agent_id })))
}
