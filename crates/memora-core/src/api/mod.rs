//! API Routes for Memora
//!
//! This module combines all API routes into a single router.
//! Routes are organized by resource and nested under `/v1`.

mod health;
mod interactions;
mod memories;
mod search;
mod tenancy;

use axum::Router;

use crate::AppState;

/// Build the complete API router.
///
/// Route structure:
/// - /health - Liveness (public)
/// - /v1/orgs/* - Organizations, users and agents
/// - /v1/orgs/:org_id/users/:user_id/interactions/* - Interactions
/// - /v1/orgs/:org_id/users/:user_id/memories/* - Memories
/// - /v1/orgs/:org_id/search, /v1/orgs/:org_id/users/:user_id/recall - Retrieval
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .nest("/v1", v1_routes())
}

fn v1_routes() -> Router<AppState> {
    Router::new()
        .nest("/orgs", tenancy::org_routes())
        .nest("/orgs/:org_id/users", tenancy::user_routes())
        .nest("/orgs/:org_id/agents", tenancy::agent_routes())
        .nest(
            "/orgs/:org_id/users/:user_id/interactions",
            interactions::routes(),
        )
        .nest("/orgs/:org_id/users/:user_id/memories", memories::routes())
        .merge(search::routes())
}
