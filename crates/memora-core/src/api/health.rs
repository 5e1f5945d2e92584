//! Health check.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
    pub database: bool,
    pub index: bool,
    pub llm: Vec<LlmStatus>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct LlmStatus {
    pub role: &'static str,
    pub available: bool,
    pub providers: Vec<String>,
    pub last_error: Option<String>,
    pub consecutive_errors: u32,
}

/// GET /health
///
/// Always 200 while the process is serving; `database` reports whether a
/// trivial query succeeds and `index` whether a semantic index is configured.
/// A model role with no providers, or one that keeps failing, marks the
/// service degraded.
#[axum::debug_handler]
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();

    let mut llm = Vec::with_capacity(state.llm.len());
    for (role, service) in &state.llm {
        let (last_error, consecutive_errors) = match service.get_error_info().await {
            Some((message, count)) => (Some(message), count),
            None => (None, 0),
        };
        llm.push(LlmStatus {
            role: *role,
            available: service.is_available().await,
            providers: service.providers().await,
            last_error,
            consecutive_errors,
        });
    }
    let healthy = database && llm.iter().all(|l| l.available);

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION").into(),
        database,
        index: state.memora.has_index(),
        llm,
        timestamp: Utc::now(),
    })
}
