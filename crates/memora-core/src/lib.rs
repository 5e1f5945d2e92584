//! Memora - versioned conversational memory
//!
//! Library exports for the server binary and integration tests.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod state;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub use config::config;
pub use error::{Error, Result};
pub use services::Memora;
pub use state::AppState;

/// Build the HTTP application with its middleware stack.
pub fn app(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .merge(api::routes())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
