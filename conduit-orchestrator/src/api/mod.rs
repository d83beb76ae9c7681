//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod artifacts;
pub mod error;
pub mod health;
pub mod hooks;
pub mod runs;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::service::Orchestrator;

/// Create the main API router with all endpoints
pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Triggers
        .route("/runs", post(runs::trigger_run).get(runs::list_runs))
        .route("/hooks/source", post(hooks::source_event))
        // Run endpoints
        .route("/runs/{id}", get(runs::get_run))
        .route("/runs/{id}/detail", get(runs::get_run_detail))
        .route("/runs/{id}/cancel", post(runs::cancel_run))
        .route("/runs/{id}/logs/{stage}", get(runs::get_stage_logs))
        // Artifact endpoints
        .route("/runs/{id}/artifacts/{stage}", get(artifacts::list_versions))
        .route(
            "/runs/{id}/artifacts/{stage}/{version}",
            get(artifacts::download),
        )
        // Add state and middleware
        .with_state(orchestrator)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
