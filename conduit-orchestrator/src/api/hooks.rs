//! Webhook API Handlers
//!
//! Push notifications from the source repository.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use conduit_core::dto::run::SourceEvent;
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::api::runs::accepted;
use crate::service::Orchestrator;

/// POST /hooks/source
/// Starts a run for pushes to the tracked branch; other branches get 204
pub async fn source_event(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(event): Json<SourceEvent>,
) -> ApiResult<Response> {
    tracing::info!("Push to {} at {}", event.branch, event.commit);

    match orchestrator.handle_source_event(event).await? {
        Some(run_id) => Ok((StatusCode::ACCEPTED, Json(accepted(run_id))).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
