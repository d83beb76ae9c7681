//! Run API Handlers
//!
//! Triggering, inspecting and cancelling pipeline runs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use conduit_core::domain::run::{PipelineRun, Trigger, TriggerSource};
use conduit_core::dto::log::StageLogs;
use conduit_core::dto::run::{RunAccepted, RunStatus, TriggerRun};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::service::Orchestrator;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

/// POST /runs
/// Trigger a run manually
pub async fn trigger_run(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(req): Json<TriggerRun>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    let branch = req
        .branch
        .unwrap_or_else(|| orchestrator.tracked_branch().to_string());
    tracing::info!("Manual trigger for branch {}", branch);

    let trigger = match req.commit {
        Some(commit) => Trigger::at_commit(branch, commit, TriggerSource::Manual),
        None => Trigger::manual(branch),
    };
    let run_id = orchestrator.trigger(trigger).await?;

    Ok((StatusCode::ACCEPTED, Json(accepted(run_id))))
}

/// GET /runs
/// List recent runs, newest first
pub async fn list_runs(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<RunStatus>>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    tracing::debug!("Listing up to {} runs", limit);

    Ok(Json(orchestrator.list_runs(limit).await?))
}

/// GET /runs/{id}
/// Run status with current stage and console link
pub async fn get_run(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunStatus>> {
    tracing::debug!("Getting run: {}", id);
    Ok(Json(orchestrator.status(id).await?))
}

/// GET /runs/{id}/detail
/// Full run record including every stage
pub async fn get_run_detail(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    Ok(Json(orchestrator.get_run(id).await?))
}

/// POST /runs/{id}/cancel
pub async fn cancel_run(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<RunStatus>)> {
    tracing::info!("Cancel requested for run {}", id);
    let status = orchestrator.cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

/// GET /runs/{id}/logs/{stage}
pub async fn get_stage_logs(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path((id, stage)): Path<(Uuid, String)>,
) -> ApiResult<Json<StageLogs>> {
    tracing::debug!("Getting logs for run {} stage {}", id, stage);
    Ok(Json(orchestrator.stage_logs(id, &stage).await?))
}

pub(crate) fn accepted(run_id: Uuid) -> RunAccepted {
    RunAccepted {
        run_id,
        status_url: format!("/runs/{}", run_id),
    }
}
