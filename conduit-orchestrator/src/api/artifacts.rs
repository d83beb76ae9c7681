//! Artifact API Handlers
//!
//! Read-only access to stage bundles through the orchestrator role.

use axum::{
    Json,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use conduit_core::domain::artifact::ArtifactVersion;
use conduit_core::dto::artifact::ArtifactVersions;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::service::Orchestrator;

/// GET /runs/{id}/artifacts/{stage}
pub async fn list_versions(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path((id, stage)): Path<(Uuid, String)>,
) -> ApiResult<Json<ArtifactVersions>> {
    tracing::debug!("Listing artifact versions for run {} stage {}", id, stage);
    Ok(Json(orchestrator.artifact_versions(id, &stage).await?))
}

/// GET /runs/{id}/artifacts/{stage}/{version}
/// Downloads a bundle; `version` is `latest`, `3` or `v3`
pub async fn download(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path((id, stage, version)): Path<(Uuid, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let version = parse_version(&version)?;
    let bytes = orchestrator.artifact(id, &stage, version).await?;

    let label = version.map(|v| v.to_string()).unwrap_or_else(|| "latest".to_string());
    let disposition = format!("attachment; filename=\"{}-{}.tar\"", stage, label);

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-tar".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

fn parse_version(raw: &str) -> ApiResult<Option<ArtifactVersion>> {
    if raw == "latest" {
        return Ok(None);
    }
    raw.trim_start_matches('v')
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .map(|n| Some(ArtifactVersion(n)))
        .ok_or_else(|| ApiError::BadRequest(format!("invalid artifact version '{}'", raw)))
}
