//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use conduit_core::PipelineError;

use crate::repository::RepositoryError;
use crate::service::OrchestratorError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    DatabaseError(sqlx::Error),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::RunNotFound(_)
            | OrchestratorError::StageNotFound(_)
            | OrchestratorError::ArtifactNotFound(_) => ApiError::NotFound(err.to_string()),
            OrchestratorError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            OrchestratorError::AlreadyFinished(_) => ApiError::Conflict(err.to_string()),
            OrchestratorError::Pipeline(e @ PipelineError::Authorization { .. }) => {
                ApiError::Forbidden(e.to_string())
            }
            OrchestratorError::Pipeline(e) => ApiError::InternalError(e.to_string()),
            OrchestratorError::Repository(RepositoryError::Database(e)) => ApiError::DatabaseError(e),
            OrchestratorError::Repository(e) => ApiError::InternalError(e.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::access::Action;
    use uuid::Uuid;

    fn status(err: OrchestratorError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status(OrchestratorError::RunNotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(OrchestratorError::InvalidRequest("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(OrchestratorError::AlreadyFinished(Uuid::new_v4())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(OrchestratorError::Pipeline(PipelineError::Authorization {
                role: "agent-pipeline-orchestrator".to_string(),
                action: Action::BuildInvoke,
                resource: "build:agent-pipeline/Build".to_string(),
            })),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status(OrchestratorError::Pipeline(PipelineError::Cancelled)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
