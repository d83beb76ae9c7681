//! Error taxonomy for pipeline operations
//!
//! Every error that reaches the orchestrator ends the current run; the
//! [`FailureKind`](crate::domain::run::FailureKind) recorded on the run is
//! derived from the variant here.

use thiserror::Error;

use crate::domain::access::Action;
use crate::domain::build::Phase;
use crate::domain::run::{FailureKind, RunState};

/// Errors raised by artifact store implementations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("artifact {0} failed integrity check")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Errors that terminate a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("role '{role}' is not allowed to {action} on {resource}")]
    Authorization {
        role: String,
        action: Action,
        resource: String,
    },

    #[error("source fetch failed: {0}")]
    SourceFetch(String),

    #[error("phase {phase} failed: command '{command}' exited with code {exit_code}")]
    BuildPhase {
        phase: Phase,
        command: String,
        exit_code: i32,
    },

    #[error("artifact manifest error: {0}")]
    Manifest(String),

    #[error("artifact store error: {0}")]
    ArtifactStore(#[from] StoreError),

    #[error("build cancelled")]
    Cancelled,

    #[error("build timed out after {0} seconds")]
    TimedOut(u64),

    #[error("execution environment error: {0}")]
    Environment(String),

    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid run transition from {from:?} to {to:?}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("log sink error: {0}")]
    LogSink(String),
}

impl PipelineError {
    /// Exit code of the failing build command, if any
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::BuildPhase { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Classifies the error for the run record
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Authorization { .. } => FailureKind::Authorization,
            PipelineError::SourceFetch(_) => FailureKind::SourceFetch,
            PipelineError::BuildPhase { .. } | PipelineError::Manifest(_) => {
                FailureKind::BuildPhase
            }
            PipelineError::ArtifactStore(_) => FailureKind::ArtifactStore,
            PipelineError::Cancelled => FailureKind::Cancelled,
            PipelineError::TimedOut(_) => FailureKind::TimedOut,
            PipelineError::Environment(_) | PipelineError::LogSink(_) => FailureKind::Environment,
            PipelineError::InvalidDefinition(_) | PipelineError::InvalidTransition { .. } => {
                FailureKind::Internal
            }
        }
    }
}
