//! Repository Module
//!
//! Data access layer for the orchestrator. Runs go through the
//! [`RunRepository`] trait so the orchestrator works the same against
//! Postgres and against memory; stage logs implement the core `LogSink`.

pub mod log;
pub mod memory;
pub mod run;

pub use log::PgLogSink;
pub use memory::InMemoryRunRepository;
pub use run::PgRunRepository;

use async_trait::async_trait;
use conduit_core::domain::run::PipelineRun;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid stored run: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("repository lock poisoned")]
    Poisoned,
}

/// Persistent record of pipeline runs
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Inserts or replaces a run
    async fn save(&self, run: &PipelineRun) -> Result<(), RepositoryError>;

    async fn find(&self, id: Uuid) -> Result<Option<PipelineRun>, RepositoryError>;

    /// Most recent runs first
    async fn list(&self, limit: usize) -> Result<Vec<PipelineRun>, RepositoryError>;

    /// Runs not yet in a terminal state
    async fn list_unfinished(&self) -> Result<Vec<PipelineRun>, RepositoryError>;
}
