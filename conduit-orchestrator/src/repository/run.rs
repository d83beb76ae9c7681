//! Run Repository
//!
//! Postgres storage for pipeline runs. The whole run is kept as JSONB; state,
//! branch, commit and timestamps are duplicated into columns for listing.

use async_trait::async_trait;
use conduit_core::domain::run::{PipelineRun, RunState};
use sqlx::PgPool;
use uuid::Uuid;

use super::{RepositoryError, RunRepository};

#[derive(Clone)]
pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn save(&self, run: &PipelineRun) -> Result<(), RepositoryError> {
        upsert(&self.pool, run).await
    }

    async fn find(&self, id: Uuid) -> Result<Option<PipelineRun>, RepositoryError> {
        find_by_id(&self.pool, id).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<PipelineRun>, RepositoryError> {
        list_recent(&self.pool, limit).await
    }

    async fn list_unfinished(&self) -> Result<Vec<PipelineRun>, RepositoryError> {
        list_by_states(
            &self.pool,
            &[RunState::Idle, RunState::SourcePulled, RunState::Building],
        )
        .await
    }
}

/// Insert or update a run
pub async fn upsert(pool: &PgPool, run: &PipelineRun) -> Result<(), RepositoryError> {
    let record = serde_json::to_value(run)?;

    sqlx::query(
        r#"
        INSERT INTO pipeline_runs (id, pipeline, state, branch, commit_id, created_at, completed_at, record)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET
            state = EXCLUDED.state,
            commit_id = EXCLUDED.commit_id,
            completed_at = EXCLUDED.completed_at,
            record = EXCLUDED.record
        "#,
    )
    .bind(run.id)
    .bind(&run.pipeline)
    .bind(state_to_string(run.state))
    .bind(&run.trigger.branch)
    .bind(&run.commit)
    .bind(run.created_at)
    .bind(run.completed_at)
    .bind(record)
    .execute(pool)
    .await?;

    Ok(())
}

/// Find a run by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<PipelineRun>, RepositoryError> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT record FROM pipeline_runs WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(PipelineRun::try_from).transpose()
}

/// List the most recent runs
pub async fn list_recent(pool: &PgPool, limit: usize) -> Result<Vec<PipelineRun>, RepositoryError> {
    let rows = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT record FROM pipeline_runs
        ORDER BY created_at DESC
        LIMIT $1
        "#,
    )
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(PipelineRun::try_from).collect()
}

/// List runs in any of the given states, oldest first
pub async fn list_by_states(
    pool: &PgPool,
    states: &[RunState],
) -> Result<Vec<PipelineRun>, RepositoryError> {
    let states: Vec<&str> = states.iter().map(|s| state_to_string(*s)).collect();

    let rows = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT record FROM pipeline_runs
        WHERE state = ANY($1)
        ORDER BY created_at ASC
        "#,
    )
    .bind(&states)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(PipelineRun::try_from).collect()
}

// =============================================================================
// Helper Functions
// =============================================================================

fn state_to_string(state: RunState) -> &'static str {
    match state {
        RunState::Idle => "Idle",
        RunState::SourcePulled => "SourcePulled",
        RunState::Building => "Building",
        RunState::Succeeded => "Succeeded",
        RunState::Failed => "Failed",
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    record: serde_json::Value,
}

impl TryFrom<RunRow> for PipelineRun {
    type Error = RepositoryError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(row.record)?)
    }
}
