//! Log Repository
//!
//! Postgres-backed stage log streams.

use async_trait::async_trait;
use conduit_core::PipelineError;
use conduit_core::domain::log::{LogEntry, LogKey, LogLevel};
use conduit_core::logsink::LogSink;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgLogSink {
    pool: PgPool,
}

impl PgLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogSink for PgLogSink {
    async fn append(&self, key: &LogKey, entries: Vec<LogEntry>) -> Result<(), PipelineError> {
        add_entries(&self.pool, key.run_id, &key.stage, entries)
            .await
            .map_err(|e| PipelineError::LogSink(e.to_string()))
    }

    async fn read(&self, key: &LogKey) -> Result<Vec<LogEntry>, PipelineError> {
        find_by_stage(&self.pool, key.run_id, &key.stage)
            .await
            .map_err(|e| PipelineError::LogSink(e.to_string()))
    }
}

/// Append log entries to a stage stream
///
/// Entries of one batch are written in a single transaction so a stream
/// never has holes.
pub async fn add_entries(
    pool: &PgPool,
    run_id: Uuid,
    stage: &str,
    entries: Vec<LogEntry>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO stage_logs (run_id, stage, timestamp, level, message)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run_id)
        .bind(stage)
        .bind(entry.timestamp)
        .bind(level_to_string(entry.level))
        .bind(&entry.message)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// Get a stage's log stream in write order
pub async fn find_by_stage(
    pool: &PgPool,
    run_id: Uuid,
    stage: &str,
) -> Result<Vec<LogEntry>, sqlx::Error> {
    let rows = sqlx::query_as::<_, LogRow>(
        r#"
        SELECT timestamp, level, message
        FROM stage_logs
        WHERE run_id = $1 AND stage = $2
        ORDER BY id ASC
        "#,
    )
    .bind(run_id)
    .bind(stage)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn level_to_string(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "Debug",
        LogLevel::Info => "Info",
        LogLevel::Warning => "Warning",
        LogLevel::Error => "Error",
    }
}

fn string_to_level(s: &str) -> LogLevel {
    match s {
        "Debug" => LogLevel::Debug,
        "Warning" => LogLevel::Warning,
        "Error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct LogRow {
    timestamp: chrono::DateTime<chrono::Utc>,
    level: String,
    message: String,
}

impl From<LogRow> for LogEntry {
    fn from(row: LogRow) -> Self {
        LogEntry {
            timestamp: row.timestamp,
            level: string_to_level(&row.level),
            message: row.message,
        }
    }
}
