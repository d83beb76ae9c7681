//! Structured log sink for stage output

use async_trait::async_trait;

use crate::domain::log::{LogEntry, LogKey};
use crate::error::PipelineError;

/// Append-only log streams keyed by `(run_id, stage)`
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Appends entries to a stream, preserving their order
    async fn append(&self, key: &LogKey, entries: Vec<LogEntry>) -> Result<(), PipelineError>;

    /// Reads a whole stream (empty for unknown keys)
    async fn read(&self, key: &LogKey) -> Result<Vec<LogEntry>, PipelineError>;
}
