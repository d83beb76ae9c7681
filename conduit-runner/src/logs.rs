//! Stage log streaming
//!
//! Lines produced while a stage runs are sent through a channel to a
//! forwarder task that appends them to the [`LogSink`] in batches. Closing
//! the logger waits for every queued line to reach the sink.

use conduit_core::PipelineError;
use conduit_core::domain::log::{LogEntry, LogKey, LogLevel};
use conduit_core::logsink::LogSink;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const BATCH_SIZE: usize = 64;

/// Cheap handle used to emit lines for one `(run_id, stage)` stream
#[derive(Clone)]
pub struct StageLogger {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl StageLogger {
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        // The forwarder only stops after every sender is gone
        let _ = self.tx.send(LogEntry::new(level, message));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

/// Owner side of a stage log stream
pub struct LogStream {
    logger: StageLogger,
    forwarder: JoinHandle<Result<usize, PipelineError>>,
}

impl LogStream {
    pub fn open(sink: Arc<dyn LogSink>, key: LogKey) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_logs(rx, sink, key));
        Self {
            logger: StageLogger { tx },
            forwarder,
        }
    }

    pub fn logger(&self) -> StageLogger {
        self.logger.clone()
    }

    /// Flushes every pending line and returns how many were written
    ///
    /// Loggers cloned from this stream must be dropped first, otherwise this
    /// waits for them.
    pub async fn close(self) -> Result<usize, PipelineError> {
        drop(self.logger);
        self.forwarder
            .await
            .map_err(|e| PipelineError::LogSink(format!("log forwarder failed: {}", e)))?
    }
}

async fn forward_logs(
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    sink: Arc<dyn LogSink>,
    key: LogKey,
) -> Result<usize, PipelineError> {
    let mut written = 0;
    let mut failure = None;
    let mut batch = Vec::with_capacity(BATCH_SIZE);

    while rx.recv_many(&mut batch, BATCH_SIZE).await > 0 {
        let entries = std::mem::take(&mut batch);
        let count = entries.len();

        // Keep draining after a failure so senders never block on a dead stream
        if failure.is_some() {
            continue;
        }

        match sink.append(&key, entries).await {
            Ok(()) => {
                written += count;
                debug!("Forwarded {} log lines for {}/{}", count, key.run_id, key.stage);
            }
            Err(e) => {
                warn!(
                    "Failed to write logs for run {} stage {}: {}",
                    key.run_id, key.stage, e
                );
                failure = Some(e);
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::memory::InMemoryLogSink;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_lines_reach_sink_in_order() {
        let sink = Arc::new(InMemoryLogSink::new());
        let key = LogKey::new(Uuid::new_v4(), "Build");

        let stream = LogStream::open(sink.clone(), key.clone());
        let logger = stream.logger();
        for i in 0..200 {
            logger.info(format!("line {}", i));
        }
        drop(logger);

        assert_eq!(stream.close().await.unwrap(), 200);

        let entries = sink.read(&key).await.unwrap();
        assert_eq!(entries.len(), 200);
        assert_eq!(entries[0].message, "line 0");
        assert_eq!(entries[199].message, "line 199");
    }

    #[tokio::test]
    async fn test_levels_are_kept() {
        let sink = Arc::new(InMemoryLogSink::new());
        let key = LogKey::new(Uuid::new_v4(), "Build");

        let stream = LogStream::open(sink.clone(), key.clone());
        stream.logger().error("boom");
        stream.logger().warn("careful");
        stream.close().await.unwrap();

        let entries = sink.read(&key).await.unwrap();
        assert_eq!(entries[0].level, LogLevel::Error);
        assert_eq!(entries[1].level, LogLevel::Warning);
    }
}
