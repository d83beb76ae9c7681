//! Log DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::log::LogEntry;

/// One stage's log stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLogs {
    pub run_id: Uuid,
    pub stage: String,
    pub entries: Vec<LogEntry>,
}
