//! Run DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::{PipelineRun, RunFailure, RunState, StageStatus};

/// Request to trigger a run manually
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerRun {
    /// Branch to build; defaults to the tracked branch
    pub branch: Option<String>,
    /// Commit to build; defaults to the branch head
    pub commit: Option<String>,
}

/// Push notification from the source repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEvent {
    pub branch: String,
    pub commit: String,
}

/// Response to a trigger request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAccepted {
    pub run_id: Uuid,
    pub status_url: String,
}

/// Observable status of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub pipeline: String,
    pub state: RunState,
    pub current_stage: Option<String>,
    pub stage_status: Option<StageStatus>,
    pub branch: String,
    pub commit: Option<String>,
    pub failure: Option<RunFailure>,
    /// Link to the run in the console
    pub console_url: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    pub fn from_run(run: &PipelineRun, console_url: String) -> Self {
        let current = run.current_stage();
        Self {
            run_id: run.id,
            pipeline: run.pipeline.clone(),
            state: run.state,
            current_stage: current.map(|s| s.name.clone()),
            stage_status: current.map(|s| s.status),
            branch: run.trigger.branch.clone(),
            commit: run.commit.clone(),
            failure: run.failure.clone(),
            console_url,
            created_at: run.created_at,
            completed_at: run.completed_at,
        }
    }
}
