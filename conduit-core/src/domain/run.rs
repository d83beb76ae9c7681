//! Pipeline run domain types
//!
//! A run is one execution of a pipeline definition. Its state only moves
//! forward along:
//!
//! ```text
//! Idle -> SourcePulled -> Building -> Succeeded
//!   \          \             \
//!    +----------+-------------+--> Failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::artifact::ArtifactRef;
use crate::domain::pipeline::PipelineDefinition;
use crate::error::PipelineError;

/// Run-level state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    SourcePulled,
    Building,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, SourcePulled)
                | (Idle, Failed)
                | (SourcePulled, Building)
                | (SourcePulled, Failed)
                | (Building, Succeeded)
                | (Building, Failed)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::SourcePulled => write!(f, "SourcePulled"),
            RunState::Building => write!(f, "Building"),
            RunState::Succeeded => write!(f, "Succeeded"),
            RunState::Failed => write!(f, "Failed"),
        }
    }
}

/// Per-stage status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "Pending"),
            StageStatus::Running => write!(f, "Running"),
            StageStatus::Succeeded => write!(f, "Succeeded"),
            StageStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// How a run was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    Poll,
    Webhook,
    Manual,
}

/// What started a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub branch: String,
    /// Commit to build; resolved from the branch head when absent
    pub commit: Option<String>,
    pub source: TriggerSource,
}

impl Trigger {
    pub fn manual(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            commit: None,
            source: TriggerSource::Manual,
        }
    }

    pub fn at_commit(branch: impl Into<String>, commit: impl Into<String>, source: TriggerSource) -> Self {
        Self {
            branch: branch.into(),
            commit: Some(commit.into()),
            source,
        }
    }
}

/// Classification of a run failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Authorization,
    SourceFetch,
    BuildPhase,
    ArtifactStore,
    Cancelled,
    TimedOut,
    Environment,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Stage that was active when the run failed
    pub stage: Option<String>,
}

/// Execution record of one stage inside a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bundle produced by the stage, only set on success
    pub artifact: Option<ArtifactRef>,
    pub exit_code: Option<i32>,
}

impl StageRecord {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            artifact: None,
            exit_code: None,
        }
    }
}

/// One execution instance of a pipeline definition
///
/// Owned exclusively by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline: String,
    pub trigger: Trigger,
    /// Commit actually built (set once source is pulled)
    pub commit: Option<String>,
    pub state: RunState,
    pub current_stage: usize,
    pub stages: Vec<StageRecord>,
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Creates a new run in `Idle` with every stage `Pending`
    pub fn new(definition: &PipelineDefinition, trigger: Trigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline: definition.name.clone(),
            commit: trigger.commit.clone(),
            trigger,
            state: RunState::Idle,
            current_stage: 0,
            stages: definition
                .stages
                .iter()
                .map(|s| StageRecord::pending(&s.name))
                .collect(),
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Moves the run to `next`, rejecting any transition outside the state machine
    pub fn transition(&mut self, next: RunState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn current_stage(&self) -> Option<&StageRecord> {
        self.stages.get(self.current_stage)
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Marks stage `idx` as running and makes it the current stage
    pub fn start_stage(&mut self, idx: usize) {
        let now = Utc::now();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.current_stage = idx;
        if let Some(stage) = self.stages.get_mut(idx) {
            stage.status = StageStatus::Running;
            stage.started_at = Some(now);
        }
    }

    /// Marks the current stage as succeeded and records its artifact
    pub fn complete_stage(&mut self, artifact: ArtifactRef, exit_code: Option<i32>) {
        if let Some(stage) = self.stages.get_mut(self.current_stage) {
            stage.status = StageStatus::Succeeded;
            stage.completed_at = Some(Utc::now());
            stage.artifact = Some(artifact);
            stage.exit_code = exit_code;
        }
    }

    /// Fails the current stage and the run
    ///
    /// Works from any non-terminal state; a run is never left running after
    /// an error.
    pub fn fail(&mut self, error: &PipelineError, exit_code: Option<i32>) {
        let stage_name = self.stages.get(self.current_stage).map(|s| s.name.clone());
        if let Some(stage) = self.stages.get_mut(self.current_stage) {
            stage.status = StageStatus::Failed;
            if stage.started_at.is_none() {
                stage.started_at = Some(Utc::now());
            }
            stage.completed_at = Some(Utc::now());
            stage.exit_code = exit_code;
        }
        self.failure = Some(RunFailure {
            kind: error.kind(),
            message: error.to_string(),
            stage: stage_name,
        });
        if !self.state.is_terminal() {
            self.state = RunState::Failed;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Artifact references produced so far, in stage order
    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.stages.iter().filter_map(|s| s.artifact.as_ref())
    }
}
