//! Run-related API endpoints

use conduit_core::domain::run::PipelineRun;
use conduit_core::dto::log::StageLogs;
use conduit_core::dto::run::{RunAccepted, RunStatus, SourceEvent, TriggerRun};
use uuid::Uuid;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    // =============================================================================
    // Triggers
    // =============================================================================

    /// Trigger a run manually
    ///
    /// Branch and commit default to the tracked branch and its head.
    pub async fn trigger_run(&self, req: TriggerRun) -> Result<RunAccepted> {
        let response = self.client.post(self.url("/runs")).json(&req).send().await?;
        self.handle_response(response).await
    }

    /// Forward a push notification
    ///
    /// Returns `None` when the orchestrator ignores the push because it is
    /// for another branch.
    pub async fn send_source_event(&self, event: SourceEvent) -> Result<Option<RunAccepted>> {
        let response = self
            .client
            .post(self.url("/hooks/source"))
            .json(&event)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        self.handle_response(response).await.map(Some)
    }

    // =============================================================================
    // Inspection
    // =============================================================================

    /// List recent runs, newest first
    pub async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<RunStatus>> {
        let mut request = self.client.get(self.url("/runs"));
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        let response = request.send().await?;
        self.handle_response(response).await
    }

    /// Status of a run, including its console link
    pub async fn get_run(&self, run_id: Uuid) -> Result<RunStatus> {
        let url = self.url(&format!("/runs/{}", run_id));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    /// Full run record with every stage
    pub async fn get_run_detail(&self, run_id: Uuid) -> Result<PipelineRun> {
        let url = self.url(&format!("/runs/{}/detail", run_id));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    pub async fn stage_logs(&self, run_id: Uuid, stage: &str) -> Result<StageLogs> {
        let url = self.url(&format!("/runs/{}/logs/{}", run_id, stage));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    // =============================================================================
    // Control
    // =============================================================================

    /// Request cancellation of an in-flight run
    ///
    /// The returned status is a snapshot; the run reaches `Failed` once the
    /// active stage has stopped.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<RunStatus> {
        let url = self.url(&format!("/runs/{}/cancel", run_id));
        let response = self.client.post(&url).send().await?;
        self.handle_response(response).await
    }
}
