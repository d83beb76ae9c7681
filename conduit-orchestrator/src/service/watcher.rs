//! Branch watcher
//!
//! Polls the head of the tracked branch and triggers a run whenever it moves.

use anyhow::{Context, Result};
use conduit_core::domain::run::{Trigger, TriggerSource};
use std::sync::Arc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::Orchestrator;

pub struct BranchWatcher {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    /// Last head that produced a run
    last_seen: Option<String>,
}

impl BranchWatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            last_seen: None,
        }
    }

    /// Starts the polling loop
    ///
    /// Resumes from the commit of the most recent run so a restart does not
    /// rebuild an unchanged branch.
    pub async fn run(mut self) {
        info!(
            "Watching branch {} (interval: {:?})",
            self.orchestrator.tracked_branch(),
            self.interval
        );

        if let Err(e) = self.resume().await {
            error!("{:#}", e);
        }

        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(e) = self.poll_once().await {
                error!("Error during branch poll: {:#}", e);
            }
        }
    }

    /// Starts from the commit of the most recent run
    pub async fn resume(&mut self) -> Result<()> {
        self.last_seen = self
            .orchestrator
            .latest_commit()
            .await
            .context("Failed to load the last built commit")?;
        Ok(())
    }

    /// Checks the branch once, returning the triggered run if any
    pub async fn poll_once(&mut self) -> Result<Option<Uuid>> {
        let branch = self.orchestrator.tracked_branch().to_string();
        let head = self
            .orchestrator
            .source()
            .branch_head(&branch)
            .await
            .with_context(|| format!("Failed to resolve head of {}", branch))?;

        if self.last_seen.as_deref() == Some(head.as_str()) {
            debug!("Branch {} unchanged at {}", branch, head);
            return Ok(None);
        }

        // Webhooks and manual triggers may have built the head already
        let latest = self
            .orchestrator
            .latest_commit()
            .await
            .context("Failed to load the last built commit")?;
        if latest.as_deref() == Some(head.as_str()) {
            debug!("Head {} of {} already has a run", head, branch);
            self.last_seen = Some(head);
            return Ok(None);
        }

        info!("Branch {} moved to {}", branch, head);
        let run_id = self
            .orchestrator
            .trigger(Trigger::at_commit(&branch, &head, TriggerSource::Poll))
            .await
            .context("Failed to trigger run")?;

        self.last_seen = Some(head);
        Ok(Some(run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::{COMMIT, harness, source_bundle, spec, wait_for_completion};

    #[tokio::test]
    async fn test_triggers_once_per_head() {
        let h = harness(spec(&["cp app.txt output/app.txt"]), None);
        let mut watcher = BranchWatcher::new(h.orchestrator.clone(), Duration::from_secs(60));

        let first = watcher.poll_once().await.unwrap().unwrap();
        let run = wait_for_completion(&h.orchestrator, first).await;
        assert_eq!(run.commit.as_deref(), Some(COMMIT));
        assert_eq!(run.trigger.source, TriggerSource::Poll);

        assert!(watcher.poll_once().await.unwrap().is_none());

        h.source.push("main", "def456", source_bundle());
        let second = watcher.poll_once().await.unwrap().unwrap();
        assert_ne!(first, second);
        let run = wait_for_completion(&h.orchestrator, second).await;
        assert_eq!(run.commit.as_deref(), Some("def456"));
    }

    #[tokio::test]
    async fn test_resume_skips_already_built_head() {
        let h = harness(spec(&["cp app.txt output/app.txt"]), None);
        h.orchestrator
            .run(Trigger::at_commit("main", COMMIT, TriggerSource::Manual))
            .await
            .unwrap();

        let mut watcher = BranchWatcher::new(h.orchestrator.clone(), Duration::from_secs(60));
        watcher.resume().await.unwrap();
        assert!(watcher.poll_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_head_built_by_webhook_is_not_rebuilt() {
        let h = harness(spec(&["cp app.txt output/app.txt"]), None);
        let mut watcher = BranchWatcher::new(h.orchestrator.clone(), Duration::from_secs(60));

        let first = watcher.poll_once().await.unwrap().unwrap();
        wait_for_completion(&h.orchestrator, first).await;

        // The push reaches the webhook before the next poll
        h.source.push("main", "def456", source_bundle());
        let pushed = h
            .orchestrator
            .trigger(Trigger::at_commit("main", "def456", TriggerSource::Webhook))
            .await
            .unwrap();
        wait_for_completion(&h.orchestrator, pushed).await;

        assert!(watcher.poll_once().await.unwrap().is_none());
        assert_eq!(h.orchestrator.list_runs(10).await.unwrap().len(), 2);

        h.source.push("main", "0ff1ce", source_bundle());
        assert!(watcher.poll_once().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_head_does_not_create_a_run() {
        let h = harness(spec(&["true"]), None);
        let mut watcher = BranchWatcher::new(h.orchestrator.clone(), Duration::from_secs(60));
        h.source.push("main", "", Vec::new());

        assert!(watcher.poll_once().await.is_err());
        assert!(h.orchestrator.list_runs(10).await.unwrap().is_empty());
    }
}
