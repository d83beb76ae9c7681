//! Pipeline orchestrator
//!
//! Owns every [`PipelineRun`] and drives it through
//! `Idle -> SourcePulled -> Building -> Succeeded | Failed`:
//!
//! 1. pull the tracked branch and store the tree as the source stage's bundle
//! 2. hand each build stage the previous stage's bundle through the executor
//! 3. store each build output as that stage's bundle
//!
//! The first error fails the run; nothing is retried. Every side effect is
//! checked against the orchestrator role first. The run record is saved
//! after each step so status queries always see the latest state.

use conduit_core::domain::access::{Action, require, resource};
use conduit_core::domain::artifact::{ArtifactKey, ArtifactRef, ArtifactVersion};
use conduit_core::domain::log::LogKey;
use conduit_core::domain::pipeline::{
    BuildConfig, PipelineDefinition, SourceConfig, StageDefinition, StageExecutor,
};
use conduit_core::domain::provisioning::ProvisioningDefinition;
use conduit_core::domain::run::{PipelineRun, RunState, Trigger, TriggerSource};
use conduit_core::dto::artifact::ArtifactVersions;
use conduit_core::dto::log::StageLogs;
use conduit_core::dto::run::{RunStatus, SourceEvent};
use conduit_core::logsink::LogSink;
use conduit_core::source::SourceProvider;
use conduit_core::store::{ArtifactStore, AuthorizedStore};
use conduit_core::{CancelSignal, PipelineError};
use conduit_runner::logs::{LogStream, StageLogger};
use conduit_runner::{BuildExecutor, BuildOutput, BuildRequest, EnvironmentProvider};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::OrchestratorError;
use crate::repository::RunRepository;
use crate::storage::sha256_hex;

/// External systems the orchestrator talks to
pub struct Collaborators {
    pub source: Arc<dyn SourceProvider>,
    pub store: Arc<dyn ArtifactStore>,
    pub logs: Arc<dyn LogSink>,
    pub runs: Arc<dyn RunRepository>,
    pub environments: Arc<dyn EnvironmentProvider>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the console, without trailing slash
    pub console_url: String,
    /// Limit on a single build stage
    pub build_timeout: Option<Duration>,
    /// Parent directory of build workspaces
    pub workspace_base: PathBuf,
}

pub struct Orchestrator {
    definition: Arc<ProvisioningDefinition>,
    source: Arc<dyn SourceProvider>,
    store: Arc<dyn ArtifactStore>,
    logs: Arc<dyn LogSink>,
    runs: Arc<dyn RunRepository>,
    executor: BuildExecutor,
    settings: Settings,
    /// Cancellation handles of runs driven by this process
    in_flight: Mutex<HashMap<Uuid, CancelSignal>>,
}

impl Orchestrator {
    pub fn new(
        definition: ProvisioningDefinition,
        collaborators: Collaborators,
        settings: Settings,
    ) -> Self {
        let executor = BuildExecutor::new(
            collaborators.environments,
            collaborators.store.clone(),
            collaborators.logs.clone(),
            Arc::new(definition.policy.clone()),
            definition.pipeline.artifact_store.as_str(),
            settings.workspace_base.clone(),
        );

        Self {
            definition: Arc::new(definition),
            source: collaborators.source,
            store: collaborators.store,
            logs: collaborators.logs,
            runs: collaborators.runs,
            executor,
            settings,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.definition.pipeline
    }

    pub fn source(&self) -> &Arc<dyn SourceProvider> {
        &self.source
    }

    pub fn environments(&self) -> &Arc<dyn EnvironmentProvider> {
        self.executor.provider()
    }

    /// Branch watched by the source stage
    pub fn tracked_branch(&self) -> &str {
        self.pipeline()
            .source_stage()
            .map(|(_, source)| source.branch.as_str())
            .unwrap_or_default()
    }

    pub fn console_link(&self, run: &PipelineRun) -> String {
        format!(
            "{}/pipelines/{}/runs/{}",
            self.settings.console_url.trim_end_matches('/'),
            run.pipeline,
            run.id
        )
    }

    pub fn status_of(&self, run: &PipelineRun) -> RunStatus {
        RunStatus::from_run(run, self.console_link(run))
    }

    fn orchestrator_store(&self) -> AuthorizedStore {
        AuthorizedStore::new(
            self.store.clone(),
            self.pipeline().artifact_store.as_str(),
            self.definition.policy.orchestrator().clone(),
        )
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Starts a run in the background and returns its ID
    pub async fn trigger(self: &Arc<Self>, trigger: Trigger) -> Result<Uuid, OrchestratorError> {
        let (run, cancel) = self.admit(trigger).await?;
        let run_id = run.id;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive(run, cancel).await;
        });

        Ok(run_id)
    }

    /// Runs a pipeline to completion and returns the final record
    pub async fn run(&self, trigger: Trigger) -> Result<PipelineRun, OrchestratorError> {
        let (run, cancel) = self.admit(trigger).await?;
        Ok(self.drive(run, cancel).await)
    }

    /// Turns a push notification into a run
    ///
    /// Pushes to other branches are ignored and return `None`.
    pub async fn handle_source_event(
        self: &Arc<Self>,
        event: SourceEvent,
    ) -> Result<Option<Uuid>, OrchestratorError> {
        if event.branch != self.tracked_branch() {
            debug!("Ignoring push to untracked branch {}", event.branch);
            return Ok(None);
        }
        let run_id = self
            .trigger(Trigger::at_commit(
                event.branch,
                event.commit,
                TriggerSource::Webhook,
            ))
            .await?;
        Ok(Some(run_id))
    }

    /// Validates a trigger and records a new `Idle` run
    async fn admit(&self, trigger: Trigger) -> Result<(PipelineRun, CancelSignal), OrchestratorError> {
        let pipeline = self.pipeline();
        require(
            self.definition.policy.orchestrator(),
            Action::PipelineManage,
            &resource::pipeline(&pipeline.name),
        )?;

        if trigger.branch != self.tracked_branch() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "pipeline '{}' tracks branch '{}', not '{}'",
                pipeline.name,
                self.tracked_branch(),
                trigger.branch
            )));
        }
        if trigger.commit.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(OrchestratorError::InvalidRequest(
                "commit cannot be empty".to_string(),
            ));
        }

        let run = PipelineRun::new(pipeline, trigger);
        self.runs.save(&run).await?;

        let cancel = CancelSignal::new();
        self.in_flight.lock().await.insert(run.id, cancel.clone());

        info!(
            "Run {} of {} triggered ({:?}) on {}",
            run.id, run.pipeline, run.trigger.source, run.trigger.branch
        );
        Ok((run, cancel))
    }

    // =========================================================================
    // Run execution
    // =========================================================================

    async fn drive(&self, mut run: PipelineRun, cancel: CancelSignal) -> PipelineRun {
        match self.execute_stages(&mut run, &cancel).await {
            Ok(()) => info!("Run {} succeeded", run.id),
            Err(e) => {
                warn!("Run {} failed: {}", run.id, e);
                run.fail(&e, e.exit_code());
            }
        }

        self.persist(&run).await;
        self.in_flight.lock().await.remove(&run.id);
        run
    }

    async fn execute_stages(
        &self,
        run: &mut PipelineRun,
        cancel: &CancelSignal,
    ) -> Result<(), PipelineError> {
        let pipeline = self.pipeline();
        let (source_stage, source) = pipeline
            .source_stage()
            .ok_or_else(|| PipelineError::InvalidDefinition("missing source stage".to_string()))?;
        let store = self.orchestrator_store();

        run.start_stage(0);
        self.persist(run).await;

        let artifact = self
            .pull_source(run, source_stage, source, &store, cancel)
            .await?;
        run.complete_stage(artifact, None);
        run.transition(RunState::SourcePulled)?;
        self.persist(run).await;

        for (idx, stage) in pipeline.stages.iter().enumerate().skip(1) {
            let StageExecutor::Build(config) = &stage.executor else {
                return Err(PipelineError::InvalidDefinition(format!(
                    "stage '{}' is not a build stage",
                    stage.name
                )));
            };

            if run.state == RunState::SourcePulled {
                run.transition(RunState::Building)?;
            }
            run.start_stage(idx);
            self.persist(run).await;

            let input = run.stages[idx - 1].artifact.clone().ok_or_else(|| {
                PipelineError::InvalidDefinition(format!(
                    "stage '{}' has no input bundle",
                    stage.name
                ))
            })?;

            let artifact = self
                .build_stage(run, stage, config, &input, &store, cancel)
                .await?;
            run.complete_stage(artifact, Some(0));
            self.persist(run).await;
        }

        run.transition(RunState::Succeeded)?;
        Ok(())
    }

    async fn pull_source(
        &self,
        run: &mut PipelineRun,
        stage: &StageDefinition,
        source: &SourceConfig,
        store: &AuthorizedStore,
        cancel: &CancelSignal,
    ) -> Result<ArtifactRef, PipelineError> {
        require(
            store.role(),
            Action::LogWrite,
            &resource::logs(&run.pipeline, &stage.name),
        )?;

        let stream = LogStream::open(self.logs.clone(), LogKey::new(run.id, stage.name.as_str()));
        let logger = stream.logger();

        let result = self
            .fetch_and_store(run, stage, source, store, &logger, cancel)
            .await;
        if let Err(e) = &result {
            logger.error(format!("Source stage failed: {}", e));
        }
        drop(logger);

        let flushed = stream.close().await;
        let artifact = result?;
        flushed?;
        Ok(artifact)
    }

    async fn fetch_and_store(
        &self,
        run: &mut PipelineRun,
        stage: &StageDefinition,
        source: &SourceConfig,
        store: &AuthorizedStore,
        logger: &StageLogger,
        cancel: &CancelSignal,
    ) -> Result<ArtifactRef, PipelineError> {
        require(
            store.role(),
            Action::SourcePull,
            &resource::source(&source.repository),
        )?;

        let commit = match run.trigger.commit.clone() {
            Some(commit) => commit,
            None => {
                logger.info(format!("Resolving head of branch {}", source.branch));
                cancellable(cancel, self.source.branch_head(&source.branch)).await?
            }
        };

        logger.info(format!("Fetching {} at {}", source.repository, commit));
        let archive = cancellable(cancel, self.source.fetch_archive(&commit)).await?;
        run.commit = Some(commit);

        let key = ArtifactKey::new(&run.pipeline, &stage.name, run.id);
        let version = store.put(&key, &archive).await?;
        logger.info(format!(
            "Stored {} {} ({} bytes)",
            stage.output,
            version,
            archive.len()
        ));

        Ok(artifact_ref(key, &stage.output, version, &archive))
    }

    async fn build_stage(
        &self,
        run: &PipelineRun,
        stage: &StageDefinition,
        config: &BuildConfig,
        input: &ArtifactRef,
        store: &AuthorizedStore,
        cancel: &CancelSignal,
    ) -> Result<ArtifactRef, PipelineError> {
        require(
            store.role(),
            Action::BuildInvoke,
            &resource::build(&run.pipeline, &stage.name),
        )?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let request = BuildRequest {
            run_id: run.id,
            pipeline: run.pipeline.clone(),
            stage: stage.name.clone(),
            project: config.project.clone(),
            image: config.image.clone(),
            buildspec: config.buildspec.clone(),
            input: input.key.clone(),
            input_version: input.version,
            commit: run.commit.clone(),
        };

        let output = self.invoke(&request, cancel).await?;
        // A cancel that lands after the last command must not publish
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let key = ArtifactKey::new(&run.pipeline, &stage.name, run.id);
        let version = store.put(&key, &output.bundle).await?;
        info!(
            "Run {} stored {} {} ({} files)",
            run.id,
            stage.output,
            version,
            output.files.len()
        );

        Ok(artifact_ref(key, &stage.output, version, &output.bundle))
    }

    /// Calls the executor, cancelling it when the build timeout expires
    async fn invoke(
        &self,
        request: &BuildRequest,
        cancel: &CancelSignal,
    ) -> Result<BuildOutput, PipelineError> {
        let execution = self.executor.execute(request, cancel);
        let Some(limit) = self.settings.build_timeout else {
            return execution.await;
        };

        tokio::pin!(execution);
        tokio::select! {
            result = &mut execution => result,
            _ = tokio::time::sleep(limit) => {
                warn!(
                    "Stage {} of run {} exceeded {}s, cancelling",
                    request.stage,
                    request.run_id,
                    limit.as_secs()
                );
                cancel.cancel();
                // Wait for the executor to release its environment
                if let Err(e) = execution.await {
                    debug!("Timed out build ended with: {}", e);
                }
                Err(PipelineError::TimedOut(limit.as_secs()))
            }
        }
    }

    async fn persist(&self, run: &PipelineRun) {
        if let Err(e) = self.runs.save(run).await {
            error!("Failed to save run {}: {}", run.id, e);
        }
    }

    // =========================================================================
    // Control and queries
    // =========================================================================

    /// Requests cancellation of a run
    ///
    /// An in-flight run stops at its next suspension point and ends `Failed`
    /// with kind `Cancelled`. A run left unfinished by a previous process is
    /// failed directly.
    pub async fn cancel(&self, run_id: Uuid) -> Result<RunStatus, OrchestratorError> {
        let signal = self.in_flight.lock().await.get(&run_id).cloned();

        match signal {
            Some(signal) => {
                info!("Cancelling run {}", run_id);
                signal.cancel();
            }
            None => {
                let mut run = self.get_run(run_id).await?;
                if run.state.is_terminal() {
                    return Err(OrchestratorError::AlreadyFinished(run_id));
                }
                warn!("Run {} is not driven by this process, failing it", run_id);
                run.fail(&PipelineError::Cancelled, None);
                self.runs.save(&run).await?;
            }
        }

        self.status(run_id).await
    }

    /// Fails runs left unfinished by a previous process
    pub async fn recover(&self) -> Result<usize, OrchestratorError> {
        let in_flight = self.in_flight.lock().await;
        let mut recovered = 0;

        for mut run in self.runs.list_unfinished().await? {
            if in_flight.contains_key(&run.id) {
                continue;
            }
            run.fail(
                &PipelineError::Environment(
                    "orchestrator stopped while the run was in progress".to_string(),
                ),
                None,
            );
            self.runs.save(&run).await?;
            recovered += 1;
        }

        if recovered > 0 {
            warn!("Marked {} interrupted run(s) as failed", recovered);
        }
        Ok(recovered)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        self.runs
            .find(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    pub async fn status(&self, run_id: Uuid) -> Result<RunStatus, OrchestratorError> {
        let run = self.get_run(run_id).await?;
        Ok(self.status_of(&run))
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunStatus>, OrchestratorError> {
        let runs = self.runs.list(limit).await?;
        Ok(runs.iter().map(|run| self.status_of(run)).collect())
    }

    /// Commit of the most recent run, if any
    pub async fn latest_commit(&self) -> Result<Option<String>, OrchestratorError> {
        let runs = self.runs.list(1).await?;
        Ok(runs.first().and_then(|run| run.commit.clone()))
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn stage_logs(
        &self,
        run_id: Uuid,
        stage: &str,
    ) -> Result<StageLogs, OrchestratorError> {
        let run = self.get_run(run_id).await?;
        if run.stage(stage).is_none() {
            return Err(OrchestratorError::StageNotFound(stage.to_string()));
        }

        let entries = self.logs.read(&LogKey::new(run_id, stage)).await?;
        Ok(StageLogs {
            run_id,
            stage: stage.to_string(),
            entries,
        })
    }

    pub async fn artifact_versions(
        &self,
        run_id: Uuid,
        stage: &str,
    ) -> Result<ArtifactVersions, OrchestratorError> {
        let key = self.artifact_key(run_id, stage).await?;
        let versions = self.orchestrator_store().list_versions(&key).await?;
        Ok(ArtifactVersions { key, versions })
    }

    /// Bundle bytes of a stage, latest version when `version` is None
    pub async fn artifact(
        &self,
        run_id: Uuid,
        stage: &str,
        version: Option<ArtifactVersion>,
    ) -> Result<Vec<u8>, OrchestratorError> {
        let key = self.artifact_key(run_id, stage).await?;
        Ok(self.orchestrator_store().get(&key, version).await?)
    }

    async fn artifact_key(&self, run_id: Uuid, stage: &str) -> Result<ArtifactKey, OrchestratorError> {
        let run = self.get_run(run_id).await?;
        if run.stage(stage).is_none() {
            return Err(OrchestratorError::StageNotFound(stage.to_string()));
        }
        Ok(ArtifactKey::new(run.pipeline, stage, run_id))
    }
}

fn artifact_ref(key: ArtifactKey, name: &str, version: ArtifactVersion, bytes: &[u8]) -> ArtifactRef {
    ArtifactRef {
        key,
        name: name.to_string(),
        version,
        size: bytes.len() as u64,
        digest: sha256_hex(bytes),
    }
}

async fn cancellable<T>(
    cancel: &CancelSignal,
    work: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = work => result,
    }
}
