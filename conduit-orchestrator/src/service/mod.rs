//! Service Module
//!
//! Business logic layer for the orchestrator.

pub mod orchestrator;
pub mod watcher;

pub use orchestrator::{Collaborators, Orchestrator, Settings};
pub use watcher::BranchWatcher;

use conduit_core::{PipelineError, StoreError};
use thiserror::Error;
use uuid::Uuid;

use crate::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("stage '{0}' not found")]
    StageNotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("run {0} has already finished")]
    AlreadyFinished(Uuid),

    #[error(transparent)]
    Pipeline(PipelineError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<PipelineError> for OrchestratorError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::ArtifactStore(StoreError::NotFound(what)) => {
                OrchestratorError::ArtifactNotFound(what)
            }
            other => OrchestratorError::Pipeline(other),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Orchestrator wired to in-memory collaborators and host-process builds

    use super::*;
    use conduit_core::domain::build::{ArtifactManifest, BuildSpec, PhaseCommands};
    use conduit_core::domain::pipeline::{
        BuildConfig, BuildSpecSource, PipelineDefinition, SourceConfig, StageDefinition,
        StageExecutor,
    };
    use conduit_core::domain::provisioning::ProvisioningDefinition;
    use conduit_core::memory::{InMemoryArtifactStore, InMemoryLogSink, StaticSourceProvider};
    use conduit_runner::LocalProvider;
    use conduit_runner::bundle;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::repository::InMemoryRunRepository;

    pub const COMMIT: &str = "abc123";

    pub struct Harness {
        pub orchestrator: Arc<Orchestrator>,
        pub source: Arc<StaticSourceProvider>,
        pub store: Arc<InMemoryArtifactStore>,
        pub logs: Arc<InMemoryLogSink>,
        pub runs: Arc<InMemoryRunRepository>,
        pub provider: Arc<LocalProvider>,
        _workspaces: tempfile::TempDir,
    }

    pub fn phase(commands: &[&str]) -> Option<PhaseCommands> {
        Some(PhaseCommands {
            runtime_versions: BTreeMap::new(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
        })
    }

    /// Copies `app.txt` into `output/` and ships it
    pub fn spec(build: &[&str]) -> BuildSpec {
        let mut spec = BuildSpec::default();
        spec.phases.pre_build = phase(&["mkdir -p output"]);
        spec.phases.build = phase(build);
        spec.artifacts = ArtifactManifest {
            files: vec!["output/*".to_string()],
            discard_paths: false,
            base_directory: None,
        };
        spec
    }

    pub fn pipeline(spec: BuildSpec) -> PipelineDefinition {
        PipelineDefinition {
            name: "agent-pipeline".to_string(),
            description: None,
            artifact_store: "agent-artifacts".to_string(),
            stages: vec![
                StageDefinition {
                    name: "Source".to_string(),
                    input: None,
                    output: "SourceCode".to_string(),
                    executor: StageExecutor::Source(SourceConfig {
                        repository: "agent-repo".to_string(),
                        branch: "main".to_string(),
                    }),
                },
                StageDefinition {
                    name: "Build".to_string(),
                    input: Some("SourceCode".to_string()),
                    output: "BuildOutput".to_string(),
                    executor: StageExecutor::Build(BuildConfig {
                        project: "agent-build".to_string(),
                        image: "amazonlinux:2023".to_string(),
                        buildspec: BuildSpecSource::Inline(spec),
                    }),
                },
            ],
        }
    }

    pub fn source_bundle() -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.txt"), "agent sources").unwrap();
        bundle::pack_directory(dir.path()).unwrap()
    }

    pub fn harness(spec: BuildSpec, build_timeout: Option<Duration>) -> Harness {
        let definition = ProvisioningDefinition::with_standard_policy(pipeline(spec)).unwrap();
        harness_with(definition, build_timeout)
    }

    pub fn harness_with(
        definition: ProvisioningDefinition,
        build_timeout: Option<Duration>,
    ) -> Harness {
        let source = Arc::new(StaticSourceProvider::new());
        source.push("main", COMMIT, source_bundle());

        let store = Arc::new(InMemoryArtifactStore::new());
        let logs = Arc::new(InMemoryLogSink::new());
        let runs = Arc::new(InMemoryRunRepository::new());
        let provider = Arc::new(LocalProvider::new());
        let workspaces = tempfile::tempdir().unwrap();

        let orchestrator = Arc::new(Orchestrator::new(
            definition,
            Collaborators {
                source: source.clone(),
                store: store.clone(),
                logs: logs.clone(),
                runs: runs.clone(),
                environments: provider.clone(),
            },
            Settings {
                console_url: "https://ci.example.com".to_string(),
                build_timeout,
                workspace_base: workspaces.path().to_path_buf(),
            },
        ));

        Harness {
            orchestrator,
            source,
            store,
            logs,
            runs,
            provider,
            _workspaces: workspaces,
        }
    }

    /// Polls until the run reaches a terminal state
    pub async fn wait_for_completion(
        orchestrator: &Orchestrator,
        run_id: Uuid,
    ) -> conduit_core::domain::run::PipelineRun {
        for _ in 0..400 {
            let run = orchestrator.get_run(run_id).await.unwrap();
            if run.state.is_terminal() && orchestrator.in_flight_count().await == 0 {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run {} did not finish", run_id);
    }
}
