//! Host-process environment
//!
//! Runs commands with `sh -c` directly in the workspace directory. There is
//! no image isolation; the pinned image is only recorded. Used for
//! development and tests.

use async_trait::async_trait;
use conduit_core::PipelineError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::{ActiveCounter, ActiveGuard, Environment, EnvironmentProvider, ProvisionRequest};

#[derive(Debug, Default, Clone)]
pub struct LocalProvider {
    active: ActiveCounter,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnvironmentProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<Box<dyn Environment>, PipelineError> {
        if !request.workspace.is_dir() {
            return Err(PipelineError::Environment(format!(
                "workspace {} does not exist",
                request.workspace.display()
            )));
        }

        debug!(
            "Local environment for run {} stage {} (image {} not enforced)",
            request.run_id, request.stage, request.image
        );

        Ok(Box::new(LocalEnvironment {
            id: format!("local-{}-{}", request.run_id, request.stage.to_lowercase()),
            workspace: request.workspace.clone(),
            _guard: self.active.acquire(),
        }))
    }

    fn active(&self) -> usize {
        self.active.get()
    }
}

struct LocalEnvironment {
    id: String,
    workspace: PathBuf,
    _guard: ActiveGuard,
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn command(&self, script: &str, env: &BTreeMap<String, String>) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .current_dir(&self.workspace)
            .envs(env);
        command
    }

    async fn teardown(self: Box<Self>) -> Result<(), PipelineError> {
        debug!("Local environment {} released", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(workspace: &Path) -> ProvisionRequest {
        ProvisionRequest {
            run_id: Uuid::new_v4(),
            stage: "Build".to_string(),
            image: "amazonlinux:2023".to_string(),
            workspace: workspace.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_runs_in_workspace_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new();
        let env = provider.provision(&request(dir.path())).await.unwrap();
        assert_eq!(provider.active(), 1);

        let mut vars = BTreeMap::new();
        vars.insert("GREETING".to_string(), "hello".to_string());
        let output = env
            .command("echo $GREETING > out.txt", &vars)
            .output()
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "hello\n"
        );

        env.teardown().await.unwrap();
        assert_eq!(provider.active(), 0);
    }

    #[tokio::test]
    async fn test_missing_workspace_is_an_environment_error() {
        let provider = LocalProvider::new();
        let result = provider
            .provision(&request(Path::new("/nonexistent/conduit-workspace")))
            .await;
        assert!(matches!(result, Err(PipelineError::Environment(_))));
        assert_eq!(provider.active(), 0);
    }

    #[tokio::test]
    async fn test_dropping_environment_releases_it() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new();
        let env = provider.provision(&request(dir.path())).await.unwrap();
        drop(env);
        assert_eq!(provider.active(), 0);
    }
}
