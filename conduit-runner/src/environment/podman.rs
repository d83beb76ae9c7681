//! Podman container environment
//!
//! One container per stage invocation:
//! - started detached from the pinned image, sleeping until torn down
//! - workspace bind-mounted at `/workspace`
//! - commands run through `podman exec`
//! - removed with `podman rm -f` on teardown (or on drop as a last resort)

use anyhow::{Context, Result};
use async_trait::async_trait;
use conduit_core::PipelineError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{ActiveCounter, ActiveGuard, Environment, EnvironmentProvider, ProvisionRequest};

const CONTAINER_WORKSPACE: &str = "/workspace";

/// Checks if podman is installed and available
pub async fn check_podman_available() -> Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .await
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct PodmanProvider {
    active: ActiveCounter,
}

impl PodmanProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnvironmentProvider for PodmanProvider {
    fn name(&self) -> &'static str {
        "podman"
    }

    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<Box<dyn Environment>, PipelineError> {
        let container_name = format!(
            "conduit-{}-{}",
            request.run_id,
            request.stage.to_lowercase()
        );

        info!(
            "Creating container {} for image {}",
            container_name, request.image
        );

        // Override entrypoint so images with custom entrypoints still idle
        let output = Command::new("podman")
            .arg("run")
            .arg("-d")
            .arg("--name")
            .arg(&container_name)
            .arg("--entrypoint")
            .arg("/bin/sh")
            .arg("-v")
            .arg(format!(
                "{}:{}",
                request.workspace.display(),
                CONTAINER_WORKSPACE
            ))
            .arg("-w")
            .arg(CONTAINER_WORKSPACE)
            .arg(&request.image)
            .arg("-c")
            .arg("sleep infinity")
            .output()
            .await
            .map_err(|e| {
                PipelineError::Environment(format!("failed to execute podman run: {}", e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stdout.trim().is_empty() {
            debug!("podman run stdout: {}", stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!("podman run stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            let error_msg = format!(
                "Failed to start container for image {}: exit_code={}, stderr='{}'",
                request.image,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
            error!("{}", error_msg);
            // A failed `run` can still leave a created container behind
            remove_container_blocking(&container_name);
            return Err(PipelineError::Environment(error_msg));
        }

        info!(
            "Container {} started with ID: {}",
            container_name,
            stdout.trim()
        );

        Ok(Box::new(PodmanEnvironment {
            container_name,
            workspace: request.workspace.clone(),
            removed: false,
            _guard: self.active.acquire(),
        }))
    }

    fn active(&self) -> usize {
        self.active.get()
    }
}

struct PodmanEnvironment {
    container_name: String,
    workspace: PathBuf,
    removed: bool,
    _guard: ActiveGuard,
}

#[async_trait]
impl Environment for PodmanEnvironment {
    fn id(&self) -> &str {
        &self.container_name
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn command(&self, script: &str, env: &BTreeMap<String, String>) -> Command {
        let mut command = Command::new("podman");
        command.arg("exec").arg("-w").arg(CONTAINER_WORKSPACE);
        for (key, value) in env {
            command.arg("-e").arg(format!("{}={}", key, value));
        }
        command
            .arg(&self.container_name)
            .arg("/bin/sh")
            .arg("-c")
            .arg(script);
        command
    }

    async fn teardown(mut self: Box<Self>) -> Result<(), PipelineError> {
        debug!("Removing container {}", self.container_name);

        let output = Command::new("podman")
            .arg("rm")
            .arg("-f")
            .arg(&self.container_name)
            .output()
            .await
            .map_err(|e| {
                PipelineError::Environment(format!(
                    "failed to remove container {}: {}",
                    self.container_name, e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Environment(format!(
                "failed to remove container {}: {}",
                self.container_name,
                stderr.trim()
            )));
        }

        self.removed = true;
        info!("Container {} removed", self.container_name);
        Ok(())
    }
}

impl Drop for PodmanEnvironment {
    fn drop(&mut self) {
        if !self.removed {
            warn!(
                "Container {} dropped without teardown, removing",
                self.container_name
            );
            remove_container_blocking(&self.container_name);
        }
    }
}

fn remove_container_blocking(container_name: &str) {
    match std::process::Command::new("podman")
        .arg("rm")
        .arg("-f")
        .arg(container_name)
        .output()
    {
        Ok(output) if output.status.success() => {
            debug!("Container {} removed", container_name);
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Failed to remove container {}: {}", container_name, stderr);
        }
        Err(e) => {
            warn!("Failed to remove container {}: {}", container_name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_command_shape() {
        let env = PodmanEnvironment {
            container_name: "conduit-test-build".to_string(),
            workspace: PathBuf::from("/tmp/ws"),
            // Nothing was started, skip the drop-time removal
            removed: true,
            _guard: ActiveCounter::default().acquire(),
        };

        let mut vars = BTreeMap::new();
        vars.insert("CONDUIT_STAGE".to_string(), "Build".to_string());
        let command = env.command("make test", &vars);
        let std_command = command.as_std();

        assert_eq!(std_command.get_program(), "podman");
        let args: Vec<_> = std_command
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec![
                "exec",
                "-w",
                "/workspace",
                "-e",
                "CONDUIT_STAGE=Build",
                "conduit-test-build",
                "/bin/sh",
                "-c",
                "make test"
            ]
        );
    }

    #[test]
    fn test_provider_starts_empty() {
        let provider = PodmanProvider::new();
        assert_eq!(provider.active(), 0);
        assert_eq!(provider.name(), "podman");
    }
}
