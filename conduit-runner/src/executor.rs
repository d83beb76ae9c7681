//! Build executor
//!
//! One [`BuildExecutor::execute`] call is one stage invocation:
//!
//! 1. check the stage's executor role and read the input bundle through it
//! 2. unpack the bundle into a fresh workspace and resolve the build spec
//! 3. provision a single-use environment pinned to the stage image
//! 4. run install, pre_build, build, post_build; the first non-zero exit
//!    aborts the remaining phases
//! 5. on success, pack the artifact manifest into the output bundle
//! 6. tear the environment down, whatever happened before
//!
//! The output bundle is returned to the caller, which owns publishing it.

use conduit_core::domain::access::{Action, require, resource};
use conduit_core::domain::access::AccessPolicy;
use conduit_core::domain::artifact::{ArtifactKey, ArtifactVersion};
use conduit_core::domain::build::{BuildSpec, Phase};
use conduit_core::domain::log::LogKey;
use conduit_core::domain::pipeline::BuildSpecSource;
use conduit_core::logsink::LogSink;
use conduit_core::store::{ArtifactStore, AuthorizedStore};
use conduit_core::{CancelSignal, PipelineError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bundle;
use crate::environment::{Environment, EnvironmentProvider, ProvisionRequest};
use crate::logs::{LogStream, StageLogger};

/// One stage invocation
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub run_id: Uuid,
    pub pipeline: String,
    pub stage: String,
    pub project: String,
    /// Pinned runtime image
    pub image: String,
    pub buildspec: BuildSpecSource,
    /// Bundle produced by the previous stage
    pub input: ArtifactKey,
    pub input_version: ArtifactVersion,
    pub commit: Option<String>,
}

/// A successful build's output bundle
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub bundle: Vec<u8>,
    /// Paths stored in the bundle
    pub files: Vec<String>,
}

pub struct BuildExecutor {
    provider: Arc<dyn EnvironmentProvider>,
    store: Arc<dyn ArtifactStore>,
    logs: Arc<dyn LogSink>,
    policy: Arc<AccessPolicy>,
    store_name: String,
    workspace_base: PathBuf,
}

impl BuildExecutor {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        store: Arc<dyn ArtifactStore>,
        logs: Arc<dyn LogSink>,
        policy: Arc<AccessPolicy>,
        store_name: impl Into<String>,
        workspace_base: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            store,
            logs,
            policy,
            store_name: store_name.into(),
            workspace_base: workspace_base.into(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn EnvironmentProvider> {
        &self.provider
    }

    /// Runs one build stage
    ///
    /// Returns the output bundle on success. Every failure, including
    /// cancellation, returns an error and publishes nothing. All output is
    /// written to the `(run_id, stage)` log stream before this returns.
    pub async fn execute(
        &self,
        request: &BuildRequest,
        cancel: &CancelSignal,
    ) -> Result<BuildOutput, PipelineError> {
        let role = self.policy.executor(&request.stage).ok_or_else(|| {
            PipelineError::InvalidDefinition(format!(
                "no executor role bound to stage '{}'",
                request.stage
            ))
        })?;
        require(
            role,
            Action::LogWrite,
            &resource::logs(&request.pipeline, &request.stage),
        )?;

        let stream = LogStream::open(
            self.logs.clone(),
            LogKey::new(request.run_id, request.stage.as_str()),
        );
        let logger = stream.logger();

        info!(
            "Executing stage {} of run {} ({}) on {}",
            request.stage,
            request.run_id,
            request.project,
            self.provider.name()
        );

        let store = AuthorizedStore::new(self.store.clone(), self.store_name.as_str(), role.clone());
        let result = self.execute_with_store(request, &store, &logger, cancel).await;

        match &result {
            Ok(output) => logger.info(format!(
                "Build succeeded, output bundle has {} file(s)",
                output.files.len()
            )),
            Err(e) => logger.error(format!("Build failed: {}", e)),
        }
        drop(logger);

        let flushed = stream.close().await;
        match (result, flushed) {
            (Ok(output), Ok(lines)) => {
                debug!("Stage {} wrote {} log lines", request.stage, lines);
                Ok(output)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }

    async fn execute_with_store(
        &self,
        request: &BuildRequest,
        store: &AuthorizedStore,
        logger: &StageLogger,
        cancel: &CancelSignal,
    ) -> Result<BuildOutput, PipelineError> {
        let input = store
            .get(&request.input, Some(request.input_version))
            .await?;
        logger.info(format!(
            "Downloaded input {} {} ({} bytes)",
            request.input, request.input_version, input.len()
        ));

        std::fs::create_dir_all(&self.workspace_base).map_err(|e| {
            PipelineError::Environment(format!(
                "failed to create workspace base {}: {}",
                self.workspace_base.display(),
                e
            ))
        })?;
        // Removed on drop, after the environment is gone
        let workspace = tempfile::Builder::new()
            .prefix(&format!("conduit-{}-", request.stage.to_lowercase()))
            .tempdir_in(&self.workspace_base)
            .map_err(|e| PipelineError::Environment(format!("failed to create workspace: {}", e)))?;

        let entries = bundle::unpack(&input, workspace.path())?;
        debug!(
            "Unpacked {} entries into {}",
            entries,
            workspace.path().display()
        );

        let spec = resolve_buildspec(&request.buildspec, workspace.path())?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let environment = self
            .provider
            .provision(&ProvisionRequest {
                run_id: request.run_id,
                stage: request.stage.clone(),
                image: request.image.clone(),
                workspace: workspace.path().to_path_buf(),
            })
            .await?;
        logger.info(format!(
            "Provisioned environment {} from image {}",
            environment.id(),
            request.image
        ));

        let mut groups = ProcessGroups::default();
        let result = run_build(
            environment.as_ref(),
            &spec,
            request,
            logger,
            &mut groups,
            cancel,
        )
        .await;
        // Nothing started by the build outlives it
        groups.kill_all();

        let environment_id = environment.id().to_string();
        let teardown = environment.teardown().await;
        match teardown {
            Ok(()) => logger.info(format!("Released environment {}", environment_id)),
            Err(ref e) => {
                warn!("Teardown of {} failed: {}", environment_id, e);
                logger.error(format!("Failed to release environment {}: {}", environment_id, e));
            }
        }

        let output = result?;
        teardown?;
        Ok(output)
    }
}

/// Loads the build spec for a stage
///
/// File specs are read from the unpacked input bundle.
fn resolve_buildspec(source: &BuildSpecSource, workspace: &Path) -> Result<BuildSpec, PipelineError> {
    match source {
        BuildSpecSource::Inline(spec) => {
            spec.validate()?;
            Ok(spec.clone())
        }
        BuildSpecSource::File(path) => {
            let full = workspace.join(path);
            let content = std::fs::read_to_string(&full).map_err(|e| {
                PipelineError::InvalidDefinition(format!(
                    "build spec '{}' not readable from input bundle: {}",
                    path, e
                ))
            })?;
            BuildSpec::from_yaml(&content)
        }
    }
}

/// Variables exported to every command
fn build_environment(spec: &BuildSpec, request: &BuildRequest) -> BTreeMap<String, String> {
    let mut vars = spec.env.variables.clone();

    for (runtime, version) in spec.runtime_versions() {
        let name = runtime
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect::<String>();
        vars.insert(format!("CONDUIT_RUNTIME_{}", name), version);
    }

    vars.insert("CONDUIT_RUN_ID".to_string(), request.run_id.to_string());
    vars.insert("CONDUIT_PIPELINE".to_string(), request.pipeline.clone());
    vars.insert("CONDUIT_STAGE".to_string(), request.stage.clone());
    if let Some(commit) = &request.commit {
        vars.insert("CONDUIT_COMMIT".to_string(), commit.clone());
    }

    vars
}

async fn run_build(
    environment: &dyn Environment,
    spec: &BuildSpec,
    request: &BuildRequest,
    logger: &StageLogger,
    groups: &mut ProcessGroups,
    cancel: &CancelSignal,
) -> Result<BuildOutput, PipelineError> {
    let vars = build_environment(spec, request);

    for (runtime, version) in spec.runtime_versions() {
        logger.info(format!("Runtime {} pinned to {}", runtime, version));
    }

    let mut failure: Option<(Phase, PipelineError)> = None;

    for phase in Phase::ORDER {
        if let Some((failed, _)) = &failure {
            let runs_anyway = phase == Phase::PostBuild
                && *failed == Phase::Build
                && spec.always_run_post_build;
            if !runs_anyway {
                logger.info(format!("Skipping phase {}", phase));
                continue;
            }
        }

        let commands = spec.phases.commands(phase);
        if commands.is_empty() {
            continue;
        }

        logger.info(format!("Entering phase {}", phase));
        match run_phase(environment, phase, commands, &vars, logger, groups, cancel).await {
            Ok(()) => logger.info(format!("Phase complete: {} State: SUCCEEDED", phase)),
            Err(PipelineError::Cancelled) => {
                logger.error(format!("Phase {} interrupted by cancellation", phase));
                return Err(PipelineError::Cancelled);
            }
            Err(e) => {
                logger.error(format!("Phase complete: {} State: FAILED", phase));
                if failure.is_none() {
                    failure = Some((phase, e));
                }
            }
        }
    }

    if let Some((_, e)) = failure {
        return Err(e);
    }

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    if spec.artifacts.is_empty() {
        logger.warn("No artifact files declared, output bundle is empty");
        return Ok(BuildOutput {
            bundle: bundle::pack(&[])?,
            files: Vec::new(),
        });
    }

    let collected = bundle::collect(environment.workspace(), &spec.artifacts)?;
    for entry in &collected.unmatched {
        logger.warn(format!("Artifact entry '{}' matched no files", entry));
    }
    let files: Vec<String> = collected.files.iter().map(|f| f.name.clone()).collect();
    for file in &files {
        logger.info(format!("Adding {} to output bundle", file));
    }

    Ok(BuildOutput {
        bundle: bundle::pack(&collected.files)?,
        files,
    })
}

async fn run_phase(
    environment: &dyn Environment,
    phase: Phase,
    commands: &[String],
    vars: &BTreeMap<String, String>,
    logger: &StageLogger,
    groups: &mut ProcessGroups,
    cancel: &CancelSignal,
) -> Result<(), PipelineError> {
    for command in commands {
        logger.info(format!("Running command {}", command));
        let exit_code = run_command(environment, command, vars, logger, groups, cancel).await?;
        if exit_code != 0 {
            logger.error(format!(
                "Command did not exit successfully {} exit status {}",
                command, exit_code
            ));
            return Err(PipelineError::BuildPhase {
                phase,
                command: command.clone(),
                exit_code,
            });
        }
    }
    Ok(())
}

/// Runs one command, streaming its output, and returns its exit code
///
/// The command leads its own process group, so cancellation also stops
/// anything it started in the background.
async fn run_command(
    environment: &dyn Environment,
    script: &str,
    vars: &BTreeMap<String, String>,
    logger: &StageLogger,
    groups: &mut ProcessGroups,
    cancel: &CancelSignal,
) -> Result<i32, PipelineError> {
    let mut command = environment.command(script, vars);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| PipelineError::Environment(format!("failed to spawn command: {}", e)))?;
    groups.track(child.id());

    let readers: Vec<JoinHandle<()>> = [
        child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, logger.clone(), false))),
        child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, logger.clone(), true))),
    ]
    .into_iter()
    .flatten()
    .collect();
    let aborts: Vec<AbortHandle> = readers.iter().map(|r| r.abort_handle()).collect();

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| {
            PipelineError::Environment(format!("failed to wait for command: {}", e))
        })?,
        _ = cancel.cancelled() => {
            groups.kill_all();
            if let Err(e) = child.kill().await {
                warn!("Failed to kill cancelled command: {}", e);
            }
            aborts.iter().for_each(AbortHandle::abort);
            return Err(PipelineError::Cancelled);
        }
    };

    // Background processes inherit the pipes and can hold them open after
    // the shell itself has exited
    let drained = async {
        for reader in readers {
            if let Err(e) = reader.await {
                warn!("Output reader failed: {}", e);
            }
        }
    };
    tokio::select! {
        _ = drained => {}
        _ = cancel.cancelled() => {
            groups.kill_all();
            aborts.iter().for_each(AbortHandle::abort);
            return Err(PipelineError::Cancelled);
        }
    }

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    // None when the process was killed by a signal
    Ok(status.code().unwrap_or(-1))
}

/// Process groups led by the commands of one invocation
#[derive(Debug, Default)]
struct ProcessGroups(Vec<u32>);

impl ProcessGroups {
    fn track(&mut self, pid: Option<u32>) {
        self.0.extend(pid);
    }

    /// Sends SIGKILL to every tracked group
    fn kill_all(&self) {
        for pid in &self.0 {
            kill_process_group(*pid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, logger: StageLogger, stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if stderr {
                    logger.warn(line);
                } else {
                    logger.info(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                logger.error(format!("Failed to read command output: {}", e));
                break;
            }
        }
    }
}
