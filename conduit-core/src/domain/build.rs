//! Build specification types
//!
//! A build spec is the declarative command list executed by the build
//! executor. It is normally read from `buildspec.yml` in the source tree, but
//! can also be declared inline in the pipeline definition.
//!
//! ```yaml
//! version: 0.2
//! always_run_post_build: false
//! env:
//!   variables:
//!     OUTPUT_DIR: output
//! phases:
//!   install:
//!     runtime-versions:
//!       python: "3.11"
//!     commands:
//!       - pip install -r requirements.txt
//!   build:
//!     commands:
//!       - python agent.py --task summarize
//! artifacts:
//!   files:
//!     - output/**/*
//!   discard-paths: no
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::PipelineError;

/// Default location of the build spec inside a source bundle
pub const DEFAULT_BUILDSPEC_PATH: &str = "buildspec.yml";

/// One of the four fixed build phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Install,
    PreBuild,
    Build,
    PostBuild,
}

impl Phase {
    /// Execution order
    pub const ORDER: [Phase; 4] = [Phase::Install, Phase::PreBuild, Phase::Build, Phase::PostBuild];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Install => "install",
            Phase::PreBuild => "pre_build",
            Phase::Build => "build",
            Phase::PostBuild => "post_build",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands for a single phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseCommands {
    /// Runtime pins; only meaningful in the install phase
    #[serde(default, alias = "runtime-versions", skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_versions: BTreeMap<String, String>,

    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phases {
    #[serde(default)]
    pub install: Option<PhaseCommands>,
    #[serde(default)]
    pub pre_build: Option<PhaseCommands>,
    #[serde(default)]
    pub build: Option<PhaseCommands>,
    #[serde(default)]
    pub post_build: Option<PhaseCommands>,
}

impl Phases {
    pub fn get(&self, phase: Phase) -> Option<&PhaseCommands> {
        match phase {
            Phase::Install => self.install.as_ref(),
            Phase::PreBuild => self.pre_build.as_ref(),
            Phase::Build => self.build.as_ref(),
            Phase::PostBuild => self.post_build.as_ref(),
        }
    }

    /// Commands for a phase; empty when the phase is not declared
    pub fn commands(&self, phase: Phase) -> &[String] {
        self.get(phase)
            .map(|p| p.commands.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildEnv {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Files collected into the output bundle after a successful build
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Explicit relative paths or glob patterns (`*`, `?`, `[...]`, `**`)
    #[serde(default)]
    pub files: Vec<String>,

    /// Flatten matched files into the bundle root instead of keeping their paths
    #[serde(default, alias = "discard-paths", deserialize_with = "yes_no")]
    pub discard_paths: bool,

    /// Directory (relative to the workspace) that patterns are resolved against
    #[serde(default, alias = "base-directory")]
    pub base_directory: Option<String>,
}

impl ArtifactManifest {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Returns true when the entry contains glob metacharacters
pub fn is_glob(entry: &str) -> bool {
    entry.contains(['*', '?', '['])
}

/// Declarative build specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default = "default_version", deserialize_with = "version_string")]
    pub version: String,

    /// Run post_build even when the build phase failed
    #[serde(default, alias = "always-run-post-build", deserialize_with = "yes_no")]
    pub always_run_post_build: bool,

    #[serde(default)]
    pub env: BuildEnv,

    #[serde(default)]
    pub phases: Phases,

    #[serde(default)]
    pub artifacts: ArtifactManifest,
}

impl Default for BuildSpec {
    fn default() -> Self {
        Self {
            version: default_version(),
            always_run_post_build: false,
            env: BuildEnv::default(),
            phases: Phases::default(),
            artifacts: ArtifactManifest::default(),
        }
    }
}

impl BuildSpec {
    /// Parses a YAML build spec and validates it
    pub fn from_yaml(source: &str) -> Result<Self, PipelineError> {
        let spec: BuildSpec = serde_yaml::from_str(source)
            .map_err(|e| PipelineError::InvalidDefinition(format!("invalid build spec: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_yaml(&self) -> Result<String, PipelineError> {
        serde_yaml::to_string(self)
            .map_err(|e| PipelineError::InvalidDefinition(format!("invalid build spec: {}", e)))
    }

    /// Runtime pins declared in the install phase
    pub fn runtime_versions(&self) -> BTreeMap<String, String> {
        self.phases
            .install
            .as_ref()
            .map(|p| p.runtime_versions.clone())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        for phase in Phase::ORDER {
            if let Some(commands) = self.phases.get(phase) {
                if commands.commands.iter().any(|c| c.trim().is_empty()) {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "phase {} contains an empty command",
                        phase
                    )));
                }
            }
            if phase != Phase::Install
                && self
                    .phases
                    .get(phase)
                    .is_some_and(|p| !p.runtime_versions.is_empty())
            {
                return Err(PipelineError::InvalidDefinition(format!(
                    "runtime-versions is only allowed in the install phase, found in {}",
                    phase
                )));
            }
        }

        for entry in &self.artifacts.files {
            if entry.starts_with('/') || entry.split('/').any(|part| part == "..") {
                return Err(PipelineError::InvalidDefinition(format!(
                    "artifact entry '{}' must be a relative path inside the workspace",
                    entry
                )));
            }
        }

        for name in self.env.variables.keys() {
            if name.is_empty() || name.contains('=') {
                return Err(PipelineError::InvalidDefinition(format!(
                    "invalid environment variable name '{}'",
                    name
                )));
            }
        }

        Ok(())
    }
}

fn default_version() -> String {
    "0.2".to_string()
}

/// Accepts `version: 0.2` (a YAML float) as well as `version: "0.2"`
fn version_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "version must be a string or number, got {:?}",
            other
        ))),
    }
}

/// Accepts YAML booleans and the `yes`/`no` spelling used by build spec files
fn yes_no<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::Bool(b) => Ok(b),
        serde_yaml::Value::String(s) => match s.to_lowercase().as_str() {
            "yes" | "true" | "on" => Ok(true),
            "no" | "false" | "off" => Ok(false),
            _ => Err(serde::de::Error::custom(format!("expected yes/no, got '{}'", s))),
        },
        serde_yaml::Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected boolean, got {:?}",
            other
        ))),
    }
}
