//! Pipeline definition types
//!
//! A pipeline is a fixed, totally ordered list of stages. The first stage
//! pulls source and every following stage builds from the previous stage's
//! output artifact.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::build::{BuildSpec, DEFAULT_BUILDSPEC_PATH};
use crate::error::PipelineError;

/// Default image for build stages
pub const DEFAULT_EXECUTOR_IMAGE: &str = "amazonlinux:2023";

/// Default branch tracked by the source stage
pub const DEFAULT_BRANCH: &str = "main";

/// Pipeline definition
///
/// Built once from the provisioning input and shared read-only by the
/// orchestrator and the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub description: Option<String>,
    /// Name of the artifact store holding every stage's bundles
    pub artifact_store: String,
    pub stages: Vec<StageDefinition>,
}

/// A single stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Artifact consumed by this stage (None for the source stage)
    pub input: Option<String>,
    /// Artifact produced by this stage
    pub output: String,
    pub executor: StageExecutor,
}

/// What runs a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageExecutor {
    Source(SourceConfig),
    Build(BuildConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub repository: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build project name (used in logs and resource names)
    pub project: String,
    /// Pinned runtime image
    pub image: String,
    pub buildspec: BuildSpecSource,
}

/// Where a build stage finds its build spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSpecSource {
    Inline(BuildSpec),
    /// Path relative to the root of the input bundle
    File(String),
}

impl Default for BuildSpecSource {
    fn default() -> Self {
        BuildSpecSource::File(DEFAULT_BUILDSPEC_PATH.to_string())
    }
}

impl PipelineDefinition {
    /// The source stage (always the first stage of a valid definition)
    pub fn source_stage(&self) -> Option<(&StageDefinition, &SourceConfig)> {
        self.stages.first().and_then(|stage| match &stage.executor {
            StageExecutor::Source(config) => Some((stage, config)),
            StageExecutor::Build(_) => None,
        })
    }

    /// Build stages in execution order
    pub fn build_stages(&self) -> impl Iterator<Item = (&StageDefinition, &BuildConfig)> {
        self.stages.iter().filter_map(|stage| match &stage.executor {
            StageExecutor::Build(config) => Some((stage, config)),
            StageExecutor::Source(_) => None,
        })
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Name of the stage that produced `artifact`
    pub fn producer_of(&self, artifact: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.output == artifact)
    }

    /// `(stage, input_stage)` pairs for every build stage
    pub fn build_inputs(&self) -> Vec<(String, String)> {
        self.build_stages()
            .filter_map(|(stage, _)| {
                let input = stage.input.as_deref()?;
                let producer = self.producer_of(input)?;
                Some((stage.name.clone(), producer.name.clone()))
            })
            .collect()
    }

    /// Checks the definition's structural invariants
    ///
    /// - names are non-empty identifiers
    /// - the first stage is the only source stage and has no input
    /// - there are exactly two stages and the second is a build stage consuming
    ///   the source stage's output
    /// - stage names and output names are unique
    pub fn validate(&self) -> Result<(), PipelineError> {
        validate_identifier("pipeline name", &self.name)?;
        validate_identifier("artifact store name", &self.artifact_store)?;

        if self.stages.len() != 2 {
            return Err(invalid(format!(
                "pipeline must have exactly two stages (source then build), found {}",
                self.stages.len()
            )));
        }

        let mut names = HashSet::new();
        let mut outputs = HashSet::new();

        for (idx, stage) in self.stages.iter().enumerate() {
            validate_identifier("stage name", &stage.name)?;
            validate_identifier("output artifact name", &stage.output)?;

            if !names.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage name '{}'", stage.name)));
            }
            if !outputs.insert(stage.output.as_str()) {
                return Err(invalid(format!(
                    "duplicate output artifact '{}'",
                    stage.output
                )));
            }

            match (&stage.executor, idx) {
                (StageExecutor::Source(config), 0) => {
                    if stage.input.is_some() {
                        return Err(invalid(format!(
                            "source stage '{}' cannot consume an input artifact",
                            stage.name
                        )));
                    }
                    if config.repository.trim().is_empty() {
                        return Err(invalid("source repository cannot be empty"));
                    }
                    if config.branch.trim().is_empty() {
                        return Err(invalid("source branch cannot be empty"));
                    }
                }
                (StageExecutor::Source(_), _) => {
                    return Err(invalid(format!(
                        "stage '{}': only the first stage may be a source stage",
                        stage.name
                    )));
                }
                (StageExecutor::Build(_), 0) => {
                    return Err(invalid("the first stage must be a source stage"));
                }
                (StageExecutor::Build(config), _) => {
                    let previous = &self.stages[idx - 1];
                    if stage.input.as_deref() != Some(previous.output.as_str()) {
                        return Err(invalid(format!(
                            "stage '{}' must consume '{}' produced by '{}'",
                            stage.name, previous.output, previous.name
                        )));
                    }
                    if config.image.trim().is_empty() {
                        return Err(invalid(format!(
                            "stage '{}' has no executor image",
                            stage.name
                        )));
                    }
                    validate_identifier("build project name", &config.project)?;
                    match &config.buildspec {
                        BuildSpecSource::Inline(spec) => spec.validate()?,
                        BuildSpecSource::File(path) => {
                            if path.is_empty() || path.starts_with('/') || path.contains("..") {
                                return Err(invalid(format!(
                                    "stage '{}' build spec path '{}' must be relative",
                                    stage.name, path
                                )));
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidDefinition(message.into())
}

fn validate_identifier(what: &str, value: &str) -> Result<(), PipelineError> {
    if value.is_empty() {
        return Err(invalid(format!("{} cannot be empty", what)));
    }
    if value.len() > 100 {
        return Err(invalid(format!("{} '{}' is too long", what, value)));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid || value.starts_with('.') {
        return Err(invalid(format!(
            "{} '{}' may only contain letters, digits, '-', '_' and '.'",
            what, value
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_definition() -> PipelineDefinition {
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
                        branch: DEFAULT_BRANCH.to_string(),
                    }),
                },
                StageDefinition {
                    name: "Build".to_string(),
                    input: Some("SourceCode".to_string()),
                    output: "BuildOutput".to_string(),
                    executor: StageExecutor::Build(BuildConfig {
                        project: "agent-build".to_string(),
                        image: DEFAULT_EXECUTOR_IMAGE.to_string(),
                        buildspec: BuildSpecSource::default(),
                    }),
                },
            ],
        }
    }

    #[test]
    fn test_sample_is_valid() {
        let def = sample_definition();
        assert!(def.validate().is_ok());
        assert_eq!(def.source_stage().unwrap().1.branch, "main");
        assert_eq!(def.build_stages().count(), 1);
        assert_eq!(
            def.build_inputs(),
            vec![("Build".to_string(), "Source".to_string())]
        );
    }

    #[test]
    fn test_requires_source_first() {
        let mut def = sample_definition();
        def.stages.swap(0, 1);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_requires_build_stage() {
        let mut def = sample_definition();
        def.stages.truncate(1);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_rejects_second_build_stage() {
        let mut def = sample_definition();
        let mut deploy = def.stages[1].clone();
        deploy.name = "Deploy".to_string();
        deploy.input = Some("BuildOutput".to_string());
        deploy.output = "DeployOutput".to_string();
        def.stages.push(deploy);

        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("exactly two stages"));
    }

    #[test]
    fn test_build_must_consume_previous_output() {
        let mut def = sample_definition();
        def.stages[1].input = Some("Other".to_string());
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("SourceCode"));
    }

    #[test]
    fn test_rejects_duplicate_stage_names() {
        let mut def = sample_definition();
        def.stages[1].name = "Source".to_string();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let mut def = sample_definition();
        def.name = "has space".to_string();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_rejects_absolute_buildspec_path() {
        let mut def = sample_definition();
        if let StageExecutor::Build(config) = &mut def.stages[1].executor {
            config.buildspec = BuildSpecSource::File("/etc/buildspec.yml".to_string());
        }
        assert!(def.validate().is_err());
    }
}
