//! Provisioning definition
//!
//! The typed result of evaluating a pipeline definition file: the pipeline
//! itself plus the roles that bound each component. It is validated once at
//! startup and never mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::domain::access::AccessPolicy;
use crate::domain::pipeline::{DEFAULT_BRANCH, DEFAULT_EXECUTOR_IMAGE, PipelineDefinition};
use crate::error::PipelineError;

/// Parameters a definition file can reference through the `params` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningParams {
    pub repository_name: String,
    pub branch_name: String,
    pub executor_image: String,
}

impl Default for ProvisioningParams {
    fn default() -> Self {
        Self {
            repository_name: "agent-repository".to_string(),
            branch_name: DEFAULT_BRANCH.to_string(),
            executor_image: DEFAULT_EXECUTOR_IMAGE.to_string(),
        }
    }
}

impl ProvisioningParams {
    /// Overrides a parameter by name
    pub fn set(&mut self, key: &str, value: String) -> Result<(), PipelineError> {
        match key {
            "repository_name" => self.repository_name = value,
            "branch_name" => self.branch_name = value,
            "executor_image" => self.executor_image = value,
            _ => {
                return Err(PipelineError::InvalidDefinition(format!(
                    "unknown provisioning parameter '{}'",
                    key
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningDefinition {
    pub pipeline: PipelineDefinition,
    pub policy: AccessPolicy,
}

impl ProvisioningDefinition {
    /// Builds a definition with the standard least-privilege roles
    pub fn with_standard_policy(pipeline: PipelineDefinition) -> Result<Self, PipelineError> {
        pipeline.validate()?;
        let repository = pipeline
            .source_stage()
            .map(|(_, source)| source.repository.clone())
            .ok_or_else(|| PipelineError::InvalidDefinition("missing source stage".to_string()))?;

        let policy = AccessPolicy::standard(
            &pipeline.artifact_store,
            &pipeline.name,
            &repository,
            &pipeline.build_inputs(),
        );

        let definition = Self { pipeline, policy };
        definition.validate()?;
        Ok(definition)
    }

    /// Validates the pipeline and the policy together
    ///
    /// Every build stage must have an executor role and no role may exist for
    /// a stage that is not a build stage.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.pipeline.validate()?;
        self.policy.validate(
            &self.pipeline.artifact_store,
            &self.pipeline.name,
            &self.pipeline.build_inputs(),
        )?;

        for (stage, _) in self.pipeline.build_stages() {
            if self.policy.executor(&stage.name).is_none() {
                return Err(PipelineError::InvalidDefinition(format!(
                    "build stage '{}' has no executor role",
                    stage.name
                )));
            }
        }

        for (stage, role) in self.policy.executors() {
            let is_build = self
                .pipeline
                .build_stages()
                .any(|(s, _)| &s.name == stage);
            if !is_build {
                return Err(PipelineError::InvalidDefinition(format!(
                    "role '{}' is bound to unknown build stage '{}'",
                    role.name(),
                    stage
                )));
            }
        }

        Ok(())
    }
}
