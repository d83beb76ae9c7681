//! Definition command handlers
//!
//! Evaluates a pipeline definition locally, with the same sandbox and
//! validation the orchestrator applies at startup.

use anyhow::{Result, anyhow};
use clap::Subcommand;
use colored::*;
use conduit_core::domain::pipeline::{BuildSpecSource, StageExecutor};
use conduit_lua::{ProvisioningDefinition, ProvisioningParams, parse_provisioning_file};
use std::path::PathBuf;

/// Definition subcommands
#[derive(Subcommand)]
pub enum DefinitionCommands {
    /// Parse and validate a definition file, then print its stages and roles
    Check {
        /// Path to the definition file
        #[arg(default_value = "pipeline.lua")]
        file: PathBuf,

        /// Provisioning parameter override (repeatable), e.g. branch_name=release
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
}

pub fn handle_definition_command(command: DefinitionCommands) -> Result<()> {
    match command {
        DefinitionCommands::Check { file, params } => {
            let params = parse_params(&params)?;
            let definition = parse_provisioning_file(&file, &params)?;

            println!("{}", "✓ Definition is valid".green().bold());
            println!();
            print_definition(&definition);
            Ok(())
        }
    }
}

fn parse_params(overrides: &[String]) -> Result<ProvisioningParams> {
    let mut params = ProvisioningParams::default();
    for raw in overrides {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid parameter '{}': expected KEY=VALUE", raw))?;
        params.set(key.trim(), value.trim().to_string())?;
    }
    Ok(params)
}

fn print_definition(definition: &ProvisioningDefinition) {
    let pipeline = &definition.pipeline;

    println!("{}", "Pipeline:".bold());
    println!("  Name:           {}", pipeline.name.cyan());
    if let Some(description) = &pipeline.description {
        println!("  Description:    {}", description);
    }
    println!("  Artifact store: {}", pipeline.artifact_store);

    println!("\n{}", "Stages:".bold());
    for (idx, stage) in pipeline.stages.iter().enumerate() {
        let input = stage.input.as_deref().unwrap_or("-");
        println!(
            "  {}. {} ({} -> {})",
            idx + 1,
            stage.name.cyan(),
            input,
            stage.output
        );
        match &stage.executor {
            StageExecutor::Source(source) => {
                println!("     source {} @ {}", source.repository, source.branch);
            }
            StageExecutor::Build(build) => {
                let spec = match &build.buildspec {
                    BuildSpecSource::Inline(_) => "inline".to_string(),
                    BuildSpecSource::File(path) => path.clone(),
                };
                println!(
                    "     build {} on {} (buildspec: {})",
                    build.project, build.image, spec
                );
            }
        }
    }

    println!("\n{}", "Roles:".bold());
    let orchestrator = definition.policy.orchestrator();
    let executors = definition.policy.executors().map(|(_, role)| role);
    for role in std::iter::once(orchestrator).chain(executors) {
        println!("  {} ({})", role.name().cyan(), role.kind());
        for grant in role.grants() {
            println!("     {} {}", grant.action, grant.resource.to_string().dimmed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params_overrides() {
        let params = parse_params(&[
            "branch_name=release".to_string(),
            "executor_image = ubuntu:24.04".to_string(),
        ])
        .unwrap();
        assert_eq!(params.branch_name, "release");
        assert_eq!(params.executor_image, "ubuntu:24.04");
        assert_eq!(
            params.repository_name,
            ProvisioningParams::default().repository_name
        );
    }

    #[test]
    fn test_parse_params_rejects_bad_input() {
        assert!(parse_params(&["branch_name".to_string()]).is_err());
        assert!(parse_params(&["color=blue".to_string()]).is_err());
    }
}
