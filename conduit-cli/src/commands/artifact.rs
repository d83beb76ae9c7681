//! Artifact command handlers

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use colored::*;
use conduit_client::OrchestratorClient;
use conduit_core::domain::artifact::ArtifactVersion;
use std::path::PathBuf;

use crate::config::Config;
use crate::id_resolver::resolve_run_id;

/// Artifact subcommands
#[derive(Subcommand)]
pub enum ArtifactCommands {
    /// List the stored versions of a stage's bundle
    Versions {
        /// Run ID or unambiguous prefix
        id: String,
        stage: String,
    },
    /// Download a stage's bundle as a tar archive
    Get {
        /// Run ID or unambiguous prefix
        id: String,
        stage: String,

        /// Version to fetch: latest, 3 or v3
        #[arg(long, default_value = "latest")]
        version: String,

        /// Output file (defaults to <stage>-<version>.tar)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub async fn handle_artifact_command(command: ArtifactCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        ArtifactCommands::Versions { id, stage } => list_versions(&client, &id, &stage).await,
        ArtifactCommands::Get {
            id,
            stage,
            version,
            output,
        } => download(&client, &id, &stage, &version, output).await,
    }
}

async fn list_versions(client: &OrchestratorClient, id: &str, stage: &str) -> Result<()> {
    let run_id = resolve_run_id(client, id).await?;
    let versions = client.artifact_versions(run_id, stage).await?;

    if versions.versions.is_empty() {
        println!("{}", format!("No bundles stored for {}.", stage).yellow());
        return Ok(());
    }

    println!("{}", versions.key.path().bold());
    for version in &versions.versions {
        println!("  {} {}", "▸".cyan(), version);
    }

    Ok(())
}

async fn download(
    client: &OrchestratorClient,
    id: &str,
    stage: &str,
    version: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let version = parse_version(version)?;
    let run_id = resolve_run_id(client, id).await?;

    let bytes = client.download_artifact(run_id, stage, version).await?;

    let label = version
        .map(|v| v.to_string())
        .unwrap_or_else(|| "latest".to_string());
    let path = output.unwrap_or_else(|| PathBuf::from(format!("{}-{}.tar", stage, label)));
    std::fs::write(&path, &bytes)
        .with_context(|| format!("Failed to write bundle to {}", path.display()))?;

    println!(
        "  {} {} ({} bytes)",
        "Saved".green(),
        path.display().to_string().cyan(),
        bytes.len()
    );

    Ok(())
}

fn parse_version(raw: &str) -> Result<Option<ArtifactVersion>> {
    if raw == "latest" {
        return Ok(None);
    }
    raw.trim_start_matches('v')
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .map(|n| Some(ArtifactVersion(n)))
        .ok_or_else(|| anyhow!("Invalid version '{}': expected latest, N or vN", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("latest").unwrap(), None);
        assert_eq!(parse_version("v2").unwrap(), Some(ArtifactVersion(2)));
        assert_eq!(parse_version("7").unwrap(), Some(ArtifactVersion(7)));
        assert!(parse_version("0").is_err());
        assert!(parse_version("head").is_err());
    }
}
