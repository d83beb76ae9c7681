//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod artifact;
mod definition;
mod init;
mod run;

pub use artifact::ArtifactCommands;
pub use definition::DefinitionCommands;
pub use run::RunCommands;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Trigger, inspect and cancel pipeline runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Inspect stage bundles
    Artifact {
        #[command(subcommand)]
        command: ArtifactCommands,
    },
    /// Work with pipeline definition files
    Definition {
        #[command(subcommand)]
        command: DefinitionCommands,
    },
    /// Scaffold a pipeline project
    Init {
        /// Directory to write the project files into
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
}

/// Route a command to its handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Run { command } => run::handle_run_command(command, config).await,
        Commands::Artifact { command } => artifact::handle_artifact_command(command, config).await,
        Commands::Definition { command } => definition::handle_definition_command(command),
        Commands::Init { dir, force } => init::init_project(&dir, force),
    }
}
