//! Run command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conduit_client::OrchestratorClient;
use conduit_core::domain::log::{LogEntry, LogLevel};
use conduit_core::domain::run::{PipelineRun, RunState, StageStatus};
use conduit_core::dto::run::{RunStatus, TriggerRun};

use crate::config::Config;
use crate::id_resolver::resolve_run_id;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// Start a run manually
    Trigger {
        /// Branch to build (defaults to the tracked branch)
        #[arg(short, long)]
        branch: Option<String>,

        /// Commit to build (defaults to the branch head)
        #[arg(short, long)]
        commit: Option<String>,
    },
    /// List recent runs
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a run with every stage
    Get {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Show the log stream of one stage
    Logs {
        /// Run ID or unambiguous prefix
        id: String,

        /// Stage name (e.g. Source, Build)
        stage: String,
    },
    /// Cancel an in-flight run
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,
    },
}

pub async fn handle_run_command(command: RunCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        RunCommands::Trigger { branch, commit } => trigger_run(&client, branch, commit).await,
        RunCommands::List { limit } => list_runs(&client, limit).await,
        RunCommands::Get { id } => get_run(&client, &id).await,
        RunCommands::Logs { id, stage } => get_stage_logs(&client, &id, &stage).await,
        RunCommands::Cancel { id } => cancel_run(&client, &id).await,
    }
}

async fn trigger_run(
    client: &OrchestratorClient,
    branch: Option<String>,
    commit: Option<String>,
) -> Result<()> {
    let accepted = client.trigger_run(TriggerRun { branch, commit }).await?;

    println!("{}", "✓ Run accepted".green().bold());
    println!("  ID:     {}", accepted.run_id.to_string().cyan());
    println!("  Status: {}{}", client.base_url(), accepted.status_url);

    Ok(())
}

async fn list_runs(client: &OrchestratorClient, limit: usize) -> Result<()> {
    let runs = client.list_runs(Some(limit)).await?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} run(s):", runs.len()).bold());
    println!();
    for run in runs {
        print_run_summary(&run);
    }

    Ok(())
}

async fn get_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let run_id = resolve_run_id(client, id).await?;

    let status = client.get_run(run_id).await?;
    let run = client.get_run_detail(run_id).await?;
    print_run_details(&run, &status.console_url);

    Ok(())
}

async fn get_stage_logs(client: &OrchestratorClient, id: &str, stage: &str) -> Result<()> {
    let run_id = resolve_run_id(client, id).await?;
    let logs = client.stage_logs(run_id, stage).await?;

    if logs.entries.is_empty() {
        println!(
            "{}",
            format!("No logs recorded for stage {} of run {}.", stage, run_id).yellow()
        );
        return Ok(());
    }

    println!("{}", format!("Logs for {} of run {}:", stage, run_id).bold());
    println!("{}", "─".repeat(80).dimmed());
    for entry in &logs.entries {
        print_log_entry(entry);
    }
    println!("{}", "─".repeat(80).dimmed());

    Ok(())
}

async fn cancel_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let run_id = resolve_run_id(client, id).await?;

    match client.cancel_run(run_id).await {
        Ok(status) => {
            println!("{}", "✓ Cancellation requested".green().bold());
            print_run_summary(&status);
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            println!(
                "{}",
                format!("Run {} has already finished.", run_id).yellow()
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_run_summary(run: &RunStatus) {
    println!("  {} Run {}", "▸".cyan(), run.run_id.to_string().dimmed());
    println!("    Pipeline: {}", run.pipeline);
    println!("    State:    {}", colorize_state(run.state));
    if let Some(stage) = &run.current_stage {
        let status = run
            .stage_status
            .map(|s| colorize_stage(s).to_string())
            .unwrap_or_default();
        println!("    Stage:    {} {}", stage, status);
    }
    println!(
        "    Commit:   {} @ {}",
        run.branch,
        run.commit.as_deref().unwrap_or("-").dimmed()
    );
    println!(
        "    Created:  {}",
        run.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!("    Console:  {}", run.console_url.underline());
    println!();
}

fn print_run_details(run: &PipelineRun, console_url: &str) {
    println!("{}", "Run Details:".bold());
    println!("  ID:        {}", run.id.to_string().cyan());
    println!("  Pipeline:  {}", run.pipeline);
    println!("  State:     {}", colorize_state(run.state));
    println!("  Trigger:   {:?} on {}", run.trigger.source, run.trigger.branch);
    if let Some(commit) = &run.commit {
        println!("  Commit:    {}", commit);
    }
    println!("  Created:   {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
        let duration = completed.signed_duration_since(run.created_at);
        println!("  Duration:  {}s", duration.num_seconds());
    }
    println!("  Console:   {}", console_url.underline());

    println!("\n{}", "Stages:".bold());
    for stage in &run.stages {
        print!("  {:<12} {}", stage.name, colorize_stage(stage.status));
        if let Some(artifact) = &stage.artifact {
            print!(
                "  {} {} ({} bytes)",
                artifact.name,
                artifact.version,
                artifact.size
            );
        }
        if let Some(code) = stage.exit_code {
            print!("  exit {}", code);
        }
        println!();
    }

    if let Some(failure) = &run.failure {
        println!("\n{}", "Failure:".bold());
        println!("  Kind:    {:?}", failure.kind);
        if let Some(stage) = &failure.stage {
            println!("  Stage:   {}", stage);
        }
        println!("  {}", failure.message.red());
    }
}

fn print_log_entry(log: &LogEntry) {
    let level_str = format!("{:?}", log.level).to_uppercase();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };

    println!(
        "{} [{}] {}",
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        level_colored,
        log.message
    );
}

fn colorize_state(state: RunState) -> ColoredString {
    let text = state.to_string();
    match state {
        RunState::Idle => text.yellow(),
        RunState::SourcePulled | RunState::Building => text.cyan(),
        RunState::Succeeded => text.green(),
        RunState::Failed => text.red(),
    }
}

fn colorize_stage(status: StageStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        StageStatus::Pending => text.dimmed(),
        StageStatus::Running => text.cyan(),
        StageStatus::Succeeded => text.green(),
        StageStatus::Failed => text.red(),
    }
}
