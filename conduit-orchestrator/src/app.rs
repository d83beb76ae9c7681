//! Wiring of the orchestrator from configuration
//!
//! Every backend has an in-memory fallback so the orchestrator can run with
//! nothing but a definition file and a repository URL.

use anyhow::{Context, Result};
use conduit_core::logsink::LogSink;
use conduit_core::memory::{InMemoryArtifactStore, InMemoryLogSink};
use conduit_core::store::ArtifactStore;
use conduit_runner::environment::check_podman_available;
use conduit_runner::{EnvironmentProvider, LocalProvider, PodmanProvider};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, ExecutorBackend};
use crate::db;
use crate::repository::{InMemoryRunRepository, PgLogSink, PgRunRepository, RunRepository};
use crate::service::{Collaborators, Orchestrator, Settings};
use crate::source::GitSourceProvider;
use crate::storage::{ArtifactCipher, FsArtifactStore};

/// Builds the orchestrator described by `config`
///
/// Runs left unfinished by a previous process are failed before this returns.
pub async fn build_orchestrator(config: &Config) -> Result<Arc<Orchestrator>> {
    let definition = conduit_lua::parse_provisioning_file(&config.pipeline_definition, &config.params)?;
    info!(
        "Loaded pipeline '{}' with {} stage(s)",
        definition.pipeline.name,
        definition.pipeline.stages.len()
    );

    let (runs, logs): (Arc<dyn RunRepository>, Arc<dyn LogSink>) = match &config.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            (
                Arc::new(PgRunRepository::new(pool.clone())),
                Arc::new(PgLogSink::new(pool)),
            )
        }
        None => {
            warn!("DATABASE_URL not set, runs and logs are kept in memory");
            (
                Arc::new(InMemoryRunRepository::new()),
                Arc::new(InMemoryLogSink::new()),
            )
        }
    };

    let store: Arc<dyn ArtifactStore> = match (&config.artifact_root, &config.artifact_key) {
        (Some(root), Some(key)) => {
            let cipher = ArtifactCipher::from_base64(key).context("Invalid ARTIFACT_KEY")?;
            let store = FsArtifactStore::open(root, cipher)
                .with_context(|| format!("Failed to open artifact store {}", root.display()))?;
            info!("Artifact store at {}", root.display());
            Arc::new(store)
        }
        _ => {
            warn!("ARTIFACT_ROOT not set, artifacts are kept in memory");
            Arc::new(InMemoryArtifactStore::new())
        }
    };

    let repository_url = config
        .repository_url
        .as_deref()
        .context("REPOSITORY_URL must be set")?;
    let source = Arc::new(GitSourceProvider::new(repository_url, &config.source_cache));

    let environments: Arc<dyn EnvironmentProvider> = match config.executor_backend {
        ExecutorBackend::Podman => {
            check_podman_available().await?;
            Arc::new(PodmanProvider::new())
        }
        ExecutorBackend::Local => {
            warn!("Builds run as host processes without image isolation");
            Arc::new(LocalProvider::new())
        }
    };

    tokio::fs::create_dir_all(&config.workspace_base)
        .await
        .with_context(|| {
            format!(
                "Failed to create workspace directory {}",
                config.workspace_base.display()
            )
        })?;

    let orchestrator = Arc::new(Orchestrator::new(
        definition,
        Collaborators {
            source,
            store,
            logs,
            runs,
            environments,
        },
        Settings {
            console_url: config.console_base().to_string(),
            build_timeout: config.build_timeout,
            workspace_base: config.workspace_base.clone(),
        },
    ));

    orchestrator
        .recover()
        .await
        .context("Failed to recover interrupted runs")?;

    Ok(orchestrator)
}
