use anyhow::{Context, Result};
use conduit_orchestrator::config::Config;
use conduit_orchestrator::service::BranchWatcher;
use conduit_orchestrator::{api, app};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_orchestrator=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Conduit Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let orchestrator = app::build_orchestrator(&config).await?;

    if config.poll_interval.is_zero() {
        tracing::info!("Branch polling disabled, waiting for webhooks");
    } else {
        let watcher = BranchWatcher::new(orchestrator.clone(), config.poll_interval);
        tokio::spawn(watcher.run());
    }

    // Build router with all API endpoints
    let app = api::create_router(orchestrator);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
