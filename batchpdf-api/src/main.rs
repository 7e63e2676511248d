use anyhow::Context;
use batchpdf::CommandEngine;
use batchpdf_api::{app, spawn_retention_sweeper, AppState, ServerConfig};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired runs are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batchpdf=info,batchpdf_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    let output_dir = config.output_dir();
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("cannot create {}", output_dir.display()))?;

    let engine = config
        .engine
        .as_deref()
        .and_then(|command| CommandEngine::from_command_line(command, output_dir.clone()))
        .context("BATCHPDF_ENGINE must name the engine program")?;

    let bind_addr = config.bind_addr;
    let retention = config.retention;
    let state = AppState::new(engine, config);
    spawn_retention_sweeper(state.runs(), retention, SWEEP_INTERVAL);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("cannot bind {bind_addr}"))?;

    info!("batchpdf API listening on http://{bind_addr}");

    axum::serve(listener, app(state)).await?;
    Ok(())
}
