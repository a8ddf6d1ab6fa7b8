//! Meridian control plane binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use meridian_core::config::AppConfig;
use meridian_server::bootstrap::ensure_admin_token;
use meridian_server::extractor::TaskExtractor;
use meridian_server::liveness::{
    DisabledRemoteStarter, HealthCheckExecutor, HealthCheckScheduler, InactivityMonitor,
};
use meridian_server::{AppState, create_router, leader};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Meridian - control plane for edge and DNS clusters
#[derive(Parser, Debug)]
#[command(name = "meridiand")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "MERIDIAN_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

/// Merge the optional config file with `MERIDIAN_` environment variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    let has_config_file = std::path::Path::new(path).exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config = std::env::vars()
        .any(|(key, _)| key.starts_with("MERIDIAN_") && key != "MERIDIAN_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: meridiand --config /path/to/config.toml\n  \
             2. Environment variables: MERIDIAN_SERVER__BIND=0.0.0.0:8080 \
             MERIDIAN_ADMIN__TOKEN_HASH=sha256:YOUR_TOKEN_HASH_HERE meridiand\n\n\
             See config/server.example.toml for example configuration."
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("MERIDIAN_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Meridian v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    meridian_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let metadata = meridian_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    ensure_admin_token(metadata.as_ref(), &config.admin)
        .await
        .context("failed to initialize admin token")?;

    let leader = leader::from_config(&config.leader, metadata.clone());
    let state = AppState::new(config.clone(), metadata.clone(), leader.clone());

    let extractor = Arc::new(TaskExtractor::new(
        metadata.clone(),
        leader.clone(),
        state.hub.clone(),
        config.tasks.clone(),
    ));
    extractor.spawn(config.tasks.extract_interval());
    tracing::info!(
        interval_secs = config.tasks.extract_interval_secs,
        "Task extractor spawned"
    );

    if config.health_check.enabled {
        let executor = HealthCheckExecutor::new(metadata.clone(), &config.health_check)
            .context("failed to build health check client")?;
        let scheduler = Arc::new(HealthCheckScheduler::new(
            Arc::new(executor),
            metadata.clone(),
            leader.clone(),
        ));
        scheduler.spawn(config.health_check.interval());
        tracing::info!(
            interval_secs = config.health_check.interval_secs,
            workers = config.health_check.workers,
            "Health check scheduler spawned"
        );
    } else {
        tracing::info!("Active health checks disabled");
    }

    if config.inactivity.enabled {
        let monitor = Arc::new(InactivityMonitor::new(
            metadata.clone(),
            leader.clone(),
            Arc::new(DisabledRemoteStarter),
            config.inactivity.clone(),
        ));
        monitor.spawn(config.inactivity.interval());
        tracing::info!(
            interval_secs = config.inactivity.interval_secs,
            "Inactivity monitor spawned"
        );
    } else {
        tracing::info!("Inactivity monitor disabled");
    }

    state.hub.clone().spawn_sweeper(
        config.command_stream.sweep_interval(),
        config.command_stream.stale_after(),
    );

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
