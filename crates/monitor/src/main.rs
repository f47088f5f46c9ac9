//! Container Monitor - live resource usage of the containers on this host
//!
//! Follows the stats stream of every running container through the Docker
//! Engine API and serves snapshots, health and metrics over HTTP.

use anyhow::{Context, Result};
use monitor_lib::{
    health::{components, HealthRegistry},
    observability::{MonitorMetrics, StructuredLogger},
    DockerClient, SupervisorBuilder,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const MONITOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting container-monitor");

    let config = config::MonitorConfig::load().context("Failed to load configuration")?;
    info!(node_name = %config.node_name, docker_host = %config.docker_host, "Monitor configured");

    // An unusable daemon address cannot recover by retrying
    let client = DockerClient::from_host(&config.docker_host)
        .with_context(|| format!("Invalid docker host {}", config.docker_host))?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::CONTROL_PLANE).await;
    health_registry.register(components::EVENT_WATCHER).await;

    let metrics = MonitorMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(MONITOR_VERSION, &config.docker_host);

    let supervisor = SupervisorBuilder::new()
        .control_plane(Arc::new(client))
        .health(health_registry.clone())
        .metrics(metrics)
        .logger(logger.clone())
        .config(config.supervisor_config())
        .build()?;

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        supervisor.registry(),
    ));

    let shutdown = CancellationToken::new();

    let supervisor_handle = tokio::spawn({
        let token = shutdown.clone();
        async move { supervisor.run(token).await }
    });
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        served = &mut api_handle => {
            shutdown.cancel();
            let _ = supervisor_handle.await;
            return match served {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.context("API server failed")),
                Err(e) => Err(anyhow::Error::new(e).context("API server task failed")),
            };
        }
    }

    shutdown.cancel();
    if let Err(e) = supervisor_handle.await {
        error!(error = %e, "Supervisor task failed");
    }
    match api_handle.await {
        Ok(result) => result.context("API server failed")?,
        Err(e) => error!(error = %e, "API server task failed"),
    }

    info!("Shutting down");
    Ok(())
}
