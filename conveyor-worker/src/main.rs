use std::sync::Arc;

use anyhow::{Context, Result};
use conveyor_client::OrchestratorClient;
use conveyor_worker::api;
use conveyor_worker::config::Config;
use conveyor_worker::coordinator::JobCoordinator;
use conveyor_worker::heartbeat;
use conveyor_worker::podman::{self, PodmanRuntime};
use conveyor_worker::report::OrchestratorReporter;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_worker=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Conveyor Worker");

    let config = load_config()?;
    info!(
        "Loaded configuration: worker_id={}, address={}, orchestrator_url={}, capacity={}",
        config.worker_id, config.address, config.orchestrator_url, config.capacity
    );

    podman::check_podman_available()?;

    let http = reqwest::Client::builder()
        .timeout(config.heartbeat_interval)
        .build()
        .context("Failed to build HTTP client")?;
    let client = OrchestratorClient::with_client(config.orchestrator_url.clone(), http);

    let reporter = OrchestratorReporter::new(
        client.clone(),
        config.report_max_retries,
        config.report_retry_delay,
    );
    let coordinator = Arc::new(JobCoordinator::new(
        config.worker_id.clone(),
        config.capacity,
        config.job_timeout,
        Arc::new(PodmanRuntime::new()),
        Arc::new(reporter),
    ));

    info!("Registering with orchestrator");
    heartbeat::register_with_retry(&client, &config, &coordinator).await?;
    info!("Registered successfully");

    tokio::spawn(heartbeat::run(client, config.clone(), coordinator.clone()));

    let app = api::create_router(coordinator);

    info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("{}, using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
