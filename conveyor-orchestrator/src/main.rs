use std::sync::Arc;

use anyhow::{Context, Result};
use conveyor_orchestrator::api::{self, AppState};
use conveyor_orchestrator::config::Config;
use conveyor_orchestrator::db;
use conveyor_orchestrator::dispatcher::HttpWorkerRpc;
use conveyor_orchestrator::repository::run_repository;
use conveyor_orchestrator::scheduler::Scheduler;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Conveyor Orchestrator...");

    let config = Config::from_env();
    config.validate()?;

    let rpc = Arc::new(HttpWorkerRpc::new(config.dispatch_timeout));
    let mut scheduler = Scheduler::new(&config, rpc);

    // Run history is optional; the in-memory store stays authoritative
    let pool = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");

            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;

            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;

            scheduler = scheduler.with_history(run_repository::spawn_writer(pool.clone()));
            Some(pool)
        }
        None => {
            tracing::info!("DATABASE_URL not set, run history kept in memory only");
            None
        }
    };

    let scheduler = Arc::new(scheduler);
    tokio::spawn(scheduler.clone().run());
    tokio::spawn(scheduler.clone().run_liveness());

    // Build router with all API endpoints
    let app = api::create_router(AppState { scheduler, pool });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
