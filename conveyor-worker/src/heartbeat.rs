//! Heartbeat loop
//!
//! The first heartbeat registers the worker with the orchestrator; later ones
//! keep it HEALTHY and refresh its address, capacity, load and held attempts.
//! Beats are sent one at a time, so each one reflects every dispatch the
//! orchestrator saw acknowledged before the previous beat.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conveyor_client::OrchestratorClient;
use conveyor_core::dto::worker::Heartbeat;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::coordinator::JobCoordinator;

/// Current liveness signal for this worker
pub fn heartbeat(config: &Config, coordinator: &JobCoordinator) -> Heartbeat {
    Heartbeat {
        worker_id: coordinator.worker_id().to_string(),
        address: config.address.clone(),
        capacity: coordinator.capacity(),
        current_load: coordinator.load(),
        held: coordinator.held(),
    }
}

/// Registers with the orchestrator, retrying with exponential backoff
///
/// The orchestrator may not be ready yet when the worker starts (common in
/// container environments).
pub async fn register_with_retry(
    client: &OrchestratorClient,
    config: &Config,
    coordinator: &JobCoordinator,
) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client.send_heartbeat(&heartbeat(config, coordinator)).await {
            Ok(()) => {
                if attempt > 1 {
                    info!(
                        "Successfully registered with orchestrator after {} attempt(s)",
                        attempt
                    );
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!(
                        "Failed to register with orchestrator after {} attempts",
                        MAX_RETRIES
                    );
                    return Err(anyhow::anyhow!(
                        "Failed to register with orchestrator: {}",
                        e
                    ));
                }

                warn!(
                    "Failed to register with orchestrator (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}

/// Sends a heartbeat every `config.heartbeat_interval`, forever
pub async fn run(client: OrchestratorClient, config: Config, coordinator: Arc<JobCoordinator>) {
    info!(
        "Starting heartbeat loop (interval: {:?})",
        config.heartbeat_interval
    );

    let mut ticker = time::interval(config.heartbeat_interval);

    loop {
        ticker.tick().await;

        let beat = heartbeat(&config, &coordinator);
        debug!(
            "Sending heartbeat (load {}/{})",
            beat.current_load, beat.capacity
        );

        if let Err(e) = client.send_heartbeat(&beat).await {
            warn!("Failed to send heartbeat: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::{coordinator, spec};

    #[tokio::test]
    async fn test_heartbeat_reports_load() {
        let (coordinator, _runtime, _rx) = coordinator(3);
        let mut config = Config::default();
        config.address = "http://10.0.0.5:9090".to_string();

        let beat = heartbeat(&config, &coordinator);
        assert_eq!(beat.worker_id, "w1");
        assert_eq!(beat.address, "http://10.0.0.5:9090");
        assert_eq!(beat.capacity, 3);
        assert_eq!(beat.current_load, 0);
        assert!(beat.held.is_empty());

        let mut job = spec("hang");
        job.timeout_seconds = Some(60);
        coordinator.accept(job.clone()).unwrap();
        let beat = heartbeat(&config, &coordinator);
        assert_eq!(beat.current_load, 1);
        assert_eq!(beat.held[0].job_id, job.job_id);
        assert_eq!(beat.held[0].attempt, 1);
    }
}
