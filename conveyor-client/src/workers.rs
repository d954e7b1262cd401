//! Worker-related API endpoints on the orchestrator

use crate::error::Result;
use crate::{OrchestratorClient, handle_empty_response, handle_response};
use conveyor_core::domain::worker::Worker;
use conveyor_core::dto::worker::Heartbeat;

impl OrchestratorClient {
    // =============================================================================
    // Worker Lifecycle
    // =============================================================================

    /// Send a heartbeat to the orchestrator
    ///
    /// The first heartbeat registers the worker; later ones refresh its
    /// capacity, address and load.
    pub async fn send_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let url = format!("{}/workers/heartbeat", self.base_url);
        let response = self.client.post(&url).json(heartbeat).send().await?;

        handle_empty_response(response).await
    }

    // =============================================================================
    // Worker Query
    // =============================================================================

    /// List all known workers
    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        let url = format!("{}/workers", self.base_url);
        let response = self.client.get(&url).send().await?;

        handle_response(response).await
    }
}
