//! Client for the worker node API

use std::time::Duration;

use conveyor_core::dto::job::{DispatchAck, JobSpec};
use reqwest::Client;
use uuid::Uuid;

use crate::error::Result;
use crate::{handle_empty_response, handle_response};

/// HTTP client for a single worker node
#[derive(Debug, Clone)]
pub struct WorkerClient {
    base_url: String,
    client: Client,
}

impl WorkerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Share one connection pool across many workers
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Hand a job attempt to the worker
    ///
    /// A worker at capacity answers 409 (see [`crate::ClientError::is_conflict`]).
    pub async fn dispatch(&self, spec: &JobSpec, timeout: Duration) -> Result<DispatchAck> {
        let url = format!("{}/jobs", self.base_url);
        tracing::debug!("Dispatching job {} (attempt {}) to {}", spec.job_id, spec.attempt, url);
        let response = self
            .client
            .post(&url)
            .json(spec)
            .timeout(timeout)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Ask the worker to stop a job; unknown jobs are acknowledged
    pub async fn cancel(&self, job_id: Uuid, timeout: Duration) -> Result<()> {
        let url = format!("{}/jobs/{}/cancel", self.base_url, job_id);
        let response = self.client.post(&url).timeout(timeout).send().await?;

        handle_empty_response(response).await
    }
}
