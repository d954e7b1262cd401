//! Conveyor HTTP Client
//!
//! Type-safe HTTP clients for the two Conveyor services.
//!
//! - [`OrchestratorClient`] talks to the control plane. Workers use it for
//!   heartbeats and terminal reports, submitters for pipelines and history.
//! - [`WorkerClient`] talks to a worker node. The control plane uses it to
//!   dispatch and cancel jobs.
//!
//! # Example
//!
//! ```no_run
//! use conveyor_client::OrchestratorClient;
//! use conveyor_core::domain::pipeline::{JobDefinition, PipelineDefinition, StageDefinition};
//!
//! #[tokio::main]
//! async fn main() -> conveyor_client::Result<()> {
//!     let client = OrchestratorClient::new("http://localhost:8080");
//!
//!     let created = client
//!         .submit_pipeline(&PipelineDefinition {
//!             name: "ci".to_string(),
//!             stages: vec![StageDefinition {
//!                 name: "build".to_string(),
//!                 allow_failure: false,
//!                 jobs: vec![JobDefinition::new("compile", "rust:1", vec!["cargo build".to_string()])],
//!             }],
//!         })
//!         .await?;
//!
//!     println!("Submitted pipeline: {}", created.id);
//!     Ok(())
//! }
//! ```

pub mod error;
mod jobs;
mod pipelines;
mod worker;
mod workers;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use worker::WorkerClient;

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the Conveyor orchestrator API
///
/// Endpoints are grouped by concern:
/// - Pipeline submission, inspection, cancellation and history
/// - Job terminal reports
/// - Worker heartbeats and listing
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Example
    /// ```
    /// use conveyor_client::OrchestratorClient;
    ///
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new orchestrator client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

// =============================================================================
// Response Handlers
// =============================================================================

/// Check the status code and deserialize the JSON body
pub(crate) async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();

    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ClientError::api_error(status.as_u16(), error_text));
    }

    response
        .json()
        .await
        .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
}

/// Check the status code of a response whose body is ignored
pub(crate) async fn handle_empty_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();

    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ClientError::api_error(status.as_u16(), error_text));
    }

    Ok(())
}
