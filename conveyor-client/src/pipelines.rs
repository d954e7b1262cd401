//! Pipeline-related API endpoints

use crate::error::Result;
use crate::{OrchestratorClient, handle_empty_response, handle_response};
use conveyor_core::domain::pipeline::{PipelineDefinition, PipelineRun};
use conveyor_core::dto::pipeline::{PipelineCreated, PipelineSummary};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Pipeline Management
    // =============================================================================

    /// Submit a pipeline definition
    ///
    /// A definition that fails validation comes back as a 422 `ApiError`
    /// whose message holds every violation.
    pub async fn submit_pipeline(&self, def: &PipelineDefinition) -> Result<PipelineCreated> {
        let url = format!("{}/pipelines", self.base_url);
        let response = self.client.post(&url).json(def).send().await?;

        handle_response(response).await
    }

    /// List summaries of all pipeline runs held by the orchestrator
    pub async fn list_pipelines(&self) -> Result<Vec<PipelineSummary>> {
        let url = format!("{}/pipelines", self.base_url);
        let response = self.client.get(&url).send().await?;

        handle_response(response).await
    }

    /// Get a full snapshot of a pipeline run
    pub async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<PipelineRun> {
        let url = format!("{}/pipelines/{}", self.base_url, pipeline_id);
        let response = self.client.get(&url).send().await?;

        handle_response(response).await
    }

    /// Cancel a pipeline run
    pub async fn cancel_pipeline(&self, pipeline_id: Uuid) -> Result<()> {
        let url = format!("{}/pipelines/{}/cancel", self.base_url, pipeline_id);
        let response = self.client.post(&url).send().await?;

        handle_empty_response(response).await
    }

    /// Past runs of the pipeline named `name`, newest first
    pub async fn pipeline_history(&self, name: &str) -> Result<Vec<PipelineSummary>> {
        let url = format!("{}/pipelines/history/{}", self.base_url, name);
        let response = self.client.get(&url).send().await?;

        handle_response(response).await
    }
}
