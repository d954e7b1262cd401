//! Job-related API endpoints

use crate::error::Result;
use crate::{OrchestratorClient, handle_response};
use conveyor_core::dto::job::{ReportAck, TerminalReport};

impl OrchestratorClient {
    /// Report the terminal outcome of a job attempt
    ///
    /// Repeat-safe: the orchestrator acknowledges a duplicate with
    /// `applied: false`.
    pub async fn report_job(&self, report: &TerminalReport) -> Result<ReportAck> {
        let url = format!("{}/jobs/{}/report", self.base_url, report.job_id);
        let response = self.client.post(&url).json(report).send().await?;

        handle_response(response).await
    }
}
