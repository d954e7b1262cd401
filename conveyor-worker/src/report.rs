//! Terminal report delivery
//!
//! Reports are repeat-safe on the orchestrator side, so delivery simply
//! retries with exponential backoff until acknowledged or out of attempts.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_client::OrchestratorClient;
use conveyor_core::dto::job::TerminalReport;
use tracing::{debug, error, info, warn};

const MAX_DELAY: Duration = Duration::from_secs(30);

/// Sink for the single terminal report of each job attempt
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Returns whether the orchestrator acknowledged the report
    async fn deliver(&self, report: &TerminalReport) -> bool;
}

/// [`Reporter`] posting to the orchestrator's report endpoint
pub struct OrchestratorReporter {
    client: OrchestratorClient,
    max_retries: u32,
    initial_delay: Duration,
}

impl OrchestratorReporter {
    pub fn new(client: OrchestratorClient, max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            client,
            max_retries,
            initial_delay,
        }
    }
}

#[async_trait]
impl Reporter for OrchestratorReporter {
    async fn deliver(&self, report: &TerminalReport) -> bool {
        let mut attempt = 0;
        let mut delay = self.initial_delay;

        loop {
            attempt += 1;

            match self.client.report_job(report).await {
                Ok(ack) => {
                    if ack.applied {
                        info!(
                            "Reported job {} (attempt {}) as {}",
                            report.job_id, report.attempt, report.status
                        );
                    } else {
                        debug!(
                            "Report for job {} (attempt {}) was a stale duplicate",
                            report.job_id, report.attempt
                        );
                    }
                    return true;
                }
                // The orchestrator understood and refused; resending cannot help
                Err(e) if e.is_client_error() => {
                    warn!("Report for job {} rejected: {}", report.job_id, e);
                    return false;
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        error!(
                            "Failed to report job {} after {} attempts: {}",
                            report.job_id, attempt, e
                        );
                        return false;
                    }

                    warn!(
                        "Failed to report job {} (attempt {}/{}): {}",
                        report.job_id, attempt, self.max_retries, e
                    );

                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_DELAY);
                }
            }
        }
    }
}
