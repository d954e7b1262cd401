//! Worker configuration
//!
//! Identity, addresses, capacity and the timing knobs for heartbeats,
//! job execution and report delivery.

use std::time::Duration;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this worker instance
    pub worker_id: String,

    /// Base URL the orchestrator uses to reach this worker
    pub address: String,

    /// Address the HTTP server listens on
    pub bind_addr: String,

    /// Orchestrator base URL (e.g., "http://localhost:8080")
    pub orchestrator_url: String,

    /// Max parallel jobs the worker accepts
    pub capacity: u32,

    /// How often to send a heartbeat to the orchestrator
    pub heartbeat_interval: Duration,

    /// Runtime limit for jobs that do not declare their own
    pub job_timeout: Duration,

    /// Delivery attempts for a terminal report before giving up
    pub report_max_retries: u32,

    /// Initial delay between report attempts, doubled after each failure
    pub report_retry_delay: Duration,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, orchestrator_url: String) -> Self {
        Self {
            worker_id,
            address: "http://127.0.0.1:9090".to_string(),
            bind_addr: "0.0.0.0:9090".to_string(),
            orchestrator_url,
            capacity: 2,
            heartbeat_interval: Duration::from_secs(10),
            job_timeout: Duration::from_secs(300), // 5 minutes
            report_max_retries: 5,
            report_retry_delay: Duration::from_millis(500),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - ORCHESTRATOR_URL (required)
    /// - WORKER_ID (optional, default: random uuid)
    /// - WORKER_ADDRESS (optional, default: http://127.0.0.1:9090)
    /// - WORKER_BIND_ADDR (optional, default: 0.0.0.0:9090)
    /// - WORKER_CAPACITY (optional, default: 2)
    /// - HEARTBEAT_INTERVAL (optional, seconds, default: 10)
    /// - JOB_TIMEOUT (optional, seconds, default: 300)
    /// - REPORT_MAX_RETRIES (optional, default: 5)
    /// - REPORT_RETRY_DELAY_MS (optional, default: 500)
    pub fn from_env() -> anyhow::Result<Self> {
        let orchestrator_url = std::env::var("ORCHESTRATOR_URL")
            .map_err(|_| anyhow::anyhow!("ORCHESTRATOR_URL environment variable not set"))?;

        let worker_id = std::env::var("WORKER_ID")
            .ok()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let defaults = Self::new(worker_id, orchestrator_url);

        let address = std::env::var("WORKER_ADDRESS").unwrap_or(defaults.address);

        let bind_addr = std::env::var("WORKER_BIND_ADDR").unwrap_or(defaults.bind_addr);

        let capacity = std::env::var("WORKER_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.capacity);

        let heartbeat_interval = std::env::var("HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval);

        let job_timeout = std::env::var("JOB_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.job_timeout);

        let report_max_retries = std::env::var("REPORT_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.report_max_retries);

        let report_retry_delay = std::env::var("REPORT_RETRY_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.report_retry_delay);

        Ok(Self {
            worker_id: defaults.worker_id,
            address,
            bind_addr,
            orchestrator_url: defaults.orchestrator_url,
            capacity,
            heartbeat_interval,
            job_timeout,
            report_max_retries,
            report_retry_delay,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        for (name, url) in [
            ("orchestrator_url", &self.orchestrator_url),
            ("address", &self.address),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must start with http:// or https://", name);
            }
        }

        if self.capacity == 0 {
            anyhow::bail!("capacity must be greater than 0");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        if self.job_timeout.is_zero() {
            anyhow::bail!("job_timeout must be greater than 0");
        }

        if self.report_max_retries == 0 {
            anyhow::bail!("report_max_retries must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "http://localhost:8080".to_string(),
        )
    }
}
