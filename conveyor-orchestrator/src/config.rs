//! Orchestrator configuration
//!
//! Bind address, optional database connection, and the timing knobs of the
//! liveness sweep and the dispatcher.

use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server listens on
    pub bind_addr: String,

    /// Postgres connection string; run history is disabled when unset
    pub database_url: Option<String>,

    /// Interval at which workers are expected to send heartbeats
    pub heartbeat_interval: Duration,

    /// Missed heartbeat intervals before a worker becomes SUSPECT
    pub suspect_after_missed: u32,

    /// Missed heartbeat intervals before a worker is declared DEAD
    pub dead_after_missed: u32,

    /// Upper bound on a single dispatch RPC
    pub dispatch_timeout: Duration,

    /// Period of the safety sweep that re-runs scheduling without a wake signal
    pub sweep_interval: Duration,

    /// Optional ceiling on infrastructure retries per job; unbounded when unset
    pub max_infra_retries: Option<u32>,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(bind_addr: String) -> Self {
        Self {
            bind_addr,
            database_url: None,
            heartbeat_interval: Duration::from_secs(10),
            suspect_after_missed: 2,
            dead_after_missed: 5,
            dispatch_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(15),
            max_infra_retries: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - ORCHESTRATOR_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - DATABASE_URL (optional)
    /// - HEARTBEAT_INTERVAL (optional, seconds, default: 10)
    /// - SUSPECT_AFTER_MISSED (optional, default: 2)
    /// - DEAD_AFTER_MISSED (optional, default: 5)
    /// - DISPATCH_TIMEOUT (optional, seconds, default: 10)
    /// - SWEEP_INTERVAL (optional, seconds, default: 15)
    /// - MAX_INFRA_RETRIES (optional, default: unbounded)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = std::env::var("ORCHESTRATOR_BIND_ADDR").unwrap_or(defaults.bind_addr);

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty());

        let heartbeat_interval = std::env::var("HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval);

        let suspect_after_missed = std::env::var("SUSPECT_AFTER_MISSED")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.suspect_after_missed);

        let dead_after_missed = std::env::var("DEAD_AFTER_MISSED")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.dead_after_missed);

        let dispatch_timeout = std::env::var("DISPATCH_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.dispatch_timeout);

        let sweep_interval = std::env::var("SWEEP_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);

        let max_infra_retries = std::env::var("MAX_INFRA_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .or(defaults.max_infra_retries);

        Self {
            bind_addr,
            database_url,
            heartbeat_interval,
            suspect_after_missed,
            dead_after_missed,
            dispatch_timeout,
            sweep_interval,
            max_infra_retries,
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        if self.suspect_after_missed == 0 {
            anyhow::bail!("suspect_after_missed must be greater than 0");
        }

        if self.dead_after_missed <= self.suspect_after_missed {
            anyhow::bail!("dead_after_missed must be greater than suspect_after_missed");
        }

        if self.dispatch_timeout.is_zero() {
            anyhow::bail!("dispatch_timeout must be greater than 0");
        }

        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep_interval must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("0.0.0.0:8080".to_string())
    }
}
