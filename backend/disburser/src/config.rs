//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{DisburserError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Safe Transaction Service base URL (e.g. https://safe-transaction-sepolia.safe.global)
    pub safe_tx_service_url: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) to poll the transaction service per disbursement
    pub poll_interval_secs: u64,
    /// First back-off delay after a failed poll
    pub initial_backoff_secs: u64,
    /// Upper bound on the back-off delay
    pub max_backoff_secs: u64,
    /// Consecutive failed polls before the active step is marked `ERROR`
    pub max_poll_failures: u32,
    /// Timeout applied to every transaction service request
    pub http_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Config {
            safe_tx_service_url: env_var("SAFE_TX_SERVICE_URL").map_err(|_| {
                DisburserError::Config(
                    "SAFE_TX_SERVICE_URL environment variable is required".to_string(),
                )
            })?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./disbursements.db?mode=rwc".to_string()),
            api_port: parse_or("API_PORT", 3002)?,
            poll_interval_secs: parse_or("POLL_INTERVAL_SECS", 5)?,
            initial_backoff_secs: parse_or("INITIAL_BACKOFF_SECS", 2)?,
            max_backoff_secs: parse_or("MAX_BACKOFF_SECS", 60)?,
            max_poll_failures: parse_or("MAX_POLL_FAILURES", 5)?,
            http_timeout_secs: parse_or("HTTP_TIMEOUT_SECS", 30)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(DisburserError::Config(
                "POLL_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        if self.max_poll_failures == 0 {
            return Err(DisburserError::Config(
                "MAX_POLL_FAILURES must be positive".to_string(),
            ));
        }
        if self.initial_backoff_secs > self.max_backoff_secs {
            return Err(DisburserError::Config(
                "INITIAL_BACKOFF_SECS must not exceed MAX_BACKOFF_SECS".to_string(),
            ));
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            initial_backoff: Duration::from_secs(self.initial_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            max_poll_failures: self.max_poll_failures,
        }
    }
}

/// Runtime knobs of the orchestrator's poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_poll_failures: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            poll_interval: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            max_poll_failures: 5,
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| DisburserError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| DisburserError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            safe_tx_service_url: "http://localhost:8000".into(),
            database_url: "sqlite::memory:".into(),
            api_port: 3002,
            poll_interval_secs: 5,
            initial_backoff_secs: 2,
            max_backoff_secs: 60,
            max_poll_failures: 5,
            http_timeout_secs: 30,
        }
    }

    #[test]
    fn orchestrator_config_uses_durations() {
        let cfg = base().orchestrator();
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.max_backoff, Duration::from_secs(60));
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn validation_rejects_nonsense() {
        assert!(base().validate().is_ok());

        let mut cfg = base();
        cfg.poll_interval_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.max_poll_failures = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.initial_backoff_secs = 120;
        assert!(matches!(cfg.validate(), Err(DisburserError::Config(_))));
    }
}
