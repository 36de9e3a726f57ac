//! Process configuration.

use std::time::Duration;

use crate::polling::{PollingConfig, RetryMode};

/// Process-wide settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Connection pool size
    pub max_connections: u32,

    /// Poller tick interval
    pub tick_interval: Duration,

    /// Failures allowed before a row is dead-lettered
    pub max_retries: i32,

    /// What happens to failed rows while retries remain
    pub retry_mode: RetryMode,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let max_connections: u32 = std::env::var("TURNSTILE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let tick_interval_ms: u64 = std::env::var("TURNSTILE_TICK_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        let max_retries: i32 = std::env::var("TURNSTILE_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let retry_mode = std::env::var("TURNSTILE_RETRY_MODE")
            .ok()
            .and_then(|s| RetryMode::parse(s.trim()))
            .unwrap_or_default();

        Ok(Config {
            database_url,
            max_connections,
            tick_interval: Duration::from_millis(tick_interval_ms),
            max_retries,
            retry_mode,
        })
    }

    /// The poller's slice of this configuration.
    pub fn polling(&self) -> PollingConfig {
        PollingConfig {
            tick_interval: self.tick_interval,
            max_retries: self.max_retries,
            retry_mode: self.retry_mode,
        }
    }
}
