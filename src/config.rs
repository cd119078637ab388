//! Configuration management for the vote ledger
//!
//! Loads tunables from environment variables (and `.env`) with validation.

use crate::{Result, config_error};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Vote transaction tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts before a contended transaction reports `TRANSIENT_CONTENTION`
    pub max_retries: u32,

    /// First backoff delay in milliseconds (doubles per attempt)
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds
    pub retry_max_delay_ms: u64,

    /// Client-side bound on one vote transaction (default: 10 seconds)
    pub request_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            retry_base_delay_ms: 5,
            retry_max_delay_ms: 250,
            request_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    /// Configuration for testing: generous retries, short delays
    pub fn for_testing() -> Self {
        Self {
            max_retries: 64,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 20,
            request_timeout_ms: 5_000,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff before retry number `attempt` (0-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(config_error!("max_retries must be at least 1"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(config_error!(
                "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_base_delay_ms,
                self.retry_max_delay_ms
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(config_error!("request_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Change notification tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Buffered updates per poll topic before slow subscribers lag
    pub channel_capacity: usize,

    /// How often the outbox relay flushes in the background
    pub outbox_flush_interval_ms: u64,

    /// Maximum updates drained from the outbox per batch
    pub outbox_batch_size: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            outbox_flush_interval_ms: 500,
            outbox_batch_size: 512,
        }
    }
}

impl RealtimeConfig {
    pub fn for_testing() -> Self {
        Self {
            channel_capacity: 1024,
            outbox_flush_interval_ms: 20,
            outbox_batch_size: 64,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.outbox_flush_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(config_error!("channel_capacity must be positive"));
        }
        if self.outbox_batch_size == 0 {
            return Err(config_error!("outbox_batch_size must be positive"));
        }
        if self.outbox_flush_interval_ms == 0 {
            return Err(config_error!("outbox_flush_interval_ms must be positive"));
        }
        Ok(())
    }
}

/// Where the identity resolver keeps its local state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// JSON file for the anonymous token and vote cache; in-memory when unset
    pub storage_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub realtime: RealtimeConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            max_retries: env_or("LIVEPOLL_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay_ms: env_or(
                "LIVEPOLL_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            retry_max_delay_ms: env_or("LIVEPOLL_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            request_timeout_ms: env_or("LIVEPOLL_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?,
        };

        let defaults = RealtimeConfig::default();
        let realtime = RealtimeConfig {
            channel_capacity: env_or("LIVEPOLL_CHANNEL_CAPACITY", defaults.channel_capacity)?,
            outbox_flush_interval_ms: env_or(
                "LIVEPOLL_OUTBOX_FLUSH_INTERVAL_MS",
                defaults.outbox_flush_interval_ms,
            )?,
            outbox_batch_size: env_or("LIVEPOLL_OUTBOX_BATCH_SIZE", defaults.outbox_batch_size)?,
        };

        let identity = IdentityConfig {
            storage_path: std::env::var("LIVEPOLL_IDENTITY_PATH")
                .ok()
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        };

        let logging = LoggingConfig {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
        };

        let config = Self {
            engine,
            realtime,
            identity,
            logging,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create configuration for testing
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig::for_testing(),
            realtime: RealtimeConfig::for_testing(),
            identity: IdentityConfig::default(),
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.realtime.validate()?;
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(config_error!(
                "LOG_FORMAT must be \"pretty\" or \"json\", got \"{}\"",
                self.logging.format
            ));
        }
        Ok(())
    }
}

/// Parse an optional environment variable, falling back to `default`
fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| config_error!("Invalid {}: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}
