//! Layered configuration.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. The file given to [`Settings::load`], or the one named by `EVENTKEEL_CONFIG`
//! 3. Environment variables prefixed with `EVENTKEEL`, nested with `__`
//!    (`EVENTKEEL__OUTBOX__BATCH_SIZE=50`)

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::lock::LockConfig;
use crate::outbox::OutboxConfig;
use crate::retry::RetryConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "EVENTKEEL_CONFIG";

/// Prefix of configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTKEEL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection string of the backing store. In-memory stores are used when unset.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub outbox: OutboxConfig,
    pub lock: LockConfig,
    pub database: DatabaseConfig,
}

impl Settings {
    /// Loads and validates the settings.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config, Environment, File};

        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        } else if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |message: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(message.to_string())) };

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            return invalid("retry.backoff_factor must be at least 1.0");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.circuit_breaker.half_open_max_attempts == 0 {
            return invalid("circuit_breaker.half_open_max_attempts must be at least 1");
        }
        if self.outbox.batch_size == 0 {
            return invalid("outbox.batch_size must be at least 1");
        }
        if self.outbox.poll_interval_ms == 0 {
            return invalid("outbox.poll_interval_ms must be greater than zero");
        }
        if self.lock.ttl_ms == 0 {
            return invalid("lock.ttl_ms must be greater than zero");
        }
        if self.database.max_connections == 0 {
            return invalid("database.max_connections must be at least 1");
        }
        Ok(())
    }
}
