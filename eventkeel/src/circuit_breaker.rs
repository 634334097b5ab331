//! Circuit Breaker for Resilience
//!
//! # States:
//!
//! - **Closed**: Normal operation, calls pass through and consecutive failures are counted
//! - **Open**: Calls fail immediately with [`Error::CircuitOpen`] without reaching the dependency
//! - **HalfOpen**: After the reset timeout, a limited number of trial calls are let through
//!
//! State is held in memory per breaker instance. Several replicas of a
//! service each trip independently.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit.
    pub failure_threshold: u32,
    /// Time since the last failure before an open circuit lets a trial call through.
    pub reset_timeout_ms: u64,
    /// Trial calls allowed while half-open.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_max_attempts: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub half_open_attempts: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitSnapshot>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitSnapshot {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                half_open_attempts: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        self.lock().clone()
    }

    /// Runs `operation` through the breaker.
    ///
    /// While the circuit is open the operation is never invoked and the
    /// call fails with [`Error::CircuitOpen`].
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure(&err);
                Err(err)
            }
        }
    }

    /// Forces the circuit closed and clears all counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_attempts = 0;
        inner.last_failure_time = None;
        info!(circuit = %self.name, "Circuit reset");
    }

    fn before_call(&self) -> Result<()> {
        let mut inner = self.lock();
        let now = Instant::now();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure_time
                .map_or(Duration::MAX, |at| now.duration_since(at));

            if elapsed < self.config.reset_timeout() {
                return Err(self.rejection(self.config.reset_timeout() - elapsed));
            }

            inner.state = CircuitState::HalfOpen;
            inner.half_open_attempts = 0;
            info!(circuit = %self.name, "Circuit transitioned to HALF_OPEN");
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_attempts >= self.config.half_open_max_attempts {
                inner.state = CircuitState::Open;
                inner.last_failure_time = Some(now);
                warn!(
                    circuit = %self.name,
                    attempts = inner.half_open_attempts,
                    "Half-open trial budget exhausted, circuit reopened"
                );
                return Err(self.rejection(self.config.reset_timeout()));
            }
            inner.half_open_attempts += 1;
        }

        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(circuit = %self.name, "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_attempts = 0;
    }

    fn on_failure(&self, err: &Error) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                error!(circuit = %self.name, error = %err, "Trial call failed, circuit reopened");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                error!(
                    circuit = %self.name,
                    failure_count = inner.failure_count,
                    error = %err,
                    "Circuit opened"
                );
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    fn rejection(&self, retry_after: Duration) -> Error {
        Error::CircuitOpen {
            name: self.name.clone(),
            retry_after,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
