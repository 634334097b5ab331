//! Cross-process mutual exclusion over a key-value backend.
//!
//! A [`LockBackend`] only has to offer two atomic primitives: set a key if
//! it is absent (or expired) with a time-to-live, and delete a key only if
//! it still holds the caller's owner token. Owner tokens are minted per
//! acquisition and carried by a [`LockGuard`]. Acquisition is always bounded.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Sets `key` to `owner` unless an unexpired entry exists, whoever owns it.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` if it is still held by `owner`.
    async fn release(&self, key: &str, owner: &str) -> Result<bool>;

    /// Pushes the expiry of `key` to `ttl` from now if it is still held by `owner`.
    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            retry_count: 3,
            retry_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Extra attempts after the first one.
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl LockOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            retry_count: 0,
            retry_delay: Duration::ZERO,
        }
    }

    pub fn with_retries(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            ttl: Duration::from_millis(config.ttl_ms),
            retry_count: config.retry_count,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// Proof of one successful [`DistributedLock::acquire`].
///
/// Each acquisition gets its own owner token, so a guard can only release or
/// extend the acquisition it came from, even when the client is shared.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a lock that is never released stays held until its ttl lapses"]
pub struct LockGuard {
    resource_id: String,
    token: String,
}

impl LockGuard {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// A lock client. Cheap to clone and safe to share between tasks.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Attempts to take the lock up to `retry_count + 1` times, sleeping
    /// `retry_delay` in between.
    ///
    /// A resource held by a live acquisition is never handed out again, no
    /// matter which client or task asks.
    pub async fn acquire(&self, resource_id: &str, options: &LockOptions) -> Result<LockGuard> {
        if resource_id.is_empty() {
            return Err(Error::validation("lock resource id must not be empty"));
        }
        if options.ttl.is_zero() {
            return Err(Error::validation("lock ttl must be greater than zero"));
        }

        let token = Uuid::new_v4().to_string();
        let attempts = options.retry_count.saturating_add(1);
        for attempt in 1..=attempts {
            if self
                .backend
                .try_acquire(resource_id, &token, options.ttl)
                .await?
            {
                debug!(resource_id, owner = %token, attempt, "Lock acquired");
                return Ok(LockGuard {
                    resource_id: resource_id.to_string(),
                    token,
                });
            }

            if attempt < attempts {
                tokio::time::sleep(options.retry_delay).await;
            }
        }

        warn!(resource_id, attempts, "Lock is held elsewhere");
        Err(Error::LockAcquisition {
            resource_id: resource_id.to_string(),
            attempts,
        })
    }

    /// Returns `false` when the lock had already expired or changed hands.
    pub async fn release(&self, guard: LockGuard) -> Result<bool> {
        let released = self
            .backend
            .release(&guard.resource_id, &guard.token)
            .await?;
        if !released {
            warn!(
                resource_id = %guard.resource_id,
                owner = %guard.token,
                "Released a lock that was no longer held"
            );
        }
        Ok(released)
    }

    pub async fn extend(&self, guard: &LockGuard, ttl: Duration) -> Result<bool> {
        if ttl.is_zero() {
            return Err(Error::validation("lock ttl must be greater than zero"));
        }
        self.backend
            .extend(&guard.resource_id, &guard.token, ttl)
            .await
    }

    /// Runs `operation` while holding the lock on `resource_id`.
    ///
    /// The lock is released whether the operation succeeds, fails or panics,
    /// including a panic raised before its future is first polled. A panic is
    /// resumed once the lock is gone.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource_id: &str,
        options: &LockOptions,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(resource_id, options).await?;

        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;

        if let Err(e) = self.release(guard).await {
            warn!(resource_id, error = %e, "Failed to release lock");
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

#[derive(Debug)]
struct LockEntry {
    owner: String,
    expires_at: Instant,
}

/// Locks held in process memory. Only useful within a single process.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            LockEntry {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.owner == owner => {
                let live = entry.expires_at > Instant::now();
                entries.remove(key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.owner == owner && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
