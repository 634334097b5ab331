use std::time::Duration;

use async_trait::async_trait;
use eventkeel::lock::LockBackend;
use eventkeel::Result;
use sqlx::{query, query_scalar, Pool, Postgres};

use crate::DbError;

/// A [`LockBackend`] on the `distributed_locks` table.
///
/// Expiry is evaluated with the database clock, so every process sharing
/// the table agrees on when a lock lapses. A live row is never overwritten,
/// not even by its own owner.
#[derive(Clone)]
pub struct PostgresLockBackend {
    pub(crate) inner: Pool<Postgres>,
}

impl PostgresLockBackend {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { inner: pool }
    }
}

#[async_trait]
impl LockBackend for PostgresLockBackend {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let acquired: Option<String> = query_scalar(
            "INSERT INTO distributed_locks(key, owner, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE
             SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
             WHERE distributed_locks.expires_at <= now()
             RETURNING key",
        )
        .bind(key)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.inner)
        .await
        .map_err(DbError::from)?;

        Ok(acquired.is_some())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let live: Option<bool> = query_scalar(
            "DELETE FROM distributed_locks WHERE key = $1 AND owner = $2
             RETURNING expires_at > now()",
        )
        .bind(key)
        .bind(owner)
        .fetch_optional(&self.inner)
        .await
        .map_err(DbError::from)?;

        Ok(live.unwrap_or(false))
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let extended = query(
            "UPDATE distributed_locks SET expires_at = now() + make_interval(secs => $3)
             WHERE key = $1 AND owner = $2 AND expires_at > now()",
        )
        .bind(key)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.inner)
        .await
        .map_err(DbError::from)?
        .rows_affected();

        Ok(extended > 0)
    }
}
