use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventkeel::outbox::{OutboxMessage, OutboxStatus, OutboxStore};
use eventkeel::{Error, Result};
use sqlx::types::{JsonValue, Uuid};
use sqlx::{query, query_as, query_scalar, PgConnection, Pool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::DbError;

const OUTBOX_COLUMNS: &str = "seq, id, topic, payload, status, retry_count, last_attempt, claimed_at, created_at, error";

/// An [`OutboxStore`] in the `outbox` table.
///
/// Messages are ordered by the `seq` column, which follows insertion order.
/// Claims lock rows with `FOR UPDATE SKIP LOCKED`, so several processors can
/// poll the same table without ever claiming a message twice.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pub(crate) inner: Pool<Postgres>,
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    seq: i64,
    id: Uuid,
    topic: String,
    payload: JsonValue,
    status: String,
    retry_count: i32,
    last_attempt: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    error: Option<String>,
}

impl OutboxRow {
    fn into_message(self) -> std::result::Result<OutboxMessage, DbError> {
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| DbError::InvalidRetryCount(self.retry_count))?;
        let status = self.status.parse::<OutboxStatus>()?;
        Ok(OutboxMessage {
            id: self.id,
            topic: self.topic,
            payload: serde_json::from_value(self.payload)?,
            status,
            retry_count,
            last_attempt: self.last_attempt,
            claimed_at: self.claimed_at,
            created_at: self.created_at,
            error: self.error,
        })
    }
}

fn into_messages(mut rows: Vec<OutboxRow>) -> Result<Vec<OutboxMessage>> {
    rows.sort_by_key(|row| row.seq);
    rows.into_iter()
        .map(|row| row.into_message().map_err(Error::from))
        .collect()
}

/// Inserts `messages` as PENDING through `conn`, usually inside the
/// transaction that appends their events.
pub(crate) async fn insert_messages(
    conn: &mut PgConnection,
    messages: Vec<OutboxMessage>,
) -> std::result::Result<(), DbError> {
    if messages.is_empty() {
        return Ok(());
    }

    let rows = messages
        .into_iter()
        .map(|message| {
            let payload = serde_json::to_value(&message.payload)?;
            Ok((message, payload))
        })
        .collect::<std::result::Result<Vec<_>, DbError>>()?;

    let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO outbox(id, topic, aggregate_id, payload, status, retry_count, created_at) ",
    );

    query_builder.push_values(rows, |mut b, (message, payload)| {
        b.push_bind(message.id)
            .push_bind(message.topic)
            .push_bind(message.payload.aggregate_id)
            .push_bind(payload)
            .push_bind(OutboxStatus::Pending.as_str())
            .push_bind(0_i32)
            .push_bind(message.created_at);
    });

    query_builder.build().execute(&mut *conn).await?;
    Ok(())
}

impl PostgresOutboxStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { inner: pool }
    }

    /// Applies `assignments` to a PROCESSING message.
    ///
    /// When no row matches, a second read tells a missing message apart
    /// from one in the wrong state.
    async fn transition(&self, id: Uuid, assignments: &str, error: Option<&str>) -> Result<()> {
        let updated = query(&format!(
            "UPDATE outbox SET {assignments} WHERE id = $1 AND status = 'PROCESSING'"
        ))
        .bind(id)
        .bind(error)
        .execute(&self.inner)
        .await
        .map_err(DbError::from)?
        .rows_affected();

        if updated > 0 {
            return Ok(());
        }

        let status: Option<String> = query_scalar("SELECT status FROM outbox WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.inner)
            .await
            .map_err(DbError::from)?;

        match status {
            None => Err(Error::NotFound(id.to_string())),
            Some(actual) => Err(Error::InvalidState {
                expected: OutboxStatus::Processing.to_string(),
                actual,
            }),
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn insert(&self, messages: Vec<OutboxMessage>) -> Result<()> {
        let mut conn = self.inner.acquire().await.map_err(DbError::from)?;
        Ok(insert_messages(&mut *conn, messages).await?)
    }

    async fn claim_pending(&self, batch_size: usize) -> Result<Vec<OutboxMessage>> {
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let rows = query_as::<_, OutboxRow>(&format!(
            "UPDATE outbox SET status = 'PROCESSING', claimed_at = now()
             WHERE id IN (
                 SELECT id FROM outbox WHERE status = 'PENDING'
                 ORDER BY seq LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {OUTBOX_COLUMNS}"
        ))
        .bind(limit)
        .fetch_all(&self.inner)
        .await
        .map_err(DbError::from)?;

        if !rows.is_empty() {
            debug!(count = rows.len(), "Claimed outbox messages");
        }
        into_messages(rows)
    }

    async fn mark_completed(&self, id: Uuid) -> Result<()> {
        self.transition(id, "status = 'COMPLETED', error = $2", None)
            .await
    }

    async fn mark_for_retry(&self, id: Uuid, error: &str) -> Result<()> {
        self.transition(
            id,
            "status = 'PENDING', retry_count = retry_count + 1, last_attempt = now(), claimed_at = NULL, error = $2",
            Some(error),
        )
        .await
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        self.transition(
            id,
            "status = 'PENDING', claimed_at = NULL, error = COALESCE($2, error)",
            None,
        )
        .await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        self.transition(
            id,
            "status = 'FAILED', last_attempt = now(), error = $2",
            Some(error),
        )
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        let row = query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.inner)
        .await
        .map_err(DbError::from)?;

        row.map(|row| row.into_message().map_err(Error::from))
            .transpose()
    }

    async fn list(&self, status: OutboxStatus, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = $1 ORDER BY seq LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.inner)
        .await
        .map_err(DbError::from)?;

        into_messages(rows)
    }

    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let reclaimed = query(
            "UPDATE outbox SET status = 'PENDING', claimed_at = NULL
             WHERE status = 'PROCESSING' AND claimed_at < $1",
        )
        .bind(claimed_before)
        .execute(&self.inner)
        .await
        .map_err(DbError::from)?
        .rows_affected();

        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed stale outbox messages");
        }
        Ok(reclaimed)
    }
}
