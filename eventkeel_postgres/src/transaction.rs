use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventkeel::aggregate::Aggregate;
use eventkeel::event::RawEvent;
use eventkeel::outbox::OutboxMessage;
use eventkeel::repository::{RepositoryTransaction, Snapshot};
use eventkeel::store::stamp_versions;
use eventkeel::{Error, Version};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::types::{JsonValue, Uuid};
use sqlx::{query, query_as, query_scalar, PgConnection, Postgres, QueryBuilder, Transaction};
use tracing::{debug, warn};

use crate::outbox::insert_messages;
use crate::{from_db_version, is_version_conflict, to_db_version, DbError};

pub struct PostgresTransaction<'a> {
    pub(crate) inner: Transaction<'a, Postgres>,
}

impl<'a> PostgresTransaction<'a> {
    /// Commit the transaction to the db.
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.inner.commit().await
    }

    /// Gives access to the underlying sqlx transaction.
    pub fn into_inner(self) -> Transaction<'a, Postgres> {
        self.inner
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    snapshot: JsonValue,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EventRow {
    event_id: Uuid,
    aggregate_id: String,
    version: i64,
    event_type: String,
    data: JsonValue,
    occurred_on: DateTime<Utc>,
}

impl EventRow {
    pub(crate) fn into_event(self) -> Result<RawEvent, DbError> {
        Ok(RawEvent {
            id: self.event_id,
            event_type: self.event_type,
            aggregate_id: self.aggregate_id,
            version: from_db_version(self.version)?,
            data: self.data,
            occurred_on: self.occurred_on,
        })
    }
}

pub(crate) const SELECT_EVENTS: &str =
    "SELECT event_id, aggregate_id, version, event_type, data, occurred_on FROM events";

/// The stored version of a stream, 0 if it has no events.
pub(crate) async fn stream_version(
    conn: &mut PgConnection,
    aggregate_id: &str,
) -> Result<Version, DbError> {
    let version: Option<i64> =
        query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .fetch_one(&mut *conn)
            .await?;

    from_db_version(version.unwrap_or(0))
}

/// Checks `expected_version`, stamps the events and inserts them.
///
/// The version check and the insert are not atomic on their own. The
/// `aggregate_version` constraint catches a concurrent writer that slips in
/// between, which is reported as a conflict with an unknown actual version.
pub(crate) async fn append_stream(
    conn: &mut PgConnection,
    aggregate_id: &str,
    expected_version: Option<Version>,
    events: Vec<RawEvent>,
) -> Result<Version, DbError> {
    let current = stream_version(conn, aggregate_id).await?;
    let stamped = stamp_versions(aggregate_id, current, expected_version, events)?;

    if stamped.is_empty() {
        return Ok(current);
    }

    let version = current + stamped.len() as Version;
    let rows = stamped
        .into_iter()
        .map(|event| {
            Ok(EventRow {
                event_id: event.id,
                aggregate_id: event.aggregate_id,
                version: to_db_version(event.version)?,
                event_type: event.event_type,
                data: event.data,
                occurred_on: event.occurred_on,
            })
        })
        .collect::<Result<Vec<_>, DbError>>()?;

    let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO events(event_id, aggregate_id, version, event_type, data, occurred_on) ",
    );

    query_builder.push_values(rows, |mut b, row| {
        b.push_bind(row.event_id)
            .push_bind(row.aggregate_id)
            .push_bind(row.version)
            .push_bind(row.event_type)
            .push_bind(row.data)
            .push_bind(row.occurred_on);
    });

    query_builder
        .build()
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_version_conflict(&e) {
                warn!(aggregate_id, "Concurrent append detected by constraint");
                DbError::Rejected(Error::ConcurrencyConflict {
                    aggregate_id: aggregate_id.to_string(),
                    expected: expected_version.unwrap_or(current),
                    actual: None,
                })
            } else {
                DbError::from(e)
            }
        })?;

    debug!(aggregate_id, version, "Appended events");
    Ok(version)
}

#[async_trait]
impl<'a, T> RepositoryTransaction<T> for PostgresTransaction<'a>
where
    T: Aggregate,
{
    /// The type of error that is returned from the database.
    type DbError = DbError;

    async fn load_events(
        &mut self,
        id: &str,
        from_version: Version,
    ) -> Result<Vec<RawEvent>, Self::DbError> {
        let rows = query_as::<_, EventRow>(&format!(
            "{SELECT_EVENTS} WHERE aggregate_id = $1 AND version > $2 ORDER BY version"
        ))
        .bind(id)
        .bind(to_db_version(from_version)?)
        .fetch_all(&mut *self.inner)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn append(
        &mut self,
        id: &str,
        expected_version: Version,
        events: Vec<RawEvent>,
    ) -> Result<(), Self::DbError> {
        append_stream(&mut *self.inner, id, Some(expected_version), events).await?;
        Ok(())
    }

    /// A snapshot that no longer deserializes is treated as missing, so the
    /// aggregate is rebuilt from its events.
    async fn get_snapshot(&mut self, id: &str) -> Result<Option<Snapshot<T>>, Self::DbError>
    where
        T: DeserializeOwned,
    {
        let row = query_as::<_, SnapshotRow>(
            "SELECT snapshot FROM snapshots WHERE aggregate_id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.inner)
        .await?;

        Ok(row.and_then(|row| match serde_json::from_value(row.snapshot) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(aggregate_id = id, error = %e, "Ignoring unreadable snapshot");
                None
            }
        }))
    }

    async fn store_snapshot(&mut self, snapshot: Snapshot<T>) -> Result<(), Self::DbError>
    where
        T: Serialize,
    {
        let aggregate_id = snapshot.aggregate_id.clone();
        let version = to_db_version(snapshot.version)?;
        let json_value = serde_json::to_value(snapshot)?;

        query(
            "INSERT INTO snapshots(aggregate_id, snapshot, version, created_at) VALUES ($1, $2, $3, $4)
             ON CONFLICT (aggregate_id) DO UPDATE
             SET snapshot = EXCLUDED.snapshot, version = EXCLUDED.version, created_at = EXCLUDED.created_at",
        )
        .bind(aggregate_id)
        .bind(json_value)
        .bind(version)
        .bind(Utc::now())
        .execute(&mut *self.inner)
        .await?;

        Ok(())
    }

    async fn insert_outbox_messages(
        &mut self,
        messages: Vec<OutboxMessage>,
    ) -> Result<(), Self::DbError> {
        insert_messages(&mut *self.inner, messages).await
    }

    /// Commit the transaction to the db.
    async fn commit(self) -> Result<(), Self::DbError> {
        Ok(self.commit().await?)
    }
}
