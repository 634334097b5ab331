use std::sync::Arc;

use async_trait::async_trait;
use eventkeel::bus::Transport;
use eventkeel::event::RawEvent;
use eventkeel::runtime::Collaborators;
use eventkeel::store::EventStore;
use eventkeel::{Error, Version};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    query_as, query_scalar, Pool, Postgres,
};

use crate::transaction::{append_stream, stream_version, EventRow, SELECT_EVENTS};
use crate::{
    to_db_version, DbError, PostgresLockBackend, PostgresOutboxStore, PostgresTransaction,
};

/// Events, snapshots, the outbox and locks in one postgres database.
#[derive(Clone)]
pub struct PostgresRepository {
    pub(crate) inner: Pool<Postgres>,
}

impl PostgresRepository {
    pub async fn new(
        connect_options: PgConnectOptions,
        pool_options: PgPoolOptions,
    ) -> Result<Self, sqlx::Error> {
        let pool = pool_options.connect_with(connect_options).await?;

        Ok(Self { inner: pool })
    }

    /// Connects to `url` with a pool of at most `max_connections`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let connect_options: PgConnectOptions = url.parse()?;
        let pool_options = PgPoolOptions::new().max_connections(max_connections);
        Self::new(connect_options, pool_options).await
    }

    /// Start a new transaction using the default isolation level
    pub async fn begin_transaction(&self) -> Result<PostgresTransaction<'_>, sqlx::Error> {
        Ok(PostgresTransaction {
            inner: self.inner.begin().await?,
        })
    }

    /// Run migrations on the database
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.inner).await?;

        Ok(())
    }

    pub fn outbox_store(&self) -> PostgresOutboxStore {
        PostgresOutboxStore::new(self.inner.clone())
    }

    pub fn lock_backend(&self) -> PostgresLockBackend {
        PostgresLockBackend::new(self.inner.clone())
    }

    /// Collaborators for a runtime storing everything in this database.
    pub fn collaborators(&self, transport: Arc<dyn Transport>) -> Collaborators {
        Collaborators {
            event_store: Arc::new(self.clone()),
            outbox: Arc::new(self.outbox_store()),
            transport,
            lock_backend: Arc::new(self.lock_backend()),
        }
    }

    async fn select_events(
        &self,
        filter: &str,
        aggregate_id: &str,
        version: Version,
    ) -> eventkeel::Result<Vec<RawEvent>> {
        let rows = query_as::<_, EventRow>(&format!(
            "{SELECT_EVENTS} WHERE aggregate_id = $1 AND {filter} ORDER BY version"
        ))
        .bind(aggregate_id)
        .bind(to_db_version(version)?)
        .fetch_all(&self.inner)
        .await
        .map_err(DbError::from)?;

        if rows.is_empty() && !self.exists(aggregate_id).await? {
            return Err(Error::NotFound(aggregate_id.to_string()));
        }

        rows.into_iter()
            .map(|row| row.into_event().map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl EventStore for PostgresRepository {
    /// Runs in its own transaction, so a failed append leaves no rows behind.
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<RawEvent>,
        expected_version: Option<Version>,
    ) -> eventkeel::Result<Version> {
        let mut transaction = self.inner.begin().await.map_err(DbError::from)?;
        let version =
            append_stream(&mut *transaction, aggregate_id, expected_version, events).await?;
        transaction.commit().await.map_err(DbError::from)?;
        Ok(version)
    }

    async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: Version,
    ) -> eventkeel::Result<Vec<RawEvent>> {
        self.select_events("version >= $2", aggregate_id, from_version)
            .await
    }

    async fn get_events_up_to_version(
        &self,
        aggregate_id: &str,
        to_version: Version,
    ) -> eventkeel::Result<Vec<RawEvent>> {
        self.select_events("version <= $2", aggregate_id, to_version)
            .await
    }

    async fn exists(&self, aggregate_id: &str) -> eventkeel::Result<bool> {
        let exists: bool =
            query_scalar("SELECT EXISTS(SELECT 1 FROM events WHERE aggregate_id = $1)")
                .bind(aggregate_id)
                .fetch_one(&self.inner)
                .await
                .map_err(DbError::from)?;

        Ok(exists)
    }

    async fn version(&self, aggregate_id: &str) -> eventkeel::Result<Option<Version>> {
        let mut conn = self.inner.acquire().await.map_err(DbError::from)?;
        let version = stream_version(&mut *conn, aggregate_id).await?;
        Ok((version > 0).then_some(version))
    }
}
