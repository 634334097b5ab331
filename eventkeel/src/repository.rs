use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::{
    aggregate::{Aggregate, Context},
    error::Error,
    event::{DomainEvent, RawEvent},
    outbox::{InMemoryOutboxStore, OutboxMessage, OutboxStore},
    store::{InMemoryEventStore, PendingAppend},
    Version,
};

/// List of possible errors that can be returned by the [`RepositoryTransaction`] trait.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError<DE> {
    /// This error is returned by [`RepositoryTransaction::get`] when the
    /// desired Aggregate could not be found in the data store.
    #[error("Aggregate {0} was not found")]
    AggregateNotFound(String),

    /// A stored event of a known type could not be deserialized.
    ///
    /// This usually implies the Event contains corrupted or invalid data.
    #[error("Failed to decode event {event_id}: {source}")]
    Decode {
        event_id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    /// The stored history or the aggregate being saved is inconsistent.
    #[error("Invalid aggregate history: {0}")]
    Invalid(Error),

    /// This error is returned when the underlying store fails.
    #[error("Event store failed: {0}")]
    Repository(#[from] DE),
}

impl<DE> From<RepositoryError<DE>> for Error
where
    DE: Into<Error>,
{
    fn from(e: RepositoryError<DE>) -> Self {
        match e {
            RepositoryError::AggregateNotFound(id) => Error::NotFound(id),
            RepositoryError::Decode { event_id, source } => {
                Error::validation(format!("event {event_id} could not be decoded: {source}"))
            }
            RepositoryError::Invalid(e) => e,
            RepositoryError::Repository(e) => e.into(),
        }
    }
}

/// A snapshot of the [`Aggregate`] that is persisted next to its events.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Snapshot<T>
where
    T: Aggregate,
{
    pub aggregate_id: String,
    pub aggregate: T,
    pub version: Version,
    pub snapshot_version: u64,
}

impl<T> Snapshot<T>
where
    T: Aggregate,
{
    pub fn id(&self) -> &str {
        &self.aggregate_id
    }
}

/// A RepositoryTransaction is an object that allows to load and save
/// an [`Aggregate`] from and to a persistent data store.
///
/// Everything written through one transaction becomes visible atomically
/// on [`RepositoryTransaction::commit`]: the appended events, the snapshot
/// and one outbox message per event.
#[async_trait]
pub trait RepositoryTransaction<T>: Send + Sync + Sized
where
    T: Aggregate,
{
    /// The error type returned by the underlying store.
    type DbError: Send + Sync + Debug;

    /// Returns the events of a stream with a version greater than `from_version`.
    async fn load_events(
        &mut self,
        id: &str,
        from_version: Version,
    ) -> Result<Vec<RawEvent>, Self::DbError>;

    /// Appends new Domain Events to the specified Event Stream, failing if
    /// the stream is no longer at `expected_version`.
    async fn append(
        &mut self,
        id: &str,
        expected_version: Version,
        events: Vec<RawEvent>,
    ) -> Result<(), Self::DbError>;

    async fn get_snapshot(&mut self, id: &str) -> Result<Option<Snapshot<T>>, Self::DbError>
    where
        T: DeserializeOwned;

    async fn store_snapshot(&mut self, snapshot: Snapshot<T>) -> Result<(), Self::DbError>
    where
        T: Serialize;

    /// Stages outbox messages in the same transaction as the events.
    async fn insert_outbox_messages(
        &mut self,
        messages: Vec<OutboxMessage>,
    ) -> Result<(), Self::DbError>;

    /// Loads an aggregate from the data store, starting from its snapshot
    /// when the snapshot was written by the current apply function.
    async fn get(&mut self, id: &str) -> Result<Context<T>, RepositoryError<Self::DbError>>
    where
        T: DeserializeOwned,
    {
        let snapshot = self
            .get_snapshot(id)
            .await?
            .filter(|snapshot| snapshot.snapshot_version == T::SNAPSHOT_VERSION);

        let (context, from_version) = match snapshot {
            Some(snapshot) => {
                let version = snapshot.version;
                (Context::from(snapshot), version)
            }
            None => (Context::new(id), 0),
        };

        let events = self.load_events(id, from_version).await?;

        if from_version == 0 && events.is_empty() {
            return Err(RepositoryError::AggregateNotFound(id.to_string()));
        }

        events
            .iter()
            .try_fold(context, |ctx, event| ctx.apply_raw_event(event))
    }

    /// Writes the uncommitted events of `root`, its snapshot and one outbox
    /// message per event. The events stay on `root` until the caller commits.
    async fn store(&mut self, root: &Context<T>) -> Result<(), RepositoryError<Self::DbError>>
    where
        T: Serialize,
    {
        let events = root.uncommitted_events();

        if events.is_empty() {
            return Ok(());
        }

        let raw_events = events
            .iter()
            .map(DomainEvent::encode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RepositoryError::Invalid(e.into()))?;

        self.append(root.aggregate_id(), root.committed_version(), raw_events.clone())
            .await?;

        let snapshot = Snapshot {
            aggregate_id: root.aggregate_id().to_string(),
            aggregate: root.state().clone(),
            version: root.version(),
            snapshot_version: root.snapshot_version(),
        };
        self.store_snapshot(snapshot).await?;

        let messages = raw_events
            .into_iter()
            .map(|event| OutboxMessage::new(T::AGGREGATE_TYPE, event))
            .collect();
        self.insert_outbox_messages(messages).await?;

        Ok(())
    }

    async fn commit(self) -> Result<(), Self::DbError>;
}

/// An in-process repository over an [`InMemoryEventStore`] and an
/// [`InMemoryOutboxStore`]. Writes are buffered per transaction and
/// applied together on commit.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    events: Arc<InMemoryEventStore>,
    outbox: Arc<InMemoryOutboxStore>,
    snapshots: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl InMemoryRepository {
    pub fn new(events: Arc<InMemoryEventStore>, outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            events,
            outbox,
            snapshots: Arc::default(),
        }
    }

    pub fn event_store(&self) -> &Arc<InMemoryEventStore> {
        &self.events
    }

    pub fn outbox(&self) -> &Arc<InMemoryOutboxStore> {
        &self.outbox
    }

    pub fn begin_transaction(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            repository: self.clone(),
            appends: Vec::new(),
            snapshots: Vec::new(),
            outbox: Vec::new(),
        }
    }

    /// Removes a stored snapshot, forcing the next load to replay events.
    pub async fn delete_snapshot(&self, id: &str) {
        self.snapshots.write().await.remove(id);
    }
}

pub struct InMemoryTransaction {
    repository: InMemoryRepository,
    appends: Vec<PendingAppend>,
    snapshots: Vec<(String, serde_json::Value)>,
    outbox: Vec<OutboxMessage>,
}

#[async_trait]
impl<T> RepositoryTransaction<T> for InMemoryTransaction
where
    T: Aggregate,
{
    type DbError = Error;

    async fn load_events(
        &mut self,
        id: &str,
        from_version: Version,
    ) -> Result<Vec<RawEvent>, Self::DbError> {
        self.repository
            .events
            .events_after(id, from_version)
            .await
            .map(Option::unwrap_or_default)
    }

    async fn append(
        &mut self,
        id: &str,
        expected_version: Version,
        events: Vec<RawEvent>,
    ) -> Result<(), Self::DbError> {
        self.appends.push(PendingAppend {
            aggregate_id: id.to_string(),
            expected_version: Some(expected_version),
            events,
        });
        Ok(())
    }

    async fn get_snapshot(&mut self, id: &str) -> Result<Option<Snapshot<T>>, Self::DbError>
    where
        T: DeserializeOwned,
    {
        let snapshots = self.repository.snapshots.read().await;
        snapshots
            .get(id)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(Error::from)
    }

    async fn store_snapshot(&mut self, snapshot: Snapshot<T>) -> Result<(), Self::DbError>
    where
        T: Serialize,
    {
        let id = snapshot.aggregate_id.clone();
        self.snapshots.push((id, serde_json::to_value(snapshot)?));
        Ok(())
    }

    async fn insert_outbox_messages(
        &mut self,
        messages: Vec<OutboxMessage>,
    ) -> Result<(), Self::DbError> {
        self.outbox.extend(messages);
        Ok(())
    }

    async fn commit(self) -> Result<(), Self::DbError> {
        let appended = self.appends.len();
        self.repository.events.append_all(self.appends).await?;

        let mut snapshots = self.repository.snapshots.write().await;
        snapshots.extend(self.snapshots);
        drop(snapshots);

        self.repository.outbox.insert(self.outbox).await?;
        debug!(streams = appended, "In-memory transaction committed");
        Ok(())
    }
}
