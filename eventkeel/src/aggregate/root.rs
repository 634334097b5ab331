use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::aggregate::Aggregate;
use crate::error::Error;
use crate::event::{DomainEvent, EventPayload, RawEvent};
use crate::repository::{RepositoryError, RepositoryTransaction, Snapshot};
use crate::Version;

/// A context object that should be used to access the [Aggregate] state
/// and to record new Domain Events.
#[derive(Debug, Clone)]
#[must_use]
pub struct Context<T>
where
    T: Aggregate,
{
    id: String,
    aggregate: T,
    version: Version,
    uncommitted_events: Vec<DomainEvent<T::DomainEvent>>,
}

impl<T> Context<T>
where
    T: Aggregate,
{
    /// Starts a brand new aggregate with no history.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            aggregate: T::default(),
            version: 0,
            uncommitted_events: Vec::new(),
        }
    }

    /// Returns the unique identifier for the Aggregate instance.
    pub fn aggregate_id(&self) -> &str {
        &self.id
    }

    /// Returns the current version for the [Aggregate], including uncommitted events.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the version the store holds for this aggregate, i.e. the
    /// expected version for appending the uncommitted events.
    pub fn committed_version(&self) -> Version {
        self.version - self.uncommitted_events.len() as Version
    }

    pub fn snapshot_version(&self) -> u64 {
        T::SNAPSHOT_VERSION
    }

    /// Returns read access to the [Aggregate] state.
    pub fn state(&self) -> &T {
        &self.aggregate
    }

    pub fn uncommitted_events(&self) -> &[DomainEvent<T::DomainEvent>] {
        &self.uncommitted_events
    }

    /// Returns the list of uncommitted, recorded Domain Events from the [Context]
    /// and resets the internal list to its default value.
    ///
    /// Only call this once the events are durably committed.
    pub fn take_uncommitted_events(&mut self) -> Vec<DomainEvent<T::DomainEvent>> {
        std::mem::take(&mut self.uncommitted_events)
    }

    /// Records a change to the [Aggregate], expressed by the specified
    /// Domain Event. No I/O happens until the context is saved.
    pub fn record_that(&mut self, event: T::DomainEvent) -> &DomainEvent<T::DomainEvent> {
        self.aggregate.apply(&event);
        self.version += 1;

        let event = DomainEvent::new(self.id.clone(), self.version, event);
        self.uncommitted_events.push(event);
        &self.uncommitted_events[self.uncommitted_events.len() - 1]
    }

    /// Loads an aggregate through `transaction`.
    ///
    /// # Errors
    ///
    /// See [`RepositoryTransaction::get`].
    pub async fn load<R>(
        transaction: &mut R,
        id: &str,
    ) -> Result<Self, RepositoryError<<R as RepositoryTransaction<T>>::DbError>>
    where
        T: DeserializeOwned,
        R: RepositoryTransaction<T>,
    {
        transaction.get(id).await
    }

    /// Rebuilds an aggregate by folding its ordered history onto the default state.
    ///
    /// # Errors
    ///
    /// Fails if the history belongs to another aggregate or has gaps.
    pub fn replay<'a, I>(id: impl Into<String>, events: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = &'a DomainEvent<T::DomainEvent>>,
        T::DomainEvent: 'a,
    {
        events
            .into_iter()
            .try_fold(Context::new(id), |ctx, event| ctx.apply_rehydrated_event(event))
    }

    /// Applies an already persisted event while rehydrating an [Aggregate].
    ///
    /// # Errors
    ///
    /// Fails if the event is not the next one in the stream.
    pub fn apply_rehydrated_event(
        mut self,
        event: &DomainEvent<T::DomainEvent>,
    ) -> Result<Self, Error> {
        if event.aggregate_id != self.id {
            return Err(Error::validation(format!(
                "event {} belongs to aggregate {}, not {}",
                event.id, event.aggregate_id, self.id
            )));
        }
        if event.version != self.version + 1 {
            return Err(Error::validation(format!(
                "event {} has version {}, expected {}",
                event.id,
                event.version,
                self.version + 1
            )));
        }

        self.aggregate.apply(&event.data);
        self.version = event.version;
        Ok(self)
    }

    /// Applies a raw event, skipping event types this aggregate does not know.
    pub(crate) fn apply_raw_event<DE>(self, event: &RawEvent) -> Result<Self, RepositoryError<DE>> {
        if !T::DomainEvent::EVENT_TYPES.contains(&event.event_type.as_str()) {
            debug!(
                aggregate_id = %self.id,
                event_type = %event.event_type,
                version = event.version,
                "Skipping unknown event type"
            );
            let mut ctx = self;
            ctx.version = event.version;
            return Ok(ctx);
        }

        let typed = event
            .decode::<T::DomainEvent>()
            .map_err(|source| RepositoryError::Decode {
                event_id: event.id,
                source,
            })?;

        self.apply_rehydrated_event(&typed)
            .map_err(RepositoryError::Invalid)
    }

    /// Stores the uncommitted events, snapshot and outbox messages through
    /// `transaction`, commits it, and only then clears the uncommitted events.
    ///
    /// # Errors
    ///
    /// Nothing is drained if storing or committing fails, so the caller
    /// may reload and retry.
    pub async fn save<R>(
        &mut self,
        mut transaction: R,
    ) -> Result<(), RepositoryError<<R as RepositoryTransaction<T>>::DbError>>
    where
        T: Serialize,
        R: RepositoryTransaction<T>,
    {
        if self.uncommitted_events.is_empty() {
            return Ok(());
        }

        transaction.store(self).await?;
        transaction
            .commit()
            .await
            .map_err(RepositoryError::Repository)?;

        let committed = self.take_uncommitted_events();
        debug!(
            aggregate_id = %self.id,
            events = committed.len(),
            version = self.version,
            "Aggregate saved"
        );

        Ok(())
    }
}

impl<T> From<Snapshot<T>> for Context<T>
where
    T: Aggregate,
{
    fn from(value: Snapshot<T>) -> Self {
        Self {
            id: value.aggregate_id,
            aggregate: value.aggregate,
            version: value.version,
            uncommitted_events: Vec::new(),
        }
    }
}
