//! The append-only, per-aggregate event log.
//!
//! The store is the single serialization point for writes to one aggregate.
//! Appends carry the version the writer last saw; if the stream has moved
//! on, the append fails as a whole with [`Error::ConcurrencyConflict`] and
//! nothing is written. The store never retries a conflict itself.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{EventStream, RawEvent};
use crate::Version;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` in order to the stream of `aggregate_id` and returns
    /// the new stream version.
    ///
    /// Events are re-stamped with consecutive versions following the stored
    /// stream. When `expected_version` is given and differs from the stored
    /// version the stream is left untouched.
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<RawEvent>,
        expected_version: Option<Version>,
    ) -> Result<Version>;

    /// Returns the events with `version >= from_version`, in version order.
    /// Fails with [`Error::NotFound`] if the stream does not exist.
    async fn get_events(&self, aggregate_id: &str, from_version: Version) -> Result<Vec<RawEvent>>;

    /// Returns the events with `version <= to_version`, in version order.
    /// Used for point-in-time reconstruction.
    async fn get_events_up_to_version(
        &self,
        aggregate_id: &str,
        to_version: Version,
    ) -> Result<Vec<RawEvent>>;

    async fn exists(&self, aggregate_id: &str) -> Result<bool>;

    /// The stored version of a stream, or `None` if it does not exist.
    async fn version(&self, aggregate_id: &str) -> Result<Option<Version>>;

    async fn get_stream(&self, aggregate_id: &str) -> Result<EventStream> {
        let events = self.get_events(aggregate_id, 0).await?;
        let version = events.last().map_or(0, |event| event.version);
        Ok(EventStream {
            aggregate_id: aggregate_id.to_string(),
            events,
            version,
        })
    }
}

/// Checks an append against the stored version and stamps each event with
/// its position in the stream.
///
/// Shared by every [`EventStore`] implementation so that they agree on
/// validation and numbering.
pub fn stamp_versions(
    aggregate_id: &str,
    current_version: Version,
    expected_version: Option<Version>,
    events: Vec<RawEvent>,
) -> Result<Vec<RawEvent>> {
    if aggregate_id.is_empty() {
        return Err(Error::validation("aggregate id must not be empty"));
    }

    if let Some(expected) = expected_version {
        if expected != current_version {
            warn!(
                aggregate_id,
                expected,
                actual = current_version,
                "Rejected append with stale version"
            );
            return Err(Error::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected,
                actual: Some(current_version),
            });
        }
    }

    events
        .into_iter()
        .zip(current_version + 1..)
        .map(|(mut event, version)| {
            if event.event_type.is_empty() {
                return Err(Error::validation(format!(
                    "event {} has no event type",
                    event.id
                )));
            }
            if event.aggregate_id != aggregate_id {
                return Err(Error::validation(format!(
                    "event {} belongs to aggregate {}, not {aggregate_id}",
                    event.id, event.aggregate_id
                )));
            }
            event.version = version;
            Ok(event)
        })
        .collect()
}

/// An append staged by a transaction, applied together with others.
#[derive(Debug, Clone)]
pub struct PendingAppend {
    pub aggregate_id: String,
    pub expected_version: Option<Version>,
    pub events: Vec<RawEvent>,
}

/// An [`EventStore`] kept in process memory.
///
/// The version check and the append happen under one write guard, which
/// makes every append an atomic compare-and-swap on the stream.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<String, Vec<RawEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies several appends atomically: either all of them are written
    /// or none is.
    pub async fn append_all(&self, appends: Vec<PendingAppend>) -> Result<()> {
        let mut streams = self.streams.write().await;

        let mut projected: HashMap<String, Version> = HashMap::new();
        let mut staged = Vec::with_capacity(appends.len());

        for append in appends {
            let current = projected
                .get(&append.aggregate_id)
                .copied()
                .unwrap_or_else(|| {
                    streams
                        .get(&append.aggregate_id)
                        .map_or(0, |stream| stream.len() as Version)
                });

            let stamped = stamp_versions(
                &append.aggregate_id,
                current,
                append.expected_version,
                append.events,
            )?;

            projected.insert(
                append.aggregate_id.clone(),
                current + stamped.len() as Version,
            );
            staged.push((append.aggregate_id, stamped));
        }

        for (aggregate_id, events) in staged {
            if events.is_empty() {
                continue;
            }
            debug!(
                aggregate_id = %aggregate_id,
                count = events.len(),
                "Appending events"
            );
            streams.entry(aggregate_id).or_default().extend(events);
        }

        Ok(())
    }

    /// Events strictly after `version`, or `None` if the stream does not exist.
    pub async fn events_after(
        &self,
        aggregate_id: &str,
        version: Version,
    ) -> Result<Option<Vec<RawEvent>>> {
        let streams = self.streams.read().await;
        Ok(streams.get(aggregate_id).map(|stream| {
            stream
                .iter()
                .filter(|event| event.version > version)
                .cloned()
                .collect()
        }))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<RawEvent>,
        expected_version: Option<Version>,
    ) -> Result<Version> {
        let mut streams = self.streams.write().await;
        let current = streams
            .get(aggregate_id)
            .map_or(0, |stream| stream.len() as Version);

        let stamped = stamp_versions(aggregate_id, current, expected_version, events)?;
        if stamped.is_empty() {
            return Ok(current);
        }

        let version = current + stamped.len() as Version;
        debug!(
            aggregate_id,
            count = stamped.len(),
            version,
            "Appending events"
        );
        streams
            .entry(aggregate_id.to_string())
            .or_default()
            .extend(stamped);

        Ok(version)
    }

    async fn get_events(&self, aggregate_id: &str, from_version: Version) -> Result<Vec<RawEvent>> {
        let streams = self.streams.read().await;
        let stream = streams
            .get(aggregate_id)
            .ok_or_else(|| Error::NotFound(aggregate_id.to_string()))?;

        Ok(stream
            .iter()
            .filter(|event| event.version >= from_version)
            .cloned()
            .collect())
    }

    async fn get_events_up_to_version(
        &self,
        aggregate_id: &str,
        to_version: Version,
    ) -> Result<Vec<RawEvent>> {
        let streams = self.streams.read().await;
        let stream = streams
            .get(aggregate_id)
            .ok_or_else(|| Error::NotFound(aggregate_id.to_string()))?;

        Ok(stream
            .iter()
            .take_while(|event| event.version <= to_version)
            .cloned()
            .collect())
    }

    async fn exists(&self, aggregate_id: &str) -> Result<bool> {
        Ok(self.streams.read().await.contains_key(aggregate_id))
    }

    async fn version(&self, aggregate_id: &str) -> Result<Option<Version>> {
        Ok(self
            .streams
            .read()
            .await
            .get(aggregate_id)
            .map(|stream| stream.len() as Version))
    }
}
