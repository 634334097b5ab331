//! Module `event` contains types and abstractions helpful for working
//! with Domain Events.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::Version;

/// The payload of a domain event.
///
/// Usually implemented by an `enum` with one variant per event kind, so that
/// applying an event is an exhaustive `match` checked by the compiler.
pub trait EventPayload:
    Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Every event type this payload can carry.
    /// Stored events with any other type are skipped during replay.
    const EVENT_TYPES: &'static [&'static str];

    /// The type tag of this particular event.
    fn event_type(&self) -> &'static str;
}

/// An event that will be / has been persisted to the Event Store.
///
/// Immutable once created: the envelope is only ever read or re-stamped
/// with a version by the store while appending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent<E> {
    /// The unique id of the event.
    pub id: Uuid,

    pub event_type: String,

    pub aggregate_id: String,

    /// The position of the event in its aggregate stream, starting at 1.
    pub version: Version,

    /// The actual domain payload.
    pub data: E,

    pub occurred_on: DateTime<Utc>,
}

/// The storage and transport representation of an event.
pub type RawEvent = DomainEvent<serde_json::Value>;

impl<E> DomainEvent<E>
where
    E: EventPayload,
{
    pub fn new(aggregate_id: impl Into<String>, version: Version, data: E) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: data.event_type().to_string(),
            aggregate_id: aggregate_id.into(),
            version,
            data,
            occurred_on: Utc::now(),
        }
    }

    /// Serializes the payload into its raw form.
    pub fn encode(&self) -> Result<RawEvent, serde_json::Error> {
        Ok(DomainEvent {
            id: self.id,
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            version: self.version,
            data: serde_json::to_value(&self.data)?,
            occurred_on: self.occurred_on,
        })
    }
}

impl RawEvent {
    /// Builds a raw event from any serializable payload.
    pub fn raw(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        version: Version,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            version,
            data,
            occurred_on: Utc::now(),
        }
    }

    /// Deserializes the payload into a typed event.
    pub fn decode<E>(&self) -> Result<DomainEvent<E>, serde_json::Error>
    where
        E: DeserializeOwned,
    {
        Ok(DomainEvent {
            id: self.id,
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            version: self.version,
            data: serde_json::from_value(self.data.clone())?,
            occurred_on: self.occurred_on,
        })
    }
}

/// The ordered events of one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStream {
    pub aggregate_id: String,
    pub events: Vec<RawEvent>,
    /// Number of events ever appended to the stream.
    pub version: Version,
}
