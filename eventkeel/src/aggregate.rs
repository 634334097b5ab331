//! Module containing support for the Aggregate pattern.
//!
//! ## What is an Aggregate?
//!
//! An [Aggregate] is the unit of consistency of your domain: an agent,
//! a team or a project. Its state is never written directly. Commands
//! produce **Domain Events**, the events are recorded on the aggregate
//! [Context], and the state is the left fold of every event ever recorded.
//!
//! Aggregates reference other aggregates by identifier only. An agent
//! that belongs to a team stores the team id, never the team itself,
//! which keeps many-to-many relations free of ownership cycles.

use std::fmt::Debug;

use crate::event::EventPayload;

mod root;

pub use root::*;

/// An Aggregate represents a Domain Model that, through an aggregate
/// [Context], acts as a _transactional boundary_.
///
/// Since this is an Event-sourced version of the Aggregate pattern,
/// any change to the Aggregate state must be represented through
/// a Domain Event, which is then applied to the current state
/// using the [`Aggregate::apply`] method.
pub trait Aggregate: Sized + Send + Sync + Clone + Default + Debug + 'static {
    /// The name of the aggregate type. Used as the outbox topic for its events.
    const AGGREGATE_TYPE: &'static str;

    /// The current version of the snapshot to store.
    /// This number should be increased when a breaking change is made to the apply function.
    const SNAPSHOT_VERSION: u64;

    /// The type of Domain Events that interest this Aggregate.
    /// Usually, this type should be an `enum`.
    type DomainEvent: EventPayload;

    /// Mutates the state of an Aggregate through a Domain Event.
    ///
    /// Must be a pure, total state transition: the same sequence of events
    /// always folds into the same state, whether applied live or replayed.
    fn apply(&mut self, event: &Self::DomainEvent);
}
