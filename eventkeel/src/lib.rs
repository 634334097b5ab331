//! Eventkeel persists aggregate state as an ordered, versioned log of
//! events and delivers those events to external consumers at least once.
//!
//! The building blocks are layered leaf-first:
//!
//! - [`event`] and [`aggregate`]: domain events and the aggregate root that records and replays them.
//! - [`store`]: the append-only event log with optimistic concurrency.
//! - [`repository`]: the transactional unit that saves a snapshot, appends events and stages outbox messages together.
//! - [`retry`], [`circuit_breaker`] and [`lock`]: resilience primitives.
//! - [`outbox`] and [`bus`]: reliable publication of staged events.
//! - [`saga`]: sequential multi-step operations with reverse-order compensation.
//! - [`runtime`]: the explicit context object wiring everything together.

pub mod aggregate;
pub mod bus;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod event;
pub mod lock;
pub mod outbox;
pub mod repository;
pub mod retry;
pub mod runtime;
pub mod saga;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};

/// Position of an event within its aggregate stream. The first event is version 1.
pub type Version = u64;
