//! The context object shared by every component.
//!
//! A [`Runtime`] is built once at process start from [`Settings`] and the
//! storage, transport and lock collaborators. Components receive it (or the
//! parts they need) explicitly; nothing is looked up globally.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{InMemoryTransport, MessageBus, Transport};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{ConfigError, Settings};
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, InMemoryLockBackend, LockBackend, LockOptions};
use crate::outbox::{OutboxProcessor, OutboxStore};
use crate::repository::InMemoryRepository;
use crate::retry::RetryStrategy;
use crate::store::EventStore;

/// Name of the breaker guarding the message bus.
pub const BUS_CIRCUIT: &str = "message-bus";

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Validation(e.to_string())
    }
}

/// The external collaborators a runtime is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub event_store: Arc<dyn EventStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub transport: Arc<dyn Transport>,
    pub lock_backend: Arc<dyn LockBackend>,
}

impl Collaborators {
    /// In-process collaborators sharing the stores of `repository`.
    pub fn in_memory(repository: &InMemoryRepository) -> Self {
        Self {
            event_store: repository.event_store().clone(),
            outbox: repository.outbox().clone(),
            transport: Arc::new(InMemoryTransport::new()),
            lock_backend: Arc::new(InMemoryLockBackend::new()),
        }
    }
}

pub struct Runtime {
    settings: Settings,
    collaborators: Collaborators,
    bus: MessageBus,
    lock: DistributedLock,
    processor: OutboxProcessor,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Result<Self> {
        settings.validate()?;

        let breaker = Arc::new(CircuitBreaker::with_config(
            BUS_CIRCUIT,
            settings.circuit_breaker.clone(),
        ));
        let bus = MessageBus::new(
            collaborators.transport.clone(),
            RetryStrategy::new(settings.retry.clone()),
            breaker,
        );
        let processor = OutboxProcessor::new(
            collaborators.outbox.clone(),
            Arc::new(bus.clone()),
            settings.outbox.clone(),
        );
        let lock = DistributedLock::new(collaborators.lock_backend.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            settings,
            collaborators,
            bus,
            lock,
            processor,
            shutdown,
            worker: Mutex::new(None),
        })
    }

    /// A runtime backed entirely by in-process collaborators.
    pub fn in_memory(settings: Settings, repository: &InMemoryRepository) -> Result<Self> {
        Self::new(settings, Collaborators::in_memory(repository))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.collaborators.event_store
    }

    pub fn outbox(&self) -> &Arc<dyn OutboxStore> {
        &self.collaborators.outbox
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions::from(&self.settings.lock)
    }

    pub fn processor(&self) -> &OutboxProcessor {
        &self.processor
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::new(self.settings.retry.clone())
    }

    /// A new breaker configured from the settings, for guarding other dependencies.
    pub fn circuit_breaker(&self, name: impl Into<String>) -> CircuitBreaker {
        CircuitBreaker::with_config(name, self.settings.circuit_breaker.clone())
    }

    /// Starts the outbox processor loop. Calling it again while the loop
    /// runs has no effect.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        self.shutdown.send_replace(false);
        *worker = Some(self.processor.spawn(self.shutdown.subscribe()));
        info!("Runtime started");
    }

    /// Stops the outbox processor and waits for the batch in flight.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Outbox processor ended abnormally");
            }
        }
        info!("Runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
