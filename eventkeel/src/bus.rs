//! Publish/subscribe boundary to external consumers.
//!
//! This module contains:
//! - `Transport` trait: the actual broker client
//! - `MessageHandler` trait: consumer side processing
//! - `MessageBus`: validation, retry and circuit breaking around a transport
//! - `InMemoryTransport`: an in-process broker for tests and single-node setups
//!
//! Delivery is at least once. Handlers must be idempotent and must not
//! assume any ordering across aggregates.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{panic_message, Error, Result};
use crate::event::RawEvent;
use crate::retry::RetryStrategy;

/// Header carrying the topic a dead-lettered message was first published to.
pub const ORIGINAL_TOPIC_HEADER: &str = "x-original-topic";
/// Header carrying the handler failure that dead-lettered a message.
pub const ERROR_HEADER: &str = "x-error";

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Defaults to the aggregate id, which keeps one aggregate on one partition.
    pub partition_key: Option<String>,
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Subscriptions sharing a group id split the messages of a topic
    /// between them; every group receives every message.
    pub group_id: String,
    /// Maximum number of messages handled at once. Default: 1.
    pub concurrency: usize,
    /// Topic that receives messages whose handler failed.
    pub dead_letter_queue: Option<String>,
}

impl SubscribeOptions {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            concurrency: 1,
            dead_letter_queue: None,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn dead_letter_queue(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(topic.into());
        self
    }
}

/// A message as it travels through a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub partition_key: String,
    pub headers: HashMap<String, String>,
    pub event: RawEvent,
}

// ============================================================================
// Traits
// ============================================================================

/// Handler for messages received from a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

/// A broker client.
///
/// Failures to reach the broker are reported as retryable
/// [`Error::Infrastructure`] unless they can never succeed.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<()>;

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<()>;
}

/// What the outbox processor needs to deliver a staged event.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, topic: &str, event: &RawEvent) -> Result<()>;
}

// ============================================================================
// Message bus
// ============================================================================

/// Validates messages and sends them through a [`Transport`], retrying
/// transient failures and failing fast while the circuit is open.
#[derive(Clone)]
pub struct MessageBus {
    transport: Arc<dyn Transport>,
    retry: RetryStrategy,
    breaker: Arc<CircuitBreaker>,
}

impl MessageBus {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryStrategy,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            transport,
            retry,
            breaker,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Publishes with the bus' own retry strategy.
    pub async fn publish(
        &self,
        topic: &str,
        event: &RawEvent,
        options: PublishOptions,
    ) -> Result<()> {
        self.publish_with_retry(topic, event, options, &self.retry)
            .await
    }

    pub async fn publish_with_retry(
        &self,
        topic: &str,
        event: &RawEvent,
        options: PublishOptions,
        retry: &RetryStrategy,
    ) -> Result<()> {
        validate(topic, event)?;

        let envelope = Envelope {
            topic: topic.to_string(),
            partition_key: options
                .partition_key
                .unwrap_or_else(|| event.aggregate_id.clone()),
            headers: options.headers,
            event: event.clone(),
        };

        retry
            .execute(|| {
                let envelope = envelope.clone();
                self.breaker.call(|| self.guarded_send(envelope))
            })
            .await?;

        debug!(
            topic,
            aggregate_id = %event.aggregate_id,
            version = event.version,
            "Event published"
        );
        Ok(())
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::validation("topic must not be empty"));
        }
        if options.group_id.is_empty() {
            return Err(Error::validation("subscription group id must not be empty"));
        }
        if options.concurrency == 0 {
            return Err(Error::validation("subscription concurrency must be at least 1"));
        }

        self.transport.subscribe(topic, handler, options).await
    }

    /// Sends through the transport, turning a panic into a failure the
    /// breaker can count.
    async fn guarded_send(&self, envelope: Envelope) -> Result<()> {
        AssertUnwindSafe(self.transport.send(envelope))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(Error::infrastructure(panic_message(payload.as_ref()))))
    }
}

#[async_trait]
impl EventPublisher for MessageBus {
    async fn publish_event(&self, topic: &str, event: &RawEvent) -> Result<()> {
        self.publish(topic, event, PublishOptions::default()).await
    }
}

fn validate(topic: &str, event: &RawEvent) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::validation("topic must not be empty"));
    }
    if event.event_type.is_empty() {
        return Err(Error::validation(format!("event {} has no event type", event.id)));
    }
    if event.aggregate_id.is_empty() {
        return Err(Error::validation(format!("event {} has no aggregate id", event.id)));
    }
    Ok(())
}

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Default)]
struct ConsumerGroup {
    members: Vec<mpsc::UnboundedSender<Envelope>>,
    next: usize,
}

/// Published envelopes an [`InMemoryTransport`] remembers by default.
pub const DEFAULT_PUBLISHED_HISTORY: usize = 1_000;

#[derive(Default)]
struct TransportState {
    topics: RwLock<HashMap<String, HashMap<String, ConsumerGroup>>>,
    published: RwLock<VecDeque<Envelope>>,
    history: usize,
    fail_on_publish: RwLock<Option<Error>>,
    injected_failures: Mutex<VecDeque<Error>>,
}

impl TransportState {
    /// Records the envelope and hands it to one member of every group.
    async fn dispatch(&self, envelope: Envelope) {
        {
            let mut published = self.published.write().await;
            if self.history > 0 {
                if published.len() >= self.history {
                    published.pop_front();
                }
                published.push_back(envelope.clone());
            }
        }

        let mut topics = self.topics.write().await;
        let Some(groups) = topics.get_mut(&envelope.topic) else {
            return;
        };

        for (group_id, group) in groups.iter_mut() {
            group.members.retain(|member| !member.is_closed());
            if group.members.is_empty() {
                continue;
            }
            let index = group.next % group.members.len();
            group.next = group.next.wrapping_add(1);
            if group.members[index].send(envelope.clone()).is_err() {
                warn!(topic = %envelope.topic, group_id, "Subscriber went away");
            }
        }
    }
}

/// An in-process broker.
///
/// Each subscription gets its own worker task fed by an unbounded channel.
/// The most recent published messages are kept for inspection, and failures
/// can be injected to exercise retry paths.
#[derive(Clone)]
pub struct InMemoryTransport {
    state: Arc<TransportState>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::with_history(DEFAULT_PUBLISHED_HISTORY)
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers at most `history` published envelopes, oldest dropped
    /// first. Zero keeps none.
    pub fn with_history(history: usize) -> Self {
        Self {
            state: Arc::new(TransportState {
                history,
                ..TransportState::default()
            }),
        }
    }

    /// Fails every send with `error` until cleared with `None`.
    pub async fn set_fail_on_publish(&self, error: Option<Error>) {
        *self.state.fail_on_publish.write().await = error;
    }

    /// Fails the next sends, one queued error each.
    pub async fn inject_failures(&self, errors: impl IntoIterator<Item = Error>) {
        self.state.injected_failures.lock().await.extend(errors);
    }

    pub async fn published(&self) -> Vec<Envelope> {
        self.state.published.read().await.iter().cloned().collect()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<Envelope> {
        self.state
            .published
            .read()
            .await
            .iter()
            .filter(|envelope| envelope.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn published_count(&self) -> usize {
        self.state.published.read().await.len()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if let Some(error) = self.state.injected_failures.lock().await.pop_front() {
            return Err(error);
        }
        if let Some(error) = self.state.fail_on_publish.read().await.clone() {
            return Err(error);
        }

        self.state.dispatch(envelope).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<()> {
        let (sender, receiver) = mpsc::unbounded_channel();

        self.state
            .topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .entry(options.group_id.clone())
            .or_default()
            .members
            .push(sender);

        info!(
            topic,
            group_id = %options.group_id,
            concurrency = options.concurrency,
            "Subscription started"
        );

        tokio::spawn(consume(
            receiver,
            handler,
            options,
            Arc::downgrade(&self.state),
        ));
        Ok(())
    }
}

/// Worker loop of one subscription. Ends once the transport is dropped.
async fn consume(
    mut receiver: mpsc::UnboundedReceiver<Envelope>,
    handler: Arc<dyn MessageHandler>,
    options: SubscribeOptions,
    transport: Weak<TransportState>,
) {
    let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));

    while let Some(envelope) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let handler = handler.clone();
        let dead_letter_queue = options.dead_letter_queue.clone();
        let transport = transport.clone();

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.handle(&envelope))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(Error::infrastructure(panic_message(payload.as_ref())))
                });
            drop(permit);

            let Err(e) = outcome else {
                return;
            };

            match (dead_letter_queue, transport.upgrade()) {
                (Some(dlq), Some(transport)) => {
                    warn!(
                        topic = %envelope.topic,
                        dead_letter_queue = %dlq,
                        error = %e,
                        "Handler failed, routing message to dead letter queue"
                    );
                    let mut dead = envelope.clone();
                    dead.headers
                        .insert(ORIGINAL_TOPIC_HEADER.to_string(), envelope.topic.clone());
                    dead.headers.insert(ERROR_HEADER.to_string(), e.to_string());
                    dead.topic = dlq;
                    transport.dispatch(dead).await;
                }
                _ => error!(
                    topic = %envelope.topic,
                    aggregate_id = %envelope.event.aggregate_id,
                    error = %e,
                    "Handler failed, message dropped"
                ),
            }
        });
    }
}
