//! Transactional outbox and the processor that drains it.
//!
//! Outbox messages are written in the same transaction as the events they
//! carry (see [`crate::repository`]). The [`OutboxProcessor`] polls for
//! pending messages, claims a batch atomically and publishes each message
//! through an [`EventPublisher`]. Delivery is at least once.
//!
//! Status transitions:
//!
//! ```text
//! PENDING -> PROCESSING -> COMPLETED
//!                       -> FAILED
//!                       -> PENDING (retry, or released untouched)
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::EventPublisher;
use crate::error::{Error, Result};
use crate::event::RawEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Completed => "COMPLETED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "COMPLETED" => Ok(OutboxStatus::Completed),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(Error::validation(format!("unknown outbox status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub topic: String,
    pub payload: RawEvent,
    pub status: OutboxStatus,
    /// Failed attempts that were scheduled for another try.
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl OutboxMessage {
    pub fn new(topic: impl Into<String>, payload: RawEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_attempt: None,
            claimed_at: None,
            created_at: Utc::now(),
            error: None,
        }
    }

    pub fn aggregate_id(&self) -> &str {
        &self.payload.aggregate_id
    }
}

/// Storage for outbox messages.
///
/// Every transition out of PROCESSING only applies to a message that is
/// currently PROCESSING; anything else fails with [`Error::InvalidState`].
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, messages: Vec<OutboxMessage>) -> Result<()>;

    /// Moves up to `batch_size` PENDING messages to PROCESSING in one atomic
    /// step and returns them in creation order. Two concurrent claims never
    /// return the same message.
    async fn claim_pending(&self, batch_size: usize) -> Result<Vec<OutboxMessage>>;

    async fn mark_completed(&self, id: Uuid) -> Result<()>;

    /// Back to PENDING with `retry_count + 1` and `last_attempt = now`.
    async fn mark_for_retry(&self, id: Uuid, error: &str) -> Result<()>;

    /// Back to PENDING without counting an attempt.
    async fn release(&self, id: Uuid) -> Result<()>;

    /// Terminal. The message stays in the store for inspection.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>>;

    /// Messages in `status`, oldest first.
    async fn list(&self, status: OutboxStatus, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Returns messages claimed before `claimed_before` to PENDING, so the
    /// work of a processor that died mid-batch is picked up again.
    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64>;
}

/// Completed messages an [`InMemoryOutboxStore`] keeps by default.
pub const DEFAULT_COMPLETED_RETENTION: usize = 1_000;

/// An [`OutboxStore`] kept in process memory, in insertion order.
///
/// Only the most recent completed messages are kept. Pending, in-flight and
/// failed messages are never dropped.
#[derive(Debug)]
pub struct InMemoryOutboxStore {
    messages: Mutex<Vec<OutboxMessage>>,
    completed_retention: usize,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::with_completed_retention(DEFAULT_COMPLETED_RETENTION)
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completed_retention(completed_retention: usize) -> Self {
        Self {
            messages: Mutex::default(),
            completed_retention,
        }
    }

    /// Drops the oldest completed messages beyond the retention bound.
    fn prune_completed(&self, messages: &mut Vec<OutboxMessage>) {
        let completed = messages
            .iter()
            .filter(|message| message.status == OutboxStatus::Completed)
            .count();
        let mut excess = completed.saturating_sub(self.completed_retention);
        if excess == 0 {
            return;
        }
        messages.retain(|message| {
            if excess > 0 && message.status == OutboxStatus::Completed {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    async fn transition<F>(&self, id: Uuid, update: F) -> Result<()>
    where
        F: FnOnce(&mut OutboxMessage) + Send,
    {
        let mut messages = self.messages.lock().await;
        let message = messages
            .iter_mut()
            .find(|message| message.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if message.status != OutboxStatus::Processing {
            return Err(Error::InvalidState {
                expected: OutboxStatus::Processing.to_string(),
                actual: message.status.to_string(),
            });
        }

        update(message);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, messages: Vec<OutboxMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.messages.lock().await.extend(messages);
        Ok(())
    }

    async fn claim_pending(&self, batch_size: usize) -> Result<Vec<OutboxMessage>> {
        let mut messages = self.messages.lock().await;
        let now = Utc::now();

        Ok(messages
            .iter_mut()
            .filter(|message| message.status == OutboxStatus::Pending)
            .take(batch_size)
            .map(|message| {
                message.status = OutboxStatus::Processing;
                message.claimed_at = Some(now);
                message.clone()
            })
            .collect())
    }

    async fn mark_completed(&self, id: Uuid) -> Result<()> {
        self.transition(id, |message| {
            message.status = OutboxStatus::Completed;
            message.error = None;
        })
        .await?;
        self.prune_completed(&mut *self.messages.lock().await);
        Ok(())
    }

    async fn mark_for_retry(&self, id: Uuid, error: &str) -> Result<()> {
        let error = error.to_string();
        self.transition(id, move |message| {
            message.status = OutboxStatus::Pending;
            message.retry_count += 1;
            message.last_attempt = Some(Utc::now());
            message.claimed_at = None;
            message.error = Some(error);
        })
        .await
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        self.transition(id, |message| {
            message.status = OutboxStatus::Pending;
            message.claimed_at = None;
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let error = error.to_string();
        self.transition(id, move |message| {
            message.status = OutboxStatus::Failed;
            message.last_attempt = Some(Utc::now());
            message.error = Some(error);
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        let messages = self.messages.lock().await;
        Ok(messages.iter().find(|message| message.id == id).cloned())
    }

    async fn list(&self, status: OutboxStatus, limit: usize) -> Result<Vec<OutboxMessage>> {
        let messages = self.messages.lock().await;
        Ok(messages
            .iter()
            .filter(|message| message.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let mut messages = self.messages.lock().await;
        let mut reclaimed = 0;
        for message in messages.iter_mut().filter(|message| {
            message.status == OutboxStatus::Processing
                && message.claimed_at.is_some_and(|at| at < claimed_before)
        }) {
            message.status = OutboxStatus::Pending;
            message.claimed_at = None;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}

/// Outbox processor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Messages claimed per poll. Default: 100.
    pub batch_size: usize,
    /// Time between two polls. Default: 1000.
    pub poll_interval_ms: u64,
    /// Failed publishes scheduled for retry before a message is marked FAILED. Default: 3.
    pub max_retries: u32,
    /// Messages left PROCESSING for longer than this are reclaimed.
    /// Zero disables reclaiming. Default: 300000.
    pub processing_timeout_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 1_000,
            max_retries: 3,
            processing_timeout_ms: 300_000,
        }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// What one call to [`OutboxProcessor::process_batch`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
    /// Released untouched, because an earlier message of the same aggregate
    /// failed or the circuit in front of the publisher is open.
    pub deferred: usize,
}

#[derive(Clone)]
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxConfig,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Claims one batch and publishes it in creation order.
    ///
    /// Once a message of an aggregate fails, the later messages of that
    /// aggregate in the batch are released without an attempt, so they are
    /// never delivered ahead of it. An open circuit was never an attempt at
    /// all: the message and the rest of the batch go back to PENDING with
    /// their retry counts untouched.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        self.reclaim_stale().await?;

        let batch = self.store.claim_pending(self.config.batch_size).await?;
        let mut report = BatchReport {
            claimed: batch.len(),
            ..BatchReport::default()
        };
        let mut blocked: HashSet<String> = HashSet::new();
        let mut circuit_open = false;

        for message in batch {
            if circuit_open || blocked.contains(message.aggregate_id()) {
                self.store.release(message.id).await?;
                report.deferred += 1;
                continue;
            }

            match self
                .publisher
                .publish_event(&message.topic, &message.payload)
                .await
            {
                Ok(()) => {
                    self.store.mark_completed(message.id).await?;
                    report.published += 1;
                }
                Err(e @ Error::CircuitOpen { .. }) => {
                    warn!(
                        message_id = %message.id,
                        topic = %message.topic,
                        error = %e,
                        "Circuit open, returning the rest of the batch to the outbox"
                    );
                    self.store.release(message.id).await?;
                    report.deferred += 1;
                    circuit_open = true;
                }
                Err(e) => {
                    blocked.insert(message.aggregate_id().to_string());
                    if e.is_retryable() && message.retry_count < self.config.max_retries {
                        warn!(
                            message_id = %message.id,
                            topic = %message.topic,
                            retry_count = message.retry_count + 1,
                            error = %e,
                            "Outbox publish failed, will retry"
                        );
                        self.store.mark_for_retry(message.id, &e.to_string()).await?;
                        report.retried += 1;
                    } else {
                        error!(
                            message_id = %message.id,
                            topic = %message.topic,
                            retry_count = message.retry_count,
                            error = %e,
                            "Outbox message moved to FAILED"
                        );
                        self.store.mark_failed(message.id, &e.to_string()).await?;
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn reclaim_stale(&self) -> Result<()> {
        if self.config.processing_timeout_ms == 0 {
            return Ok(());
        }
        let timeout = chrono::Duration::milliseconds(
            i64::try_from(self.config.processing_timeout_ms).unwrap_or(i64::MAX),
        );
        let reclaimed = self.store.reclaim_stale(Utc::now() - timeout).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed stale outbox messages");
        }
        Ok(())
    }

    /// Polls the outbox at a fixed interval until `shutdown` turns true or
    /// its sender is dropped. Batch failures are logged and the loop goes on.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "Outbox processor started"
        );

        while !*shutdown.borrow() {
            let deadline = tokio::time::Instant::now() + self.config.poll_interval();

            match self.process_batch().await {
                Ok(report) if report.claimed > 0 => debug!(?report, "Outbox batch processed"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Outbox batch failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Outbox processor stopped");
    }

    /// Runs the processor loop as a background task.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let processor = self.clone();
        tokio::spawn(async move { processor.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Publishes according to a script of outcomes, then succeeds.
    #[derive(Default)]
    struct ScriptedPublisher {
        outcomes: Mutex<VecDeque<Result<()>>>,
        published: Mutex<Vec<(String, u64)>>,
    }

    impl ScriptedPublisher {
        fn failing(outcomes: Vec<Result<()>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                published: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl EventPublisher for ScriptedPublisher {
        async fn publish_event(&self, _topic: &str, event: &RawEvent) -> Result<()> {
            let outcome = self.outcomes.lock().await.pop_front().unwrap_or(Ok(()));
            if outcome.is_ok() {
                self.published
                    .lock()
                    .await
                    .push((event.aggregate_id.clone(), event.version));
            }
            outcome
        }
    }

    fn message(aggregate_id: &str, version: u64) -> OutboxMessage {
        OutboxMessage::new(
            "Agent",
            RawEvent::raw(aggregate_id, "AgentRegistered", version, json!({})),
        )
    }

    fn processor(
        store: Arc<InMemoryOutboxStore>,
        publisher: Arc<ScriptedPublisher>,
        max_retries: u32,
    ) -> OutboxProcessor {
        OutboxProcessor::new(
            store,
            publisher,
            OutboxConfig {
                max_retries,
                ..OutboxConfig::default()
            },
        )
    }

    #[test]
    fn status_round_trips_through_its_wire_name() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Completed,
            OutboxStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_value(OutboxStatus::Processing).unwrap(),
            json!("PROCESSING")
        );
    }

    #[tokio::test]
    async fn claims_are_exclusive_and_in_creation_order() {
        let store = InMemoryOutboxStore::new();
        let messages: Vec<_> = (1..=5).map(|v| message("agent-1", v)).collect();
        let ids: Vec<_> = messages.iter().map(|m| m.id).collect();
        store.insert(messages).await.unwrap();

        let first = store.claim_pending(3).await.unwrap();
        let second = store.claim_pending(3).await.unwrap();

        assert_eq!(first.iter().map(|m| m.id).collect::<Vec<_>>(), ids[..3]);
        assert_eq!(second.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..]);
        assert!(first
            .iter()
            .all(|m| m.status == OutboxStatus::Processing && m.claimed_at.is_some()));
        assert!(store.claim_pending(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transitions_require_a_claimed_message() {
        let store = InMemoryOutboxStore::new();
        let pending = message("agent-1", 1);
        let id = pending.id;
        store.insert(vec![pending]).await.unwrap();

        let err = store.mark_completed(id).await.expect_err("Unclaimed message completed");
        assert!(matches!(err, Error::InvalidState { .. }));

        let err = store
            .mark_failed(Uuid::new_v4(), "boom")
            .await
            .expect_err("Unknown message failed");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_publish_is_retried_then_dead_lettered() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = ScriptedPublisher::failing(vec![
            Err(Error::infrastructure("broker down")),
            Err(Error::infrastructure("broker down")),
        ]);
        let processor = processor(store.clone(), publisher.clone(), 1);
        let pending = message("agent-1", 1);
        let id = pending.id;
        store.insert(vec![pending]).await.unwrap();

        let report = processor.process_batch().await.unwrap();
        assert_eq!(report.retried, 1);
        let retried = store.get(id).await.unwrap().unwrap();
        assert_eq!(retried.status, OutboxStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.last_attempt.is_some());

        let report = processor.process_batch().await.unwrap();
        assert_eq!(report.failed, 1);
        let failed = store.get(id).await.unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error.as_deref(), Some("Infrastructure failure: broker down"));

        let report = processor.process_batch().await.unwrap();
        assert_eq!(report, BatchReport::default());
        assert_eq!(store.list(OutboxStatus::Failed, 10).await.unwrap().len(), 1);
        assert!(publisher.published.lock().await.is_empty());
    }

    #[tokio::test]
    async fn non_retryable_publish_failures_fail_immediately() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher =
            ScriptedPublisher::failing(vec![Err(Error::validation("missing event type"))]);
        let processor = processor(store.clone(), publisher, 5);
        let pending = message("agent-1", 1);
        let id = pending.id;
        store.insert(vec![pending]).await.unwrap();

        let report = processor.process_batch().await.unwrap();

        assert_eq!(report.failed, 1);
        let failed = store.get(id).await.unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn a_failure_defers_later_messages_of_the_same_aggregate() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = ScriptedPublisher::failing(vec![Err(Error::infrastructure("timeout"))]);
        let processor = processor(store.clone(), publisher.clone(), 3);
        store
            .insert(vec![
                message("agent-1", 1),
                message("agent-1", 2),
                message("agent-2", 1),
            ])
            .await
            .unwrap();

        let report = processor.process_batch().await.unwrap();
        assert_eq!(
            report,
            BatchReport {
                claimed: 3,
                published: 1,
                retried: 1,
                failed: 0,
                deferred: 1,
            }
        );

        let report = processor.process_batch().await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(
            *publisher.published.lock().await,
            vec![
                ("agent-2".to_string(), 1),
                ("agent-1".to_string(), 1),
                ("agent-1".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn an_open_circuit_returns_messages_without_spending_attempts() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = ScriptedPublisher::failing(vec![
            Err(Error::infrastructure("broker down")),
            Err(Error::CircuitOpen {
                name: "bus".into(),
                retry_after: Duration::from_secs(60),
            }),
        ]);
        let processor = processor(store.clone(), publisher.clone(), 5);
        let first = message("agent-1", 1);
        let second = message("agent-2", 1);
        let third = message("agent-3", 1);
        let (first_id, second_id, third_id) = (first.id, second.id, third.id);
        store.insert(vec![first, second, third]).await.unwrap();

        let report = processor.process_batch().await.unwrap();
        assert_eq!(
            report,
            BatchReport {
                claimed: 3,
                published: 0,
                retried: 1,
                failed: 0,
                deferred: 2,
            }
        );
        assert!(store.list(OutboxStatus::Failed, 10).await.unwrap().is_empty());
        for id in [second_id, third_id] {
            let released = store.get(id).await.unwrap().unwrap();
            assert_eq!(released.status, OutboxStatus::Pending);
            assert_eq!(released.retry_count, 0);
            assert!(released.error.is_none());
        }
        assert_eq!(store.get(first_id).await.unwrap().unwrap().retry_count, 1);

        let report = processor.process_batch().await.unwrap();
        assert_eq!(report.published, 3);
        assert_eq!(publisher.published.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn only_the_most_recent_completed_messages_are_kept() {
        let store = InMemoryOutboxStore::with_completed_retention(2);
        let messages: Vec<_> = (1..=4).map(|v| message("agent-1", v)).collect();
        let ids: Vec<_> = messages.iter().map(|m| m.id).collect();
        store.insert(messages).await.unwrap();
        store.insert(vec![message("agent-2", 1)]).await.unwrap();

        let claimed = store.claim_pending(4).await.unwrap();
        for message in &claimed {
            store.mark_completed(message.id).await.unwrap();
        }

        assert!(store.get(ids[0]).await.unwrap().is_none());
        assert!(store.get(ids[1]).await.unwrap().is_none());
        let kept = store.list(OutboxStatus::Completed, 10).await.unwrap();
        assert_eq!(kept.iter().map(|m| m.id).collect::<Vec<_>>(), ids[2..]);
        assert_eq!(store.list(OutboxStatus::Pending, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_claims_are_reclaimed() {
        let store = InMemoryOutboxStore::new();
        store.insert(vec![message("agent-1", 1)]).await.unwrap();
        let claimed = store.claim_pending(10).await.unwrap();

        let reclaimed = store
            .reclaim_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(reclaimed, 1);
        let message = store.get(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxStatus::Pending);
        assert_eq!(message.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_until_shutdown() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = ScriptedPublisher::failing(vec![]);
        let processor = processor(store.clone(), publisher.clone(), 3);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = processor.spawn(shutdown_rx);
        store.insert(vec![message("agent-1", 1)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.expect("Processor task panicked");

        assert_eq!(publisher.published.lock().await.len(), 1);
        assert!(store.list(OutboxStatus::Pending, 10).await.unwrap().is_empty());
    }
}
