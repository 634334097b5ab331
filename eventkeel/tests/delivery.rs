mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::helpers::AgentBuilder;
use eventkeel::bus::{
    Envelope, InMemoryTransport, MessageBus, MessageHandler, SubscribeOptions,
};
use eventkeel::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use eventkeel::outbox::{OutboxConfig, OutboxProcessor, OutboxStatus, OutboxStore};
use eventkeel::repository::InMemoryRepository;
use eventkeel::retry::RetryStrategy;
use eventkeel::{Error, Result};
use tokio::sync::mpsc;

struct Forward(mpsc::UnboundedSender<Envelope>);

#[async_trait]
impl MessageHandler for Forward {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let _ = self.0.send(envelope.clone());
        Ok(())
    }
}

fn processor(
    repository: &InMemoryRepository,
    transport: Arc<InMemoryTransport>,
    max_retries: u32,
) -> (OutboxProcessor, MessageBus) {
    let bus = MessageBus::new(
        transport,
        RetryStrategy::none(),
        Arc::new(CircuitBreaker::with_config(
            "bus",
            CircuitBreakerConfig {
                failure_threshold: 100,
                ..CircuitBreakerConfig::default()
            },
        )),
    );
    let processor = OutboxProcessor::new(
        repository.outbox().clone(),
        Arc::new(bus.clone()),
        OutboxConfig {
            max_retries,
            ..OutboxConfig::default()
        },
    );
    (processor, bus)
}

#[tokio::test]
pub async fn saved_events_reach_subscribers_in_order() {
    // Arrange
    let repository = InMemoryRepository::default();
    let transport = Arc::new(InMemoryTransport::new());
    let (processor, bus) = processor(&repository, transport.clone(), 3);
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe("Agent", Arc::new(Forward(tx)), SubscribeOptions::new("projection"))
        .await
        .expect("Failed to subscribe");

    let _ = AgentBuilder::new("agent-1")
        .with_skill("rust")
        .joined_team("team-7")
        .save(&repository)
        .await;

    // Act
    let report = processor
        .process_batch()
        .await
        .expect("Failed to process batch");

    // Assert
    assert_eq!(report.published, 3);
    let mut versions = Vec::new();
    for _ in 0..3 {
        let envelope = rx.recv().await.expect("Subscriber missed an event");
        assert_eq!(envelope.partition_key, "agent-1");
        versions.push(envelope.event.version);
    }
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(
        repository
            .outbox()
            .list(OutboxStatus::Completed, 10)
            .await
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
pub async fn failing_publishes_are_retried_then_dead_lettered() {
    // Arrange
    let repository = InMemoryRepository::default();
    let transport = Arc::new(InMemoryTransport::new());
    let (processor, _bus) = processor(&repository, transport.clone(), 3);
    transport
        .set_fail_on_publish(Some(Error::infrastructure("broker unreachable")))
        .await;

    let _ = AgentBuilder::new("agent-1").save(&repository).await;
    let message_id = repository
        .outbox()
        .list(OutboxStatus::Pending, 1)
        .await
        .unwrap()[0]
        .id;

    // Act
    processor
        .process_batch()
        .await
        .expect("Failed to process batch");

    // Assert
    let message = repository.outbox().get(message_id).await.unwrap().unwrap();
    assert_eq!(message.status, OutboxStatus::Pending);
    assert_eq!(message.retry_count, 1);
    assert!(message.last_attempt.is_some());

    for _ in 0..3 {
        processor
            .process_batch()
            .await
            .expect("Failed to process batch");
    }

    let message = repository.outbox().get(message_id).await.unwrap().unwrap();
    assert_eq!(message.status, OutboxStatus::Failed);
    assert_eq!(message.retry_count, 3);

    transport.set_fail_on_publish(None).await;
    let report = processor
        .process_batch()
        .await
        .expect("Failed to process batch");
    assert_eq!(report.claimed, 0);
    assert_eq!(transport.published_count().await, 0);
}
