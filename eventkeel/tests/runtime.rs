mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::helpers::{load_agent, AgentBuilder};
use common::test_aggregate::{Agent, AgentEvent};
use eventkeel::aggregate::Context;
use eventkeel::bus::{Envelope, MessageHandler, SubscribeOptions};
use eventkeel::config::Settings;
use eventkeel::repository::InMemoryRepository;
use eventkeel::runtime::Runtime;
use eventkeel::saga::{Saga, SagaStatus, SagaStep};
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

/// Moves agents into a team, one saved aggregate per step.
struct JoinTeam {
    repository: InMemoryRepository,
    agent_id: &'static str,
    fail: bool,
}

#[async_trait]
impl SagaStep<String> for JoinTeam {
    fn name(&self) -> &str {
        self.agent_id
    }

    async fn execute(&self, team_id: &mut String) -> Result<()> {
        if self.fail {
            return Err(Error::infrastructure("directory service unavailable"));
        }
        let mut agent = load_agent(&self.repository, self.agent_id).await;
        agent.record_that(AgentEvent::JoinedTeam {
            team_id: team_id.clone(),
        });
        agent.save(self.repository.begin_transaction()).await?;
        Ok(())
    }

    async fn compensate(&self, _team_id: &mut String) -> Result<()> {
        let mut agent = load_agent(&self.repository, self.agent_id).await;
        agent.record_that(AgentEvent::LeftTeam);
        agent.save(self.repository.begin_transaction()).await?;
        Ok(())
    }
}

#[tokio::test]
pub async fn running_runtime_delivers_saved_events() {
    // Arrange
    let repository = InMemoryRepository::default();
    let mut settings = Settings::default();
    settings.outbox.poll_interval_ms = 10;
    let runtime = Runtime::in_memory(settings, &repository).expect("Failed to build runtime");
    let (tx, mut rx) = mpsc::unbounded_channel();
    runtime
        .bus()
        .subscribe("Agent", Arc::new(Forward(tx)), SubscribeOptions::new("audit"))
        .await
        .expect("Failed to subscribe");

    // Act
    runtime.start();
    let _ = AgentBuilder::new("agent-1").save(&repository).await;

    // Assert
    let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Event was not delivered in time")
        .expect("Subscription closed");
    assert_eq!(envelope.event.event_type, "AgentRegistered");

    runtime.shutdown().await;
}

#[tokio::test]
pub async fn failed_saga_rolls_back_saved_aggregates_under_lock() {
    // Arrange
    let repository = InMemoryRepository::default();
    let runtime = Runtime::in_memory(Settings::default(), &repository)
        .expect("Failed to build runtime");
    let _ = AgentBuilder::new("agent-1").save(&repository).await;
    let _ = AgentBuilder::new("agent-2").save(&repository).await;

    let mut saga = Saga::new("team-7".to_string())
        .with_step(JoinTeam {
            repository: repository.clone(),
            agent_id: "agent-1",
            fail: false,
        })
        .with_step(JoinTeam {
            repository: repository.clone(),
            agent_id: "agent-2",
            fail: true,
        });

    // Act
    let saga_ref = &mut saga;
    let result = runtime
        .lock()
        .with_lock("team-7", &runtime.lock_options(), move || async move {
            saga_ref.execute().await
        })
        .await;

    // Assert
    assert!(matches!(result, Err(Error::SagaStep { step: 1, .. })));
    assert_eq!(saga.status(), SagaStatus::Failed);

    let agent: Context<Agent> = load_agent(&repository, "agent-1").await;
    assert_eq!(agent.state().team_id, None);
    assert_eq!(agent.version(), 3);

    let guard = runtime
        .lock()
        .acquire("team-7", &runtime.lock_options())
        .await
        .expect("Lock was still held after the saga");
    assert!(runtime.lock().release(guard).await.expect("Failed to release lock"));
}
