use std::sync::Arc;

use async_trait::async_trait;
use eventkeel::aggregate::{Aggregate, Context};
use eventkeel::bus::{Envelope, InMemoryTransport, MessageHandler, SubscribeOptions};
use eventkeel::config::Settings;
use eventkeel::event::EventPayload;
use eventkeel::repository::InMemoryRepository;
use eventkeel::runtime::Runtime;
use eventkeel::saga::{Saga, SagaStep};
use eventkeel::telemetry::init_tracing;
use eventkeel::{Error, Result};
use eventkeel_postgres::{DbError, PostgresRepository};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Defaults, then EVENTKEEL_CONFIG, then EVENTKEEL__* variables
    let settings = Settings::load(None)?;
    let poll_interval = settings.outbox.poll_interval();

    // Postgres when a database is configured, process memory otherwise
    let (storage, runtime) = match settings.database.url.clone() {
        Some(url) => {
            let repository =
                PostgresRepository::connect(&url, settings.database.max_connections).await?;
            repository.run_migrations().await?;
            let collaborators = repository.collaborators(Arc::new(InMemoryTransport::new()));
            (
                Storage::Postgres(repository),
                Runtime::new(settings, collaborators)?,
            )
        }
        None => {
            let repository = InMemoryRepository::default();
            let runtime = Runtime::in_memory(settings, &repository)?;
            (Storage::InMemory(repository), runtime)
        }
    };

    // Every saved agent event reaches the directory through the outbox
    runtime
        .bus()
        .subscribe(
            Agent::AGGREGATE_TYPE,
            Arc::new(Directory),
            SubscribeOptions::new("directory").dead_letter_queue("Agent.dlq"),
        )
        .await?;
    runtime.start();

    // Register an agent
    let agent_id = format!("agent-{}", Uuid::new_v4());
    let mut agent = Context::<Agent>::new(agent_id.clone());
    agent.record_that(AgentEvent::Registered {
        name: "Ada".into(),
    });
    agent.record_that(AgentEvent::SkillAdded {
        skill: "rust".into(),
    });
    storage.save(&mut agent).await?;

    // Onboard the agent into a team. Provisioning fails, so joining the team is undone.
    let team_id = "team-7".to_string();
    let mut saga = Saga::new(Onboarding {
        agent_id: agent_id.clone(),
        team_id: team_id.clone(),
    })
    .with_step(JoinTeam {
        storage: storage.clone(),
    })
    .with_step(ProvisionWorkspace);

    let saga_ref = &mut saga;
    let outcome = runtime
        .lock()
        .with_lock(&team_id, &runtime.lock_options(), move || async move {
            saga_ref.execute().await
        })
        .await;

    if let Err(e) = outcome {
        warn!(error = %e, status = %saga.status(), "Onboarding did not complete");
    }

    let agent = storage.load(&agent_id).await?;
    info!(
        agent_id = %agent_id,
        version = agent.version(),
        team_id = ?agent.state().team_id,
        "Agent after onboarding"
    );

    // Give the outbox a few polls to deliver everything
    tokio::time::sleep(poll_interval * 3).await;
    runtime.shutdown().await;

    Ok(())
}

// Define our aggregate
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct Agent {
    name: String,
    skills: Vec<String>,
    team_id: Option<String>,
}

// Define our domain events
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum AgentEvent {
    Registered { name: String },
    SkillAdded { skill: String },
    JoinedTeam { team_id: String },
    LeftTeam,
}

impl EventPayload for AgentEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "AgentRegistered",
        "AgentSkillAdded",
        "AgentJoinedTeam",
        "AgentLeftTeam",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::Registered { .. } => "AgentRegistered",
            AgentEvent::SkillAdded { .. } => "AgentSkillAdded",
            AgentEvent::JoinedTeam { .. } => "AgentJoinedTeam",
            AgentEvent::LeftTeam => "AgentLeftTeam",
        }
    }
}

// Implement the aggregate trait for our aggregate struct
impl Aggregate for Agent {
    /// Also the topic the events of this aggregate are published on.
    const AGGREGATE_TYPE: &'static str = "Agent";

    /// The current version of the snapshot to store.
    /// This number should be increased when a breaking change is made to the apply function.
    const SNAPSHOT_VERSION: u64 = 1;

    /// The type of Domain Events that interest this Aggregate.
    type DomainEvent = AgentEvent;

    /// Mutates the state of an Aggregate through a Domain Event.
    fn apply(&mut self, event: &Self::DomainEvent) {
        match event {
            AgentEvent::Registered { name } => self.name = name.clone(),
            AgentEvent::SkillAdded { skill } => self.skills.push(skill.clone()),
            AgentEvent::JoinedTeam { team_id } => self.team_id = Some(team_id.clone()),
            AgentEvent::LeftTeam => self.team_id = None,
        }
    }
}

/// Where agents are kept.
#[derive(Clone)]
enum Storage {
    InMemory(InMemoryRepository),
    Postgres(PostgresRepository),
}

impl Storage {
    async fn load(&self, agent_id: &str) -> Result<Context<Agent>> {
        match self {
            Storage::InMemory(repository) => {
                let mut transaction = repository.begin_transaction();
                Ok(Context::load(&mut transaction, agent_id).await?)
            }
            Storage::Postgres(repository) => {
                let mut transaction = repository
                    .begin_transaction()
                    .await
                    .map_err(DbError::from)?;
                Ok(Context::load(&mut transaction, agent_id).await?)
            }
        }
    }

    async fn save(&self, agent: &mut Context<Agent>) -> Result<()> {
        match self {
            Storage::InMemory(repository) => agent.save(repository.begin_transaction()).await?,
            Storage::Postgres(repository) => {
                let transaction = repository
                    .begin_transaction()
                    .await
                    .map_err(DbError::from)?;
                agent.save(transaction).await?
            }
        }
        Ok(())
    }
}

/// Logs every agent event it receives.
struct Directory;

#[async_trait]
impl MessageHandler for Directory {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        info!(
            agent_id = %envelope.event.aggregate_id,
            event_type = %envelope.event.event_type,
            version = envelope.event.version,
            "Directory updated"
        );
        Ok(())
    }
}

#[derive(Debug)]
struct Onboarding {
    agent_id: String,
    team_id: String,
}

struct JoinTeam {
    storage: Storage,
}

#[async_trait]
impl SagaStep<Onboarding> for JoinTeam {
    fn name(&self) -> &str {
        "join-team"
    }

    async fn execute(&self, data: &mut Onboarding) -> Result<()> {
        let mut agent = self.storage.load(&data.agent_id).await?;
        agent.record_that(AgentEvent::JoinedTeam {
            team_id: data.team_id.clone(),
        });
        self.storage.save(&mut agent).await
    }

    async fn compensate(&self, data: &mut Onboarding) -> Result<()> {
        let mut agent = self.storage.load(&data.agent_id).await?;
        agent.record_that(AgentEvent::LeftTeam);
        self.storage.save(&mut agent).await
    }
}

struct ProvisionWorkspace;

#[async_trait]
impl SagaStep<Onboarding> for ProvisionWorkspace {
    fn name(&self) -> &str {
        "provision-workspace"
    }

    async fn execute(&self, data: &mut Onboarding) -> Result<()> {
        Err(Error::fatal(format!(
            "no workspace quota left for {}",
            data.team_id
        )))
    }

    async fn compensate(&self, _data: &mut Onboarding) -> Result<()> {
        Ok(())
    }
}
