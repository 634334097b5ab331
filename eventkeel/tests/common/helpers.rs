use super::test_aggregate::{Agent, AgentEvent};
use eventkeel::aggregate::Context;
use eventkeel::event::RawEvent;
use eventkeel::repository::InMemoryRepository;
use serde_json::json;

pub async fn load_agent(repository: &InMemoryRepository, agent_id: &str) -> Context<Agent> {
    let mut transaction = repository.begin_transaction();

    let context: Context<Agent> = Context::load(&mut transaction, agent_id)
        .await
        .expect("Failed to load agent");

    context
}

/// Raw events for the store, stamped 1..=count.
pub fn raw_events(agent_id: &str, count: u64) -> Vec<RawEvent> {
    (1..=count)
        .map(|version| {
            RawEvent::raw(
                agent_id,
                "AgentSkillAdded",
                version,
                json!({ "type": "SkillAdded", "skill": format!("skill-{version}") }),
            )
        })
        .collect()
}

pub struct AgentBuilder {
    agent_id: String,
    events: Vec<AgentEvent>,
}

impl AgentBuilder {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            events: vec![AgentEvent::Registered {
                name: "Ada".into(),
            }],
        }
    }

    pub fn with_skill(mut self, skill: &str) -> Self {
        self.events.push(AgentEvent::SkillAdded {
            skill: skill.into(),
        });
        self
    }

    pub fn joined_team(mut self, team_id: &str) -> Self {
        self.events.push(AgentEvent::JoinedTeam {
            team_id: team_id.into(),
        });
        self
    }

    pub fn with_event(mut self, event: AgentEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn events(&self) -> &[AgentEvent] {
        &self.events
    }

    pub fn build(self) -> Context<Agent> {
        let mut agent = Context::new(self.agent_id);

        for event in self.events {
            agent.record_that(event);
        }

        agent
    }

    pub async fn save(self, repository: &InMemoryRepository) -> Context<Agent> {
        let mut agent = self.build();

        agent
            .save(repository.begin_transaction())
            .await
            .expect("Failed to save agent");

        agent
    }
}
