use eventkeel::aggregate::Aggregate;
use eventkeel::event::EventPayload;
use serde::{Deserialize, Serialize};

// Define our aggregate
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Agent {
    pub name: String,
    pub skills: Vec<String>,
    // Teams are referenced by id only
    pub team_id: Option<String>,
    pub retired: bool,
}

// Define our domain events
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum AgentEvent {
    Registered { name: String },
    SkillAdded { skill: String },
    JoinedTeam { team_id: String },
    LeftTeam,
    Retired,
}

impl EventPayload for AgentEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "AgentRegistered",
        "AgentSkillAdded",
        "AgentJoinedTeam",
        "AgentLeftTeam",
        "AgentRetired",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::Registered { .. } => "AgentRegistered",
            AgentEvent::SkillAdded { .. } => "AgentSkillAdded",
            AgentEvent::JoinedTeam { .. } => "AgentJoinedTeam",
            AgentEvent::LeftTeam => "AgentLeftTeam",
            AgentEvent::Retired => "AgentRetired",
        }
    }
}

impl Aggregate for Agent {
    const AGGREGATE_TYPE: &'static str = "Agent";

    /// The current version of the snapshot to store.
    const SNAPSHOT_VERSION: u64 = 1;

    type DomainEvent = AgentEvent;

    fn apply(&mut self, event: &Self::DomainEvent) {
        match event {
            AgentEvent::Registered { name } => self.name = name.clone(),
            AgentEvent::SkillAdded { skill } => {
                if !self.skills.contains(skill) {
                    self.skills.push(skill.clone());
                }
            }
            AgentEvent::JoinedTeam { team_id } => self.team_id = Some(team_id.clone()),
            AgentEvent::LeftTeam => self.team_id = None,
            AgentEvent::Retired => self.retired = true,
        }
    }
}
