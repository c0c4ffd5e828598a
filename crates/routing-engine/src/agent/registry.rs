//! Directory of routable agents

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::availability::Agent;
use super::types::AgentId;
use crate::error::{Result, RoutingError};

/// Concurrent registry of [`Agent`]s keyed by id
///
/// Lookups never block writers on other agents; steps hold only agent ids
/// and resolve them here when building a candidate list.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<AgentId, Arc<Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, failing if the id is already taken
    pub fn register(&self, agent: Agent) -> Result<Arc<Agent>> {
        let agent = Arc::new(agent);
        match self.agents.entry(agent.id().clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RoutingError::already_exists(
                format!("agent '{}' already registered", agent.id()),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!("Registered agent {} ({})", agent.id(), agent.display_name());
                slot.insert(agent.clone());
                Ok(agent)
            }
        }
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    /// Look up an agent, turning a miss into [`RoutingError::NotFound`]
    pub fn require(&self, agent_id: &AgentId) -> Result<Arc<Agent>> {
        self.get(agent_id)
            .ok_or_else(|| RoutingError::not_found(format!("agent '{}' not found", agent_id)))
    }

    pub fn remove(&self, agent_id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.remove(agent_id).map(|(_, agent)| agent)
    }

    pub fn list(&self) -> Vec<Arc<Agent>> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::AttributeSet;

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = AgentRegistry::new();
        registry.register(Agent::new("alice", "Alice", AttributeSet::new())).unwrap();

        let duplicate = registry.register(Agent::new("alice", "Other", AttributeSet::new()));
        assert!(matches!(duplicate, Err(RoutingError::AlreadyExists(_))));
        assert_eq!(registry.get(&AgentId::from("alice")).unwrap().display_name(), "Alice");
    }

    #[test]
    fn test_remove_and_require() {
        let registry = AgentRegistry::new();
        registry.register(Agent::new("bob", "Bob", AttributeSet::new())).unwrap();

        assert!(registry.require(&AgentId::from("bob")).is_ok());
        assert!(registry.remove(&AgentId::from("bob")).is_some());
        assert!(registry.remove(&AgentId::from("bob")).is_none());
        assert!(matches!(
            registry.require(&AgentId::from("bob")),
            Err(RoutingError::NotFound(_))
        ));
        assert!(registry.is_empty());
    }
}
