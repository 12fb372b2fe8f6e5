//! Process-wide runtime: the event bus and the agent registry.
//!
//! A [`Runtime`] is constructed explicitly by the host (no global
//! singletons) and handed to every agent builder. The registry maps agent
//! ids to live agents so sub-agent links can be plain ids: delegation
//! resolves them at call time, and agent lifetimes stay independent of
//! who references them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::agent::Agent;
use crate::events::EventBus;

/// Registry of live agents, keyed by id.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<Agent>>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its id, replacing any previous entry.
    pub fn register(&self, agent: Arc<Agent>) {
        self.agents
            .write()
            .expect("registry lock")
            .insert(agent.id().to_owned(), agent);
    }

    /// Fetch an agent by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.read().expect("registry lock").get(id).cloned()
    }

    /// Fetch an agent by id or display name.
    #[must_use]
    pub fn resolve(&self, id_or_name: &str) -> Option<Arc<Agent>> {
        let agents = self.agents.read().expect("registry lock");
        agents.get(id_or_name).cloned().or_else(|| {
            agents
                .values()
                .find(|agent| agent.name() == id_or_name)
                .cloned()
        })
    }

    /// Remove an agent, returning it if present.
    pub fn remove(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.write().expect("registry lock").remove(id)
    }

    /// Ids of all registered agents.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.agents
            .read()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.agents.read().expect("registry lock").len();
        f.debug_struct("AgentRegistry")
            .field("agents", &count)
            .finish_non_exhaustive()
    }
}

/// The process-wide runtime shared by a family of agents.
#[derive(Debug, Clone, Default)]
pub struct Runtime {
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
}

impl Runtime {
    /// Create a runtime with a fresh bus and registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The event bus handle.
    #[must_use]
    pub const fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The agent registry handle.
    #[must_use]
    pub const fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }
}
