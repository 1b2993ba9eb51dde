use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::traits::Agent;
use crate::autonomy::ActionSpec;

/// Agent kind → implementation, plus the action catalog they declare
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        info!(
            "Registered agent '{}' ({} action(s))",
            agent.kind(),
            agent.actions().len()
        );
        self.agents.insert(agent.kind().to_string(), agent);
    }

    pub fn with(mut self, agent: Arc<dyn Agent>) -> Self {
        self.register(agent);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(kind).cloned()
    }

    /// Catalog entry for `action` on agent `kind`
    pub fn action(&self, kind: &str, action: &str) -> Option<ActionSpec> {
        self.agents
            .get(kind)?
            .actions()
            .into_iter()
            .find(|a| a.name == action)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.agents.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
