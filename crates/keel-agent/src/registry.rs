//! Per-run agent registry
//!
//! Built once per workflow run and passed by reference; there is no global
//! agent table.

use keel_core::config::AgentsConfig;
use keel_core::{KeelError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::agent::{build_agent, Agent};

#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    fallbacks: BTreeMap<String, String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build CLI adapters for every configured agent
    pub fn from_config(config: &AgentsConfig) -> Self {
        let mut registry = Self::new();
        for definition in &config.definitions {
            registry.register(build_agent(definition));
        }
        registry.fallbacks = config.fallbacks.clone();
        registry
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.id().to_string(), agent);
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.register(agent);
        self
    }

    pub fn with_fallback(mut self, primary: impl Into<String>, backup: impl Into<String>) -> Self {
        self.fallbacks.insert(primary.into(), backup.into());
        self
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(id)
            .cloned()
            .ok_or_else(|| KeelError::AgentNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Registered backup for `id`, if it is itself registered
    pub fn fallback_for(&self, id: &str) -> Option<&str> {
        self.fallbacks
            .get(id)
            .map(String::as_str)
            .filter(|backup| *backup != id && self.agents.contains_key(*backup))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;

    #[test]
    fn test_lookup_and_fallback() {
        let registry = AgentRegistry::new()
            .with_agent(Arc::new(MockAgent::new("claude")))
            .with_agent(Arc::new(MockAgent::new("codex")))
            .with_fallback("claude", "codex")
            .with_fallback("codex", "missing");

        assert!(registry.get("claude").is_ok());
        assert!(matches!(
            registry.get("gemini"),
            Err(KeelError::AgentNotFound(_))
        ));
        assert_eq!(registry.fallback_for("claude"), Some("codex"));
        assert_eq!(registry.fallback_for("codex"), None);
        assert_eq!(registry.ids(), vec!["claude", "codex"]);
    }

    #[test]
    fn test_from_default_config() {
        let registry = AgentRegistry::from_config(&AgentsConfig::default());
        assert!(registry.contains("claude"));
        assert!(registry.contains("gemini"));
        assert_eq!(registry.fallback_for("gemini"), Some("claude"));
    }
}
