//! Agent registry: the named set of adapters the dispatcher can route to.

use std::collections::HashMap;
use std::sync::Arc;

use super::{AgentAdapter, ClaudeAdapter, CodexAdapter, GeminiAdapter, OpencodeAdapter};

/// Registered [`AgentAdapter`] implementations keyed by name.
#[derive(Default)]
pub struct AgentRegistry {
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the four built-in adapters.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ClaudeAdapter::new());
        registry.register(CodexAdapter::new());
        registry.register(GeminiAdapter::new());
        registry.register(OpencodeAdapter::new());
        registry
    }

    /// Register an adapter under [`AgentAdapter::name`], returning any
    /// adapter it replaced.
    pub fn register(&mut self, adapter: impl AgentAdapter + 'static) -> Option<Arc<dyn AgentAdapter>> {
        let name = adapter.name().to_string();
        self.adapters.insert(name, Arc::new(adapter))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Adapters in name order.
    pub fn adapters(&self) -> Vec<Arc<dyn AgentAdapter>> {
        self.names()
            .into_iter()
            .filter_map(|name| self.get(name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}
