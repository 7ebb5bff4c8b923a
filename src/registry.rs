use std::collections::HashMap;

use crate::errors::{ExecutionError, Result};
use crate::node::{ActorFn, Dependency};

/// A registered, not-yet-instantiated node template: the flow builder
/// turns these into live `Node`s via `flow::instantiate_with_deps`.
#[derive(Clone)]
pub struct NodeDescriptor {
    pub name: String,
    pub inputs: Vec<Dependency>,
    pub func: ActorFn,
}

/// External collaborator supplying node/plugin templates. Consumed, not
/// implemented, by the core — an embedder registers its actor catalogue
/// and hands the registry to `flow::instantiate_with_deps`. Grounded on
/// `pylib-v1/ailets/atyping.py::INodeRegistry`.
pub trait NodeRegistry: Send + Sync {
    fn has_node(&self, name: &str) -> bool;
    fn get_node(&self, name: &str) -> Result<NodeDescriptor>;
    fn has_plugin(&self, regname: &str) -> bool;
    fn get_plugin(&self, regname: &str) -> Result<Vec<String>>;
}

/// In-memory registry, mainly for tests and small embedded pipelines.
#[derive(Default)]
pub struct InMemoryRegistry {
    nodes: HashMap<String, NodeDescriptor>,
    plugins: HashMap<String, Vec<String>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node(&mut self, desc: NodeDescriptor) {
        self.nodes.insert(desc.name.clone(), desc);
    }

    pub fn register_plugin(&mut self, name: impl Into<String>, members: Vec<String>) {
        self.plugins.insert(name.into(), members);
    }
}

impl NodeRegistry for InMemoryRegistry {
    fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    fn get_node(&self, name: &str) -> Result<NodeDescriptor> {
        self.nodes
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::RegistryMiss(name.to_string()))
    }

    fn has_plugin(&self, regname: &str) -> bool {
        self.plugins.contains_key(regname)
    }

    fn get_plugin(&self, regname: &str) -> Result<Vec<String>> {
        self.plugins
            .get(regname)
            .cloned()
            .ok_or_else(|| ExecutionError::RegistryMiss(regname.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn round_trips_registered_node() {
        let mut reg = InMemoryRegistry::new();
        reg.register_node(NodeDescriptor {
            name: "echo".to_string(),
            inputs: vec![],
            func: Arc::new(|_rt| Ok(())),
        });
        assert!(reg.has_node("echo"));
        assert!(reg.get_node("missing").is_err());
    }

    #[test]
    fn plugin_resolves_to_member_list() {
        let mut reg = InMemoryRegistry::new();
        reg.register_plugin(".tool.search", vec!["search.1".to_string()]);
        assert!(reg.has_plugin(".tool.search"));
        assert_eq!(reg.get_plugin(".tool.search").unwrap(), vec!["search.1"]);
    }
}
