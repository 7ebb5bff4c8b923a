use std::collections::HashMap;
use std::sync::Arc;

use crate::env::Environment;
use crate::errors::{ExecutionError, Result};
use crate::flow;
use crate::registry::NodeRegistry;
use crate::value_node;

/// Untrusted-actor-facing handle table: handles are opaque `i64` indices
/// into `handle_to_name`, with `0` reserved to mean "use the alias/name
/// literally" rather than a prior handle's resolved node. This lets a
/// WASM actor refer to nodes only by small integers it was handed back,
/// never by name. Grounded on
/// `pylib-v1/ailets/actor_runtime/node_dagops.py::NodeDagops`.
pub struct DagOpsHandle {
    env: Arc<Environment>,
    node_name: String,
    handle_to_name: Vec<String>,
}

impl DagOpsHandle {
    pub fn new(env: Arc<Environment>, node_name: String) -> Self {
        Self {
            env,
            node_name,
            handle_to_name: vec!["no-node-id-0".to_string()],
        }
    }

    pub fn add_value_node(&mut self, value: &[u8], explain: Option<String>) -> Result<i64> {
        let node = value_node::add_value_node(&self.env, value, explain)?;
        self.handle_to_name.push(node.name);
        Ok((self.handle_to_name.len() - 1) as i64)
    }

    pub fn open_write_pipe(&mut self, explain: Option<String>) -> Result<i64> {
        let node = value_node::add_open_value_node(
            self.env.dag(),
            self.env.piper(),
            self.env.queue(),
            explain,
        )?;
        self.handle_to_name.push(node.name);
        Ok((self.handle_to_name.len() - 1) as i64)
    }

    fn resolve_handle(&self, alias: &str, handle: i64) -> Result<String> {
        if handle == 0 {
            return Ok(alias.to_string());
        }
        self.handle_to_name
            .get(handle as usize)
            .cloned()
            .ok_or(ExecutionError::InvalidHandleIndex(handle as usize))
    }

    pub fn alias(&mut self, alias: &str, node_name: Option<&str>) -> Result<()> {
        self.env.dag().alias(alias, node_name)
    }

    /// `v2_alias` in the original: resolves `node_handle` to a name,
    /// aliases it, and returns a fresh handle for the alias itself.
    pub fn alias_handle(&mut self, alias: &str, node_handle: i64) -> Result<i64> {
        let node_name = self.resolve_handle(alias, node_handle)?;
        self.env.dag().alias(alias, Some(&node_name))?;
        self.handle_to_name.push(alias.to_string());
        Ok((self.handle_to_name.len() - 1) as i64)
    }

    pub fn detach_from_alias(&mut self, alias: &str) -> Result<()> {
        self.env.dag().detach_from_alias(alias).map(|_| ())
    }

    pub fn instantiate_with_deps(
        &mut self,
        nodereg: &dyn NodeRegistry,
        target: &str,
        aliases: &HashMap<String, String>,
    ) -> Result<i64> {
        let name = flow::instantiate_with_deps(self.env.dag(), nodereg, target, aliases)?;
        self.handle_to_name.push(name);
        Ok((self.handle_to_name.len() - 1) as i64)
    }

    /// Resolves a map of `alias -> handle` (handle `0` meaning "use the
    /// alias name itself") down to `alias -> name`, then instantiates.
    pub fn instantiate_with_deps_v2(
        &mut self,
        nodereg: &dyn NodeRegistry,
        target: &str,
        aliases: &HashMap<String, i64>,
    ) -> Result<i64> {
        let mut name_aliases = HashMap::new();
        for (alias, handle) in aliases {
            name_aliases.insert(alias.clone(), self.resolve_handle(alias, *handle)?);
        }
        self.instantiate_with_deps(nodereg, target, &name_aliases)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_value_node_yields_nonzero_handle() {
        let env = Arc::new(Environment::new());
        let mut dagops = DagOpsHandle::new(env, "caller".to_string());
        let h = dagops.add_value_node(b"x", None).unwrap();
        assert!(h > 0);
    }

    #[test]
    fn handle_zero_resolves_literally() {
        let env = Arc::new(Environment::new());
        let dagops = DagOpsHandle::new(env, "caller".to_string());
        assert_eq!(dagops.resolve_handle("literal-name", 0).unwrap(), "literal-name");
    }

    #[test]
    fn invalid_handle_errors() {
        let env = Arc::new(Environment::new());
        let dagops = DagOpsHandle::new(env, "caller".to_string());
        assert!(dagops.resolve_handle("x", 99).is_err());
    }
}
