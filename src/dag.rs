use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use daggy::petgraph::algo::toposort;
use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{ExecutionError, Result};
use crate::node::{to_basename, ActorFn, Dependency, Node};
use crate::seqno::Seqno;

/// Node/alias storage and dependency-graph planning. Pipes and execution
/// live elsewhere (`pipe.rs`, `scheduler.rs`) — the DAG only ever grows
/// (invariant: nodes are never removed, see spec.md §3).
pub struct Dag {
    seq: Arc<Seqno>,
    nodes: Mutex<HashMap<String, Node>>,
    aliases: Mutex<HashMap<String, Vec<String>>>,
}

impl Dag {
    pub fn new(seq: Arc<Seqno>) -> Self {
        Self {
            seq,
            nodes: Mutex::new(HashMap::new()),
            aliases: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_next_name(&self, base: &str) -> String {
        format!("{}.{}", to_basename(base), self.seq.next())
    }

    pub fn add_node(
        &self,
        base: &str,
        func: ActorFn,
        deps: Vec<Dependency>,
        explain: Option<String>,
    ) -> Node {
        let name = self.get_next_name(base);
        self.insert_node(name, func, deps, explain)
    }

    /// Used when the name must be decided before the node is registered —
    /// e.g. an open value node whose pipe path is derived from the name
    /// before the node exists (see `value_node.rs`).
    pub fn insert_node(
        &self,
        name: String,
        func: ActorFn,
        deps: Vec<Dependency>,
        explain: Option<String>,
    ) -> Node {
        let node = Node {
            name: name.clone(),
            func,
            dependencies: deps,
            explain,
        };
        self.nodes.lock().insert(name, node.clone());
        node
    }

    /// Replace a node's body in place. Used by value-node construction,
    /// which must register the node before it can create the node's own
    /// backing pipe (the pipe path is derived from the node's name), then
    /// swap in a func that closes over that pipe. See `value_node.rs`.
    pub fn set_func(&self, name: &str, func: ActorFn) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| ExecutionError::NodeNotFound(name.to_string()))?;
        node.func = func;
        Ok(())
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.lock().contains_key(name) || self.aliases.lock().contains_key(name)
    }

    fn resolve_singleton_alias(&self, name: &str) -> String {
        let aliases = self.aliases.lock();
        if let Some(members) = aliases.get(name) {
            if members.len() == 1 {
                return members[0].clone();
            }
        }
        name.to_string()
    }

    pub fn get_node(&self, name: &str) -> Result<Node> {
        let resolved = self.resolve_singleton_alias(name);
        self.nodes
            .lock()
            .get(&resolved)
            .cloned()
            .ok_or_else(|| ExecutionError::NodeNotFound(resolved))
    }

    pub fn get_node_names(&self) -> Vec<String> {
        self.nodes.lock().keys().cloned().collect()
    }

    /// Append-only: extends the alias's member list if `target` is an
    /// alias, otherwise appends to the node's dependency list.
    pub fn depend(&self, target: &str, deps: Vec<Dependency>) -> Result<()> {
        {
            let mut aliases = self.aliases.lock();
            if let Some(members) = aliases.get_mut(target) {
                members.extend(deps.into_iter().map(|d| d.source));
                return Ok(());
            }
        }
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(target)
            .ok_or_else(|| ExecutionError::NodeNotFound(target.to_string()))?;
        node.dependencies.extend(deps);
        Ok(())
    }

    pub fn alias(&self, alias_name: &str, node_name: Option<&str>) -> Result<()> {
        match node_name {
            None => {
                self.aliases
                    .lock()
                    .entry(alias_name.to_string())
                    .or_default();
                Ok(())
            }
            Some(n) => {
                if !self.nodes.lock().contains_key(n) {
                    return Err(ExecutionError::NodeNotFound(n.to_string()));
                }
                self.aliases
                    .lock()
                    .entry(alias_name.to_string())
                    .or_default()
                    .push(n.to_string());
                Ok(())
            }
        }
    }

    /// Snapshot `alias`'s current members into a new frozen alias and
    /// rewrite all present dependencies referencing `alias` to the new
    /// one. Nodes created after this call that still reference `alias`
    /// keep seeing the live (possibly still-growing) member list.
    pub fn detach_from_alias(&self, alias: &str) -> Result<String> {
        let mut aliases = self.aliases.lock();
        let members = aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| ExecutionError::AliasNotFound(alias.to_string()))?;
        let frozen_name = format!("{}.{alias}", self.get_next_name("defunc"));
        aliases.insert(frozen_name.clone(), members);
        drop(aliases);

        let mut nodes = self.nodes.lock();
        for node in nodes.values_mut() {
            for dep in &mut node.dependencies {
                if dep.source == alias {
                    dep.source = frozen_name.clone();
                }
            }
        }
        Ok(frozen_name)
    }

    /// Dependencies of `name`, with alias sources expanded transitively
    /// and de-duplicated by `(source, name, slot)`.
    pub fn iter_deps(&self, name: &str) -> Result<Vec<Dependency>> {
        let node = self.get_node(name)?;
        let aliases = self.aliases.lock();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for dep in &node.dependencies {
            if aliases.contains_key(&dep.source) {
                let mut visited = HashSet::new();
                let mut expanded = Vec::new();
                expand_alias(&dep.source, &aliases, &mut visited, &mut expanded);
                for real in expanded {
                    let key = (real.clone(), dep.name.clone(), dep.slot.clone());
                    if seen.insert(key) {
                        out.push(Dependency {
                            source: real,
                            name: dep.name.clone(),
                            slot: dep.slot.clone(),
                            schema: dep.schema.clone(),
                        });
                    }
                }
            } else {
                let key = (dep.source.clone(), dep.name.clone(), dep.slot.clone());
                if seen.insert(key) {
                    out.push(dep.clone());
                }
            }
        }
        Ok(out)
    }

    /// Commutative digest over node names, used by the scheduler to
    /// cheaply detect that the graph grew.
    pub fn hash_of_node_names(&self) -> u64 {
        let mut names: Vec<String> = self.nodes.lock().keys().cloned().collect();
        names.sort();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        names.hash(&mut hasher);
        hasher.finish()
    }

    fn collect_ancestors(&self, target: &str, seen: &mut HashSet<String>) -> Result<Vec<String>> {
        if !seen.insert(target.to_string()) {
            return Ok(Vec::new());
        }
        let mut out = vec![target.to_string()];
        for dep in self.iter_deps(target)? {
            out.extend(self.collect_ancestors(&dep.source, seen)?);
        }
        Ok(out)
    }

    /// Classical DFS topological sort of `target`'s ancestors. Cycle
    /// detection is delegated to `daggy::Dag::add_edge`, which refuses
    /// any edge that would close a cycle — the same mechanism dozer-core
    /// relies on when building its execution graph.
    pub fn plan(&self, target: &str) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let ancestors = self.collect_ancestors(target, &mut seen)?;

        let mut graph: daggy::Dag<String, ()> = daggy::Dag::new();
        let mut index_of = HashMap::new();
        for name in &ancestors {
            index_of.insert(name.clone(), graph.add_node(name.clone()));
        }
        for name in &ancestors {
            for dep in self.iter_deps(name)? {
                if let (Some(&from), Some(&to)) =
                    (index_of.get(&dep.source), index_of.get(name))
                {
                    graph.add_edge(from, to, ()).map_err(|_| {
                        ExecutionError::Cycle(format!("{} -> {}", dep.source, name))
                    })?;
                }
            }
        }

        let order = toposort(graph.graph(), None).map_err(|cyc| {
            ExecutionError::Cycle(format!("cycle through {:?}", graph.graph()[cyc.node_id()]))
        })?;
        debug!(target, n = order.len(), "dag: planned");
        Ok(order.into_iter().map(|idx| graph.graph()[idx].clone()).collect())
    }
}

fn expand_alias(
    name: &str,
    aliases: &HashMap<String, Vec<String>>,
    visited: &mut HashSet<String>,
    out: &mut Vec<String>,
) {
    if !visited.insert(name.to_string()) {
        return; // cycle in alias-of-alias chain: ignore, per spec.md §3
    }
    match aliases.get(name) {
        Some(members) => {
            for m in members {
                expand_alias(m, aliases, visited, out);
            }
        }
        None => out.push(name.to_string()),
    }
}
