use std::collections::{HashMap, HashSet};

use crate::dag::Dag;
use crate::errors::{ExecutionError, Result};
use crate::node::Dependency;
use crate::registry::NodeRegistry;

/// Two-pass DFS flow builder: first instantiates `target` and every
/// template it transitively needs (DFS, cycle-checked via a `visiting`
/// set), then wires up every created node's dependencies once all names
/// are known. Splitting into two passes lets a node depend on a sibling
/// that's only instantiated later in the same call. Grounded on
/// `pylib-v1/ailets/cons/flow_builder.py::instantiate_with_deps`.
pub fn instantiate_with_deps(
    dag: &Dag,
    nodereg: &dyn NodeRegistry,
    target: &str,
    aliases: &HashMap<String, String>,
) -> Result<String> {
    let mut target = target.to_string();
    if !nodereg.has_node(&target) && nodereg.has_plugin(&target) {
        target = nodereg
            .get_plugin(&target)?
            .last()
            .cloned()
            .ok_or_else(|| ExecutionError::RegistryMiss(target.clone()))?;
    }

    let mut resolve = aliases.clone();
    let mut created = Vec::new();
    let mut visiting = HashSet::new();

    create_node_recursive(dag, nodereg, &target, &mut resolve, &mut created, &mut visiting)?;

    for node_name in &created {
        let desc = nodereg.get_node(node_name)?;
        let mut deps = Vec::new();
        for dep in &desc.inputs {
            let mut source = resolve.get(&dep.source).cloned().unwrap_or_else(|| dep.source.clone());
            if source != dep.source {
                source = resolve.get(&source).cloned().unwrap_or(source);
            }
            deps.push(Dependency {
                source,
                name: dep.name.clone(),
                slot: dep.slot.clone(),
                schema: dep.schema.clone(),
            });
        }
        let resolved_name = resolve
            .get(node_name)
            .cloned()
            .ok_or_else(|| ExecutionError::RegistryMiss(node_name.clone()))?;
        dag.depend(&resolved_name, deps)?;
    }

    resolve
        .get(&target)
        .cloned()
        .ok_or_else(|| ExecutionError::RegistryMiss(target))
}

fn create_node_recursive(
    dag: &Dag,
    nodereg: &dyn NodeRegistry,
    node_name: &str,
    resolve: &mut HashMap<String, String>,
    created: &mut Vec<String>,
    visiting: &mut HashSet<String>,
) -> Result<()> {
    let node_name = resolve
        .get(node_name)
        .cloned()
        .unwrap_or_else(|| node_name.to_string());

    if dag.has_node(&node_name) {
        return Ok(());
    }
    if visiting.contains(&node_name) {
        return Err(ExecutionError::Cycle(node_name));
    }
    visiting.insert(node_name.clone());

    let desc = nodereg
        .get_node(&node_name)
        .map_err(|_| ExecutionError::RegistryMiss(node_name.clone()))?;
    for dep in &desc.inputs {
        create_node_recursive(dag, nodereg, &dep.source, resolve, created, visiting)?;
    }

    let node = dag.add_node(&node_name, desc.func.clone(), vec![], None);
    resolve.insert(node_name.clone(), node.name.clone());
    created.push(node_name.clone());

    visiting.remove(&node_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ActorFn;
    use crate::registry::{InMemoryRegistry, NodeDescriptor};
    use crate::seqno::Seqno;
    use std::sync::Arc;

    fn noop() -> ActorFn {
        Arc::new(|_rt| Ok(()))
    }

    #[test]
    fn instantiates_transitive_deps() {
        let dag = Dag::new(Arc::new(Seqno::new()));
        let mut reg = InMemoryRegistry::new();
        reg.register_node(NodeDescriptor {
            name: "source".to_string(),
            inputs: vec![],
            func: noop(),
        });
        reg.register_node(NodeDescriptor {
            name: "sink".to_string(),
            inputs: vec![Dependency::new("source", "in", "")],
            func: noop(),
        });

        let name = instantiate_with_deps(&dag, &reg, "sink", &HashMap::new()).unwrap();
        let deps = dag.iter_deps(&name).unwrap();
        assert_eq!(deps.len(), 1);
        assert!(dag.has_node(&deps[0].source));
    }

    #[test]
    fn detects_cycle() {
        let dag = Dag::new(Arc::new(Seqno::new()));
        let mut reg = InMemoryRegistry::new();
        reg.register_node(NodeDescriptor {
            name: "a".to_string(),
            inputs: vec![Dependency::new("b", "in", "")],
            func: noop(),
        });
        reg.register_node(NodeDescriptor {
            name: "b".to_string(),
            inputs: vec![Dependency::new("a", "in", "")],
            func: noop(),
        });

        assert!(instantiate_with_deps(&dag, &reg, "a", &HashMap::new()).is_err());
    }
}
