// src/deps.rs
//
// =============================================================================
// TDLC: DEPENDENCY RESOLVER (v 0.1 )
// =============================================================================
//
// Closes the requested builds/tests under their `: dep, ...` lists and orders
// them so that every prerequisite comes first.
//
// Responsibilities:
// 1. Dereference dependency lists (they are lazy references).
// 2. Build the DAG (edges run prerequisite -> dependent).
// 3. Topologically sort it, or name the members of a cycle.

use std::collections::HashMap;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Result, TdlError};
use crate::model::{Arena, Runnable, ScopeKind, Value};

#[derive(Debug, Clone)]
pub struct Resolved {
    /// Prerequisites before dependents.
    pub order: Vec<Runnable>,
    /// Direct prerequisites of each runnable, in declaration order.
    pub prerequisites: HashMap<Runnable, Vec<Runnable>>,
}

impl Resolved {
    pub fn prerequisites_of(&self, r: Runnable) -> &[Runnable] {
        self.prerequisites.get(&r).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub fn runnable_name(arena: &Arena, r: Runnable) -> String {
    arena.get(r.scope()).name().to_string()
}

/// Direct prerequisites of one build or test.
fn direct_deps(arena: &Arena, r: Runnable) -> Result<Vec<Runnable>> {
    let ScopeKind::Task(info) = &arena.get(r.scope()).kind else {
        return Ok(Vec::new());
    };
    info.deps
        .iter()
        .map(|dep| match arena.deref(dep)? {
            Value::Runnable(d @ (Runnable::Build(_) | Runnable::Test(_))) => Ok(d),
            other => Err(TdlError::eval(
                format!(
                    "`{}` depends on a {}; only builds and tests can be prerequisites",
                    info.name,
                    other.kind_name()
                ),
                dep.location(),
            )),
        })
        .collect()
}

pub fn resolve(arena: &Arena, requested: &[Runnable]) -> Result<Resolved> {
    let mut graph: DiGraph<Runnable, ()> = DiGraph::new();
    let mut index: HashMap<Runnable, NodeIndex> = HashMap::new();
    let mut prerequisites = HashMap::new();
    let mut pending: Vec<Runnable> = Vec::new();

    for &r in requested {
        if let std::collections::hash_map::Entry::Vacant(slot) = index.entry(r) {
            slot.insert(graph.add_node(r));
            pending.push(r);
        }
    }

    let mut cursor = 0;
    while cursor < pending.len() {
        let r = pending[cursor];
        cursor += 1;
        let deps = direct_deps(arena, r)?;
        for &d in &deps {
            let d_idx = *index.entry(d).or_insert_with(|| {
                pending.push(d);
                graph.add_node(d)
            });
            graph.update_edge(d_idx, index[&r], ());
        }
        prerequisites.insert(r, deps);
    }

    let order = match toposort(&graph, None) {
        Ok(order) => order.into_iter().map(|i| graph[i]).collect::<Vec<_>>(),
        Err(cycle) => {
            let culprit = cycle.node_id();
            let members = tarjan_scc(&graph)
                .into_iter()
                .find(|scc| scc.contains(&culprit))
                .unwrap_or_else(|| vec![culprit]);
            let mut names: Vec<String> = members
                .iter()
                .map(|&i| runnable_name(arena, graph[i]))
                .collect();
            names.sort();
            if let Some(first) = names.first().cloned() {
                names.push(first);
            }
            return Err(TdlError::DependencyCycle { members: names });
        }
    };

    log::debug!(
        "dependency closure: {} requested, {} total",
        requested.len(),
        order.len()
    );
    Ok(Resolved {
        order,
        prerequisites,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Location;
    use crate::model::{Reference, ScopeId, TaskInfo, TaskKind};

    fn loc() -> Location {
        Location::new("deps.tdl", 1)
    }

    /// Defines a test in the global scope depending on `deps` by name.
    fn task(arena: &mut Arena, g: ScopeId, name: &str, deps: &[&str]) -> Runnable {
        let deps = deps
            .iter()
            .map(|d| {
                Value::Ref(Reference {
                    path: d.to_string(),
                    chain: vec![g],
                    loc: loc(),
                })
            })
            .collect();
        let kind = ScopeKind::Task(TaskInfo {
            kind: TaskKind::Test,
            name: name.into(),
            deps,
        });
        let s = arena.create(kind, vec![g], loc());
        let r = Runnable::Test(s);
        arena
            .define_constant(g, name, Value::Runnable(r), &loc())
            .unwrap();
        r
    }

    fn names(arena: &Arena, order: &[Runnable]) -> Vec<String> {
        order.iter().map(|&r| runnable_name(arena, r)).collect()
    }

    #[test]
    fn closure_orders_prerequisites_first() {
        let mut arena = Arena::new();
        let g = arena.create_global(loc());
        let c = task(&mut arena, g, "C", &[]);
        let b = task(&mut arena, g, "B", &["C"]);
        let a = task(&mut arena, g, "A", &["B"]);

        let resolved = resolve(&arena, &[a]).unwrap();
        assert_eq!(names(&arena, &resolved.order), vec!["C", "B", "A"]);
        assert_eq!(resolved.prerequisites_of(a), &[b]);
        assert_eq!(resolved.prerequisites_of(b), &[c]);

        // Resolving the closure again changes nothing.
        let again = resolve(&arena, &resolved.order).unwrap();
        assert_eq!(names(&arena, &again.order), vec!["C", "B", "A"]);
    }

    #[test]
    fn shared_prerequisites_appear_once() {
        let mut arena = Arena::new();
        let g = arena.create_global(loc());
        task(&mut arena, g, "base", &[]);
        let x = task(&mut arena, g, "x", &["base"]);
        let y = task(&mut arena, g, "y", &["base"]);
        let resolved = resolve(&arena, &[x, y]).unwrap();
        let order = names(&arena, &resolved.order);
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], "base");
    }

    #[test]
    fn cycles_are_reported_with_their_members() {
        let mut arena = Arena::new();
        let g = arena.create_global(loc());
        let a = task(&mut arena, g, "A", &["B"]);
        task(&mut arena, g, "B", &["A"]);
        let err = resolve(&arena, &[a]).unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle: A -> B -> A");
    }

    #[test]
    fn non_runnable_prerequisite_is_an_error() {
        let mut arena = Arena::new();
        let g = arena.create_global(loc());
        arena
            .define_variable(g, "notatask", Value::number(3.0), &loc())
            .unwrap();
        let a = task(&mut arena, g, "A", &["notatask"]);
        assert!(resolve(&arena, &[a]).is_err());
    }
}
