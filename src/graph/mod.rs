//! Dependency graph over execution units.
//!
//! The graph has one unit per declared resource and one per distinct
//! discovery query implied by attribute references. Edges point from a
//! dependent unit to the units it depends on. The graph is built once per
//! engine invocation, checked acyclic before any side effect, and discarded
//! after the run.

mod builder;

pub use builder::GraphBuilder;

use std::collections::HashMap;

use crate::catalog::{DiscoveryQuery, ResourceSpec};

/// The payload of one execution unit.
#[derive(Debug, Clone)]
pub enum UnitPayload {
    /// A declared resource.
    Resource(ResourceSpec),
    /// A discovery query implied by attribute references.
    Discovery(DiscoveryQuery),
}

/// One node of the dependency graph.
#[derive(Debug, Clone)]
pub struct UnitNode {
    /// Display identifier: the resource id, or the discovery signature.
    pub id: String,
    /// What this unit executes.
    pub payload: UnitPayload,
}

/// A directed acyclic graph of execution units.
#[derive(Debug)]
pub struct Graph {
    /// Unit nodes, in insertion order (resources first, declaration order).
    nodes: Vec<UnitNode>,
    /// `dependencies[i]` holds the indices unit `i` depends on.
    dependencies: Vec<Vec<usize>>,
    /// `dependents[i]` holds the indices that depend on unit `i`.
    dependents: Vec<Vec<usize>>,
    /// Index lookup by unit id.
    index_by_id: HashMap<String, usize>,
}

impl Graph {
    /// Creates a graph from nodes and dependency lists.
    ///
    /// Only [`GraphBuilder`] constructs graphs; it guarantees acyclicity.
    pub(crate) fn new(nodes: Vec<UnitNode>, dependencies: Vec<Vec<usize>>) -> Self {
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (unit, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(unit);
            }
        }

        let index_by_id = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();

        Self {
            nodes,
            dependencies,
            dependents,
            index_by_id,
        }
    }

    /// Returns the number of units.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no units.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the unit at the given index.
    #[must_use]
    pub fn unit(&self, index: usize) -> &UnitNode {
        &self.nodes[index]
    }

    /// Returns all units with their indices.
    pub fn units(&self) -> impl Iterator<Item = (usize, &UnitNode)> {
        self.nodes.iter().enumerate()
    }

    /// Looks up a unit index by id.
    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index_by_id.get(id).copied()
    }

    /// Returns the indices the given unit depends on.
    #[must_use]
    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Returns the indices that depend on the given unit.
    #[must_use]
    pub fn dependents_of(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Produces a topological ordering: every unit appears after all of its
    /// dependencies.
    ///
    /// Ties among units with no relative ordering constraint resolve to the
    /// lowest insertion index, so the order is deterministic for a given
    /// catalog. Units that share no path may execute concurrently; the
    /// returned sequence is one valid serialization.
    #[must_use]
    pub fn topo_order(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: Vec<usize> = (0..self.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(pos) = ready.iter().enumerate().min_by_key(|&(_, &i)| i).map(|(p, _)| p) {
            let unit = ready.swap_remove(pos);
            order.push(unit);
            for &dependent in &self.dependents[unit] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push(dependent);
                }
            }
        }

        debug_assert_eq!(order.len(), self.len());
        order
    }

    /// Returns every unit reachable from the given unit by following
    /// dependent edges, excluding the unit itself.
    #[must_use]
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut visited = vec![false; self.len()];
        let mut stack = vec![index];
        let mut reachable = Vec::new();

        while let Some(unit) = stack.pop() {
            for &dependent in &self.dependents[unit] {
                if !visited[dependent] {
                    visited[dependent] = true;
                    reachable.push(dependent);
                    stack.push(dependent);
                }
            }
        }

        reachable.sort_unstable();
        reachable
    }
}

impl UnitNode {
    /// Returns true if this unit wraps a discovery query.
    #[must_use]
    pub const fn is_discovery(&self) -> bool {
        matches!(self.payload, UnitPayload::Discovery(_))
    }

    /// Returns the wrapped resource spec, if any.
    #[must_use]
    pub const fn resource(&self) -> Option<&ResourceSpec> {
        match &self.payload {
            UnitPayload::Resource(spec) => Some(spec),
            UnitPayload::Discovery(_) => None,
        }
    }
}
