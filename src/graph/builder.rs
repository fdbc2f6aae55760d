//! Graph construction from a loaded catalog.
//!
//! The builder creates one unit per resource and one per distinct discovery
//! query, wires edges from attribute references and explicit dependencies,
//! and rejects cyclic graphs before anything executes.

use std::collections::HashMap;
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{GraphError, Result, StackforgeError};

use super::{Graph, UnitNode, UnitPayload};

/// Traversal colors for cycle detection.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Builder for dependency graphs.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the dependency graph for a catalog.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnresolvedReference`] if an attribute reference
    /// or explicit dependency names a resource not in the catalog, and
    /// [`GraphError::CycleDetected`] if the declared dependencies form a
    /// cycle. Both are fatal before any side effect.
    pub fn build(&self, catalog: &Catalog) -> Result<Graph> {
        let mut nodes: Vec<UnitNode> = Vec::new();
        let mut index_by_id: HashMap<String, usize> = HashMap::new();

        for resource in &catalog.resources {
            index_by_id.insert(resource.id.clone(), nodes.len());
            nodes.push(UnitNode {
                id: resource.id.clone(),
                payload: UnitPayload::Resource(resource.clone()),
            });
        }

        for query in catalog.discovery_queries() {
            let signature = query.signature();
            index_by_id.entry(signature.clone()).or_insert_with(|| {
                nodes.push(UnitNode {
                    id: signature,
                    payload: UnitPayload::Discovery(query.clone()),
                });
                nodes.len() - 1
            });
        }

        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

        for resource in &catalog.resources {
            let unit = index_by_id[&resource.id];

            for target in resource.referenced_resources() {
                let Some(&dep) = index_by_id.get(target) else {
                    return Err(StackforgeError::Graph(GraphError::UnresolvedReference {
                        from: resource.id.clone(),
                        to: target.to_string(),
                    }));
                };
                push_edge(&mut dependencies[unit], dep);
            }

            for query in resource.discovery_queries() {
                let dep = index_by_id[&query.signature()];
                push_edge(&mut dependencies[unit], dep);
            }

            for target in &resource.explicit_dependencies {
                let Some(&dep) = index_by_id.get(target.as_str()) else {
                    return Err(StackforgeError::Graph(GraphError::UnresolvedReference {
                        from: resource.id.clone(),
                        to: target.clone(),
                    }));
                };
                push_edge(&mut dependencies[unit], dep);
            }
        }

        Self::check_acyclic(&nodes, &dependencies)?;

        debug!(
            "Built graph with {} units ({} discovery)",
            nodes.len(),
            nodes.iter().filter(|n| n.is_discovery()).count()
        );

        Ok(Graph::new(nodes, dependencies))
    }

    /// Runs depth-first tri-color cycle detection.
    ///
    /// On a cycle, the reported path lists the units along the cycle in edge
    /// order, with the entry unit repeated at the end.
    fn check_acyclic(nodes: &[UnitNode], dependencies: &[Vec<usize>]) -> Result<()> {
        let mut colors = vec![Color::White; nodes.len()];
        let mut stack: Vec<usize> = Vec::new();

        for start in 0..nodes.len() {
            if colors[start] == Color::White
                && let Some(path) = Self::visit(start, dependencies, &mut colors, &mut stack)
            {
                return Err(StackforgeError::Graph(GraphError::CycleDetected {
                    path: path.into_iter().map(|i| nodes[i].id.clone()).collect(),
                }));
            }
        }

        Ok(())
    }

    /// Visits one unit; returns the cycle path if the subtree contains one.
    fn visit(
        unit: usize,
        dependencies: &[Vec<usize>],
        colors: &mut [Color],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colors[unit] = Color::Gray;
        stack.push(unit);

        for &dep in &dependencies[unit] {
            match colors[dep] {
                Color::Gray => {
                    // Back edge: the cycle is the stack suffix from `dep`.
                    let entry = stack.iter().position(|&u| u == dep).unwrap_or(0);
                    let mut path: Vec<usize> = stack[entry..].to_vec();
                    path.push(dep);
                    return Some(path);
                }
                Color::White => {
                    if let Some(path) = Self::visit(dep, dependencies, colors, stack) {
                        return Some(path);
                    }
                }
                Color::Black => {}
            }
        }

        stack.pop();
        colors[unit] = Color::Black;
        None
    }
}

/// Adds an edge endpoint, keeping the list free of duplicates.
fn push_edge(edges: &mut Vec<usize>, dep: usize) {
    if !edges.contains(&dep) {
        edges.push(dep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogParser;

    fn build(yaml: &str) -> Result<Graph> {
        let catalog = CatalogParser::new().parse_yaml(yaml, None).unwrap();
        GraphBuilder::new().build(&catalog)
    }

    /// The catalog from the cluster provisioning scenario: a role, a policy
    /// attachment on it, a cluster behind both, and a node group behind the
    /// cluster plus its own attachments.
    const CLUSTER_CATALOG: &str = r#"
project:
  name: analytics
resources:
  - id: cluster_role
    kind: role
    attributes:
      assume_policy: clusters.provider.example
  - id: cluster_policy
    kind: policy_attachment
    attributes:
      role: "${cluster_role.name}"
      policy_arn: arn:provider:policy/cluster
  - id: cluster
    kind: cluster
    attributes:
      role_arn: "${cluster_role.arn}"
      subnet_ids: "${subnets:vpc-1}"
    depends_on: [cluster_policy]
  - id: node_role
    kind: role
    attributes:
      assume_policy: nodes.provider.example
  - id: worker_policy
    kind: policy_attachment
    attributes:
      role: "${node_role.name}"
      policy_arn: arn:provider:policy/worker
  - id: cni_policy
    kind: policy_attachment
    attributes:
      role: "${node_role.name}"
      policy_arn: arn:provider:policy/cni
  - id: registry_policy
    kind: policy_attachment
    attributes:
      role: "${node_role.name}"
      policy_arn: arn:provider:policy/registry
  - id: workers
    kind: node_group
    attributes:
      cluster: "${cluster.name}"
      role_arn: "${node_role.arn}"
      subnet_ids: "${subnets:vpc-1}"
      scaling:
        min: 1
        desired: 2
        max: 4
    depends_on: [worker_policy, cni_policy, registry_policy]
"#;

    #[test]
    fn test_build_cluster_catalog() {
        let graph = build(CLUSTER_CATALOG).unwrap();

        // 8 resources plus one shared subnets discovery unit.
        assert_eq!(graph.len(), 9);
        assert!(graph.index_of("subnets:vpc-1").is_some());
    }

    #[test]
    fn test_topo_order_respects_edges() {
        let graph = build(CLUSTER_CATALOG).unwrap();
        let order = graph.topo_order();
        assert_eq!(order.len(), graph.len());

        let position: std::collections::HashMap<usize, usize> =
            order.iter().enumerate().map(|(pos, &u)| (u, pos)).collect();

        for (unit, _) in graph.units() {
            for &dep in graph.dependencies_of(unit) {
                assert!(
                    position[&dep] < position[&unit],
                    "unit {} ordered before its dependency {}",
                    graph.unit(unit).id,
                    graph.unit(dep).id
                );
            }
        }
    }

    #[test]
    fn test_scenario_ordering() {
        let graph = build(CLUSTER_CATALOG).unwrap();
        let order = graph.topo_order();
        let pos = |id: &str| {
            let idx = graph.index_of(id).unwrap();
            order.iter().position(|&u| u == idx).unwrap()
        };

        assert!(pos("cluster_role") < pos("cluster_policy"));
        assert!(pos("cluster_policy") < pos("cluster"));
        assert!(pos("cluster") < pos("workers"));
        assert!(pos("subnets:vpc-1") < pos("cluster"));
    }

    #[test]
    fn test_discovery_has_no_dependencies() {
        let graph = build(CLUSTER_CATALOG).unwrap();
        let discovery = graph.index_of("subnets:vpc-1").unwrap();
        assert!(graph.dependencies_of(discovery).is_empty());
    }

    #[test]
    fn test_shared_discovery_unit_is_deduplicated() {
        let graph = build(CLUSTER_CATALOG).unwrap();
        let discovery_units = graph.units().filter(|(_, n)| n.is_discovery()).count();
        assert_eq!(discovery_units, 1);

        let discovery = graph.index_of("subnets:vpc-1").unwrap();
        let mut dependents: Vec<&str> = graph
            .dependents_of(discovery)
            .iter()
            .map(|&u| graph.unit(u).id.as_str())
            .collect();
        dependents.sort_unstable();
        assert_eq!(dependents, vec!["cluster", "workers"]);
    }

    #[test]
    fn test_transitive_dependents_of_attachment() {
        let graph = build(CLUSTER_CATALOG).unwrap();
        let attachment = graph.index_of("cluster_policy").unwrap();

        let reachable: Vec<&str> = graph
            .transitive_dependents(attachment)
            .into_iter()
            .map(|u| graph.unit(u).id.as_str())
            .collect();

        assert_eq!(reachable, vec!["cluster", "workers"]);
    }

    #[test]
    fn test_resource_payload_accessor() {
        let graph = build(CLUSTER_CATALOG).unwrap();

        let cluster = graph.index_of("cluster").unwrap();
        assert_eq!(graph.unit(cluster).resource().unwrap().id, "cluster");

        let discovery = graph.index_of("subnets:vpc-1").unwrap();
        assert!(graph.unit(discovery).resource().is_none());
    }

    #[test]
    fn test_unresolved_reference() {
        let err = build(
            r#"
project:
  name: analytics
resources:
  - id: attach
    kind: policy_attachment
    attributes:
      role: "${ghost.name}"
      policy_arn: arn:provider:policy/x
"#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            StackforgeError::Graph(GraphError::UnresolvedReference { from, to })
                if from == "attach" && to == "ghost"
        ));
    }

    #[test]
    fn test_unresolved_explicit_dependency() {
        let err = build(
            r"
project:
  name: analytics
resources:
  - id: cluster_role
    kind: role
    attributes:
      assume_policy: clusters.provider.example
    depends_on: [missing]
",
        )
        .unwrap_err();

        assert!(matches!(
            err,
            StackforgeError::Graph(GraphError::UnresolvedReference { to, .. }) if to == "missing"
        ));
    }

    #[test]
    fn test_cycle_detected_with_valid_path() {
        let err = build(
            r"
project:
  name: analytics
resources:
  - id: a
    kind: role
    attributes:
      assume_policy: x
    depends_on: [c]
  - id: b
    kind: role
    attributes:
      assume_policy: x
    depends_on: [a]
  - id: c
    kind: role
    attributes:
      assume_policy: x
    depends_on: [b]
",
        )
        .unwrap_err();

        let StackforgeError::Graph(GraphError::CycleDetected { path }) = err else {
            panic!("expected cycle error, got {err}");
        };

        // The path closes on itself and each hop is a declared dependency.
        assert!(path.len() >= 4);
        assert_eq!(path.first(), path.last());
        let deps: std::collections::HashMap<&str, &str> =
            [("a", "c"), ("b", "a"), ("c", "b")].into();
        for pair in path.windows(2) {
            assert_eq!(deps[pair[0].as_str()], pair[1].as_str());
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = build(
            r"
project:
  name: analytics
resources:
  - id: a
    kind: role
    attributes:
      assume_policy: x
    depends_on: [a]
",
        )
        .unwrap_err();

        assert!(matches!(
            err,
            StackforgeError::Graph(GraphError::CycleDetected { .. })
        ));
    }
}
