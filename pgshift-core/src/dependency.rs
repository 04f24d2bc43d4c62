//! Foreign-key dependency graph between tables, ordered with Kahn's algorithm.
//!
//! Used by the planner so referenced tables are created before the tables
//! that point at them, and dropped after.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::model::Table;

/// Result of a topological sort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopoOrder {
    /// Tables whose dependencies come first.
    pub ordered: Vec<String>,
    /// Tables caught in a foreign-key cycle, in name order.
    pub cyclic: Vec<String>,
}

/// A directed graph of table -> referenced tables, restricted to one set of tables.
pub struct DependencyGraph {
    /// table -> tables it references
    edges: BTreeMap<String, BTreeSet<String>>,
    /// table -> tables that reference it
    reverse_edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build the graph. References to tables outside `tables` and
    /// self-references are ignored.
    pub fn build<'a>(tables: impl IntoIterator<Item = &'a Table>) -> Self {
        let tables: Vec<&Table> = tables.into_iter().collect();
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut reverse_edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for t in &tables {
            edges.entry(t.name.clone()).or_default();
            reverse_edges.entry(t.name.clone()).or_default();
        }

        for t in &tables {
            for referenced in t.referenced_tables() {
                if !edges.contains_key(referenced) {
                    continue;
                }
                if let Some(deps) = edges.get_mut(&t.name) {
                    deps.insert(referenced.to_string());
                }
                if let Some(dependents) = reverse_edges.get_mut(referenced) {
                    dependents.insert(t.name.clone());
                }
            }
        }

        DependencyGraph {
            edges,
            reverse_edges,
        }
    }

    /// Produce a dependency-first order. Ties are broken by table name.
    ///
    /// Tables that cannot be ordered because of a cycle are reported
    /// separately instead of failing the sort.
    pub fn topological_sort(&self) -> TopoOrder {
        let mut in_degree: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(t, deps)| (t.as_str(), deps.len()))
            .collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(t, _)| *t)
            .collect();

        let mut ordered = Vec::new();
        while let Some(node) = queue.pop_front() {
            ordered.push(node.to_string());
            if let Some(dependents) = self.reverse_edges.get(node) {
                for dep in dependents {
                    if let Some(deg) = in_degree.get_mut(dep.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(dep.as_str());
                        }
                    }
                }
            }
        }

        let cyclic: Vec<String> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(t, _)| t.to_string())
            .collect();

        if !cyclic.is_empty() {
            log::warn!(
                "Foreign-key cycle between tables; tables={}",
                cyclic.join(", ")
            );
        }

        TopoOrder { ordered, cyclic }
    }
}
