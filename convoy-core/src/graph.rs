// Dependency graph accessor: local edges for a repository population.

use std::collections::{HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::store::MigrationStore;

/// Local dependency edges for a set of repositories, keyed by full name.
///
/// Only edges whose target exists in the ledger are kept. Targets may fall
/// outside the population the graph was loaded for; callers decide whether
/// such targets count.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    adjacency: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Load the local edges of `full_names` from the store.
    pub async fn load(
        store: &dyn MigrationStore,
        full_names: &[String],
    ) -> crate::error::Result<Self> {
        let edges = store.local_dependencies(full_names).await?;
        Ok(Self::from_edges(edges))
    }

    /// Build from an adjacency map. Self-references are dropped.
    pub fn from_edges<I, T>(edges: I) -> Self
    where
        I: IntoIterator<Item = (String, T)>,
        T: IntoIterator<Item = String>,
    {
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for (source, targets) in edges {
            let entry = adjacency.entry(source.clone()).or_default();
            for target in targets {
                if target != source && !entry.contains(&target) {
                    entry.push(target);
                }
            }
        }
        adjacency.retain(|_, targets| !targets.is_empty());
        Self { adjacency }
    }

    /// Local dependency targets of `full_name`, in detection order.
    pub fn dependencies_of(&self, full_name: &str) -> &[String] {
        self.adjacency.get(full_name).map_or(&[], Vec::as_slice)
    }

    pub fn local_dependency_count(&self, full_name: &str) -> usize {
        self.dependencies_of(full_name).len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum()
    }

    /// Repositories of `population` that sit on a dependency cycle among
    /// themselves.
    pub fn cycle_members(&self, population: &HashSet<&str>) -> HashSet<String> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for &name in population {
            index.insert(name, graph.add_node(name));
        }
        for (source, targets) in &self.adjacency {
            let Some(&from) = index.get(source.as_str()) else {
                continue;
            };
            for target in targets {
                if let Some(&to) = index.get(target.as_str()) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .flatten()
            .map(|idx| graph[idx].to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;
    use crate::types::{DependencyType, DiscoveredRepository, NewDependency};

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        DependencyGraph::from_edges(edges.iter().map(|(source, targets)| {
            (
                (*source).to_string(),
                targets.iter().map(|t| (*t).to_string()).collect::<Vec<_>>(),
            )
        }))
    }

    #[test]
    fn self_loops_are_ignored() {
        let g = graph(&[("a", &["a", "b"]), ("c", &["c"])]);
        assert_eq!(g.dependencies_of("a"), ["b".to_string()]);
        assert!(g.dependencies_of("c").is_empty());
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn cycles_are_detected_within_population() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &["a"])]);
        let all: HashSet<&str> = ["a", "b", "c", "d"].into_iter().collect();
        let members = g.cycle_members(&all);
        assert_eq!(members.len(), 3);
        assert!(!members.contains("d"));

        // Without c in the population the cycle is open.
        let partial: HashSet<&str> = ["a", "b", "d"].into_iter().collect();
        assert!(g.cycle_members(&partial).is_empty());
    }

    #[tokio::test]
    async fn load_keeps_only_local_edges() {
        let store = SqliteStore::in_memory().unwrap();
        let mut app = DiscoveredRepository::new("acme/app");
        app.dependencies = vec![
            NewDependency::new("acme/lib", DependencyType::Submodule),
            NewDependency::new("vendor/sdk", DependencyType::Package),
        ];
        store.upsert_repository(&app).await.unwrap();
        store.upsert_repository(&DiscoveredRepository::new("acme/lib")).await.unwrap();
        store
            .replace_dependencies("acme/app", &app.dependencies)
            .await
            .unwrap();

        let g = DependencyGraph::load(&store, &["acme/app".into(), "acme/lib".into()])
            .await
            .unwrap();
        assert_eq!(g.dependencies_of("acme/app"), ["acme/lib".to_string()]);
        assert_eq!(g.local_dependency_count("acme/lib"), 0);
    }
}
