// Layered greedy topological wave planning.
//
// Planning intentionally casts counts to float for averages.
#![allow(clippy::cast_precision_loss)]

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::graph::DependencyGraph;
use crate::types::Repository;

use super::name_set;

/// An ordered partition of a population into waves.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WavePlan {
    pub waves: Vec<Wave>,
    /// Repositories left over when the wave cap was reached, in discovery order.
    pub unscheduled: Vec<String>,
    /// True iff the wave cap stopped planning early.
    pub truncated: bool,
}

impl WavePlan {
    pub fn scheduled_count(&self) -> usize {
        self.waves.iter().map(|w| w.entries.len()).sum()
    }

    /// Entries placed out of dependency order to break a deadlock.
    pub fn forced_count(&self) -> usize {
        self.waves
            .iter()
            .flat_map(|w| &w.entries)
            .filter(|e| e.is_forced())
            .count()
    }

    /// The wave number holding `full_name`, if scheduled.
    pub fn wave_of(&self, full_name: &str) -> Option<u32> {
        self.waves
            .iter()
            .find(|w| w.entries.iter().any(|e| e.full_name == full_name))
            .map(|w| w.number)
    }
}

/// One wave, with aggregates for operator review.
#[derive(Debug, Clone, Serialize)]
pub struct Wave {
    /// 1-based position in the plan.
    pub number: u32,
    pub entries: Vec<WaveEntry>,
    /// Sum of member sizes; unknown sizes count as zero.
    pub total_size: i64,
    /// Mean member complexity; unknown scores count as zero.
    pub average_complexity: f64,
    /// Local dependency edges leaving members of this wave.
    pub dependency_count: usize,
}

impl Wave {
    fn new(number: u32, entries: Vec<WaveEntry>) -> Self {
        let total_size = entries.iter().map(|e| e.total_size.unwrap_or(0)).sum();
        let complexity: i64 = entries.iter().map(WaveEntry::complexity).sum();
        let average_complexity = if entries.is_empty() {
            0.0
        } else {
            complexity as f64 / entries.len() as f64
        };
        let dependency_count = entries.iter().map(|e| e.dependency_count).sum();
        Self {
            number,
            entries,
            total_size,
            average_complexity,
            dependency_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WaveEntry {
    pub full_name: String,
    pub complexity_score: Option<i64>,
    pub total_size: Option<i64>,
    pub dependency_count: usize,
    /// Set when the entry was force-placed with dependencies still unscheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced: Option<ForcedPlacement>,
}

impl WaveEntry {
    fn new(repo: &Repository, graph: &DependencyGraph, forced: Option<ForcedPlacement>) -> Self {
        Self {
            full_name: repo.full_name.clone(),
            complexity_score: repo.complexity_score,
            total_size: repo.total_size,
            dependency_count: graph.local_dependency_count(&repo.full_name),
            forced,
        }
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_some()
    }

    fn complexity(&self) -> i64 {
        self.complexity_score.unwrap_or(0)
    }
}

/// Why an entry ignores dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForcedPlacement {
    /// Local dependencies in the population not scheduled in an earlier wave.
    pub unsatisfied: Vec<String>,
    /// The repository sits on a dependency cycle within the population.
    pub in_cycle: bool,
}

/// Plan waves over `population` (in discovery order).
///
/// Each round takes every repository whose in-population dependencies are
/// already scheduled, simplest first, up to `wave_size`. A round with no
/// such repository force-places the first `wave_size` remaining ones. Stops
/// after `max_waves` rounds and reports the rest as unscheduled.
pub fn plan_waves(
    population: &[Repository],
    graph: &DependencyGraph,
    wave_size: usize,
    max_waves: usize,
) -> WavePlan {
    let wave_size = wave_size.max(1);
    let members = name_set(population);
    let cycles = graph.cycle_members(&members);

    let mut scheduled: HashSet<&str> = HashSet::with_capacity(population.len());
    let mut remaining: Vec<&Repository> = population.iter().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() && waves.len() < max_waves {
        let mut ready: Vec<&Repository> = remaining
            .iter()
            .copied()
            .filter(|r| unsatisfied(r, graph, &members, &scheduled).is_empty())
            .collect();

        let entries: Vec<WaveEntry> = if ready.is_empty() {
            remaining
                .iter()
                .take(wave_size)
                .map(|r| {
                    let forced = ForcedPlacement {
                        unsatisfied: unsatisfied(r, graph, &members, &scheduled),
                        in_cycle: cycles.contains(&r.full_name),
                    };
                    WaveEntry::new(r, graph, Some(forced))
                })
                .collect()
        } else {
            // Stable: equal scores keep discovery order.
            ready.sort_by_key(|r| r.complexity_score.unwrap_or(0));
            ready.truncate(wave_size);
            ready.iter().map(|r| WaveEntry::new(r, graph, None)).collect()
        };

        for entry in &entries {
            if let Some(repo) = remaining.iter().find(|r| r.full_name == entry.full_name) {
                scheduled.insert(repo.full_name.as_str());
            }
        }
        remaining.retain(|r| !scheduled.contains(r.full_name.as_str()));

        let number = u32::try_from(waves.len() + 1).unwrap_or(u32::MAX);
        waves.push(Wave::new(number, entries));
    }

    let unscheduled: Vec<String> = remaining.iter().map(|r| r.full_name.clone()).collect();
    WavePlan {
        truncated: !unscheduled.is_empty(),
        waves,
        unscheduled,
    }
}

fn unsatisfied(
    repo: &Repository,
    graph: &DependencyGraph,
    members: &HashSet<&str>,
    scheduled: &HashSet<&str>,
) -> Vec<String> {
    graph
        .dependencies_of(&repo.full_name)
        .iter()
        .filter(|d| members.contains(d.as_str()) && !scheduled.contains(d.as_str()))
        .cloned()
        .collect()
}

impl fmt::Display for WavePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for wave in &self.waves {
            writeln!(
                f,
                "wave {}: {} repositories, size {}, avg complexity {:.2}, {} deps",
                wave.number,
                wave.entries.len(),
                wave.total_size,
                wave.average_complexity,
                wave.dependency_count,
            )?;
            for entry in &wave.entries {
                write!(f, "  {} (complexity {})", entry.full_name, entry.complexity())?;
                if let Some(forced) = &entry.forced {
                    write!(f, " [forced")?;
                    if !forced.unsatisfied.is_empty() {
                        write!(f, ", waits on {}", forced.unsatisfied.join(", "))?;
                    }
                    if forced.in_cycle {
                        write!(f, ", cycle")?;
                    }
                    write!(f, "]")?;
                }
                writeln!(f)?;
            }
        }
        if self.truncated {
            writeln!(f, "unscheduled: {}", self.unscheduled.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use chrono::Utc;

    use super::*;
    use crate::status::RepositoryStatus;
    use crate::types::RepositoryId;

    pub(crate) fn repo(id: i64, name: &str, complexity: Option<i64>) -> Repository {
        let now = Utc::now();
        Repository {
            id: RepositoryId(id),
            full_name: name.to_string(),
            organization: crate::types::organization_of(name).to_string(),
            status: RepositoryStatus::Pending,
            batch_id: None,
            complexity_score: complexity,
            total_size: Some(100),
            is_archived: false,
            is_fork: false,
            profile: HashMap::new(),
            rollback_count: 0,
            discovered_at: now,
            updated_at: now,
            migrated_at: None,
        }
    }

    pub(crate) fn graph(edges: &[(&str, &str)]) -> DependencyGraph {
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in edges {
            adjacency
                .entry((*from).to_string())
                .or_default()
                .push((*to).to_string());
        }
        DependencyGraph::from_edges(adjacency)
    }

    fn names(wave: &Wave) -> Vec<&str> {
        wave.entries.iter().map(|e| e.full_name.as_str()).collect()
    }

    #[test]
    fn chain_runs_in_dependency_order() {
        let population = [repo(1, "a", Some(1)), repo(2, "b", Some(1)), repo(3, "c", Some(1))];
        let plan = plan_waves(&population, &graph(&[("a", "b"), ("b", "c")]), 10, 100);

        assert_eq!(plan.waves.len(), 3);
        assert_eq!(names(&plan.waves[0]), ["c"]);
        assert_eq!(names(&plan.waves[1]), ["b"]);
        assert_eq!(names(&plan.waves[2]), ["a"]);
        assert_eq!(plan.waves[2].dependency_count, 1);
        assert!(!plan.truncated);
    }

    #[test]
    fn simplest_first_within_wave() {
        let population = [
            repo(1, "heavy", Some(9)),
            repo(2, "unknown", None),
            repo(3, "light", Some(2)),
            repo(4, "tie", Some(2)),
        ];
        let plan = plan_waves(&population, &DependencyGraph::default(), 3, 100);

        assert_eq!(names(&plan.waves[0]), ["unknown", "light", "tie"]);
        assert_eq!(names(&plan.waves[1]), ["heavy"]);
    }

    #[test]
    fn foreign_dependencies_do_not_block() {
        let population = [repo(1, "app", Some(1))];
        let plan = plan_waves(&population, &graph(&[("app", "elsewhere")]), 10, 100);
        assert_eq!(plan.waves.len(), 1);
        assert!(!plan.waves[0].entries[0].is_forced());
        assert_eq!(plan.waves[0].dependency_count, 1);
    }

    #[test]
    fn cycle_is_broken_by_forced_placement() {
        let population = [repo(1, "a", Some(1)), repo(2, "b", Some(2)), repo(3, "c", Some(3))];
        let g = graph(&[("a", "b"), ("b", "a"), ("c", "a")]);
        let plan = plan_waves(&population, &g, 1, 100);

        assert_eq!(plan.waves.len(), 3);
        let first = &plan.waves[0].entries[0];
        assert_eq!(first.full_name, "a");
        assert_eq!(
            first.forced,
            Some(ForcedPlacement {
                unsatisfied: vec!["b".into()],
                in_cycle: true,
            })
        );
        assert_eq!(names(&plan.waves[1]), ["b"]);
        assert_eq!(names(&plan.waves[2]), ["c"]);
        assert_eq!(plan.forced_count(), 1);
    }

    #[test]
    fn cap_reports_unscheduled() {
        let population: Vec<Repository> = (0..5)
            .map(|i| repo(i, &format!("r{i}"), Some(i)))
            .collect();
        let plan = plan_waves(&population, &DependencyGraph::default(), 1, 3);

        assert_eq!(plan.waves.len(), 3);
        assert!(plan.truncated);
        assert_eq!(plan.unscheduled, ["r3", "r4"]);
    }

    #[test]
    fn empty_population_yields_empty_plan() {
        let plan = plan_waves(&[], &DependencyGraph::default(), 10, 100);
        assert!(plan.waves.is_empty());
        assert!(!plan.truncated);
    }

    #[test]
    fn plan_renders_for_review() {
        let population = [
            repo(1, "acme/app", Some(3)),
            repo(2, "acme/lib", Some(1)),
            repo(3, "acme/ping", Some(2)),
            repo(4, "acme/pong", Some(2)),
        ];
        let g = graph(&[
            ("acme/app", "acme/lib"),
            ("acme/ping", "acme/pong"),
            ("acme/pong", "acme/ping"),
        ]);
        let plan = plan_waves(&population, &g, 2, 100);

        insta::assert_snapshot!(plan.to_string(), @r"
        wave 1: 1 repositories, size 100, avg complexity 1.00, 0 deps
          acme/lib (complexity 1)
        wave 2: 1 repositories, size 100, avg complexity 3.00, 1 deps
          acme/app (complexity 3)
        wave 3: 2 repositories, size 200, avg complexity 2.00, 2 deps
          acme/ping (complexity 2) [forced, waits on acme/pong, cycle]
          acme/pong (complexity 2) [forced, waits on acme/ping, cycle]
        ");
    }
}

#[cfg(test)]
mod proptests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::plan_waves;
    use super::tests::{graph, repo};
    use crate::types::Repository;

    fn fleet() -> impl Strategy<Value = (Vec<Repository>, Vec<(usize, usize)>, usize)> {
        (1usize..30).prop_flat_map(|n| {
            (
                proptest::collection::vec(proptest::option::of(0i64..20), n),
                proptest::collection::vec((0..n, 0..n), 0..n * 2),
                1usize..6,
            )
                .prop_map(move |(scores, edges, wave_size)| {
                    let repos = scores
                        .into_iter()
                        .enumerate()
                        .map(|(i, s)| repo(i as i64, &format!("r{i}"), s))
                        .collect();
                    (repos, edges, wave_size)
                })
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn waves_respect_order_unless_forced((population, edges, wave_size) in fleet()) {
            let named: Vec<(String, String)> = edges
                .iter()
                .map(|(a, b)| (format!("r{a}"), format!("r{b}")))
                .collect();
            let pairs: Vec<(&str, &str)> =
                named.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
            let g = graph(&pairs);
            let plan = plan_waves(&population, &g, wave_size, 100);

            // Every repository lands exactly once; the cap is never hit at this size.
            prop_assert!(!plan.truncated);
            prop_assert_eq!(plan.scheduled_count(), population.len());
            prop_assert!(plan.waves.len() <= 100);

            let mut wave_of: HashMap<&str, u32> = HashMap::new();
            for wave in &plan.waves {
                prop_assert!(!wave.entries.is_empty());
                prop_assert!(wave.entries.len() <= wave_size);
                for entry in &wave.entries {
                    prop_assert!(wave_of.insert(entry.full_name.as_str(), wave.number).is_none());
                }
            }

            for wave in &plan.waves {
                for entry in wave.entries.iter().filter(|e| !e.is_forced()) {
                    for dep in g.dependencies_of(&entry.full_name) {
                        let dep_wave = wave_of[dep.as_str()];
                        prop_assert!(dep_wave < wave.number, "{} in wave {} before {}", entry.full_name, wave.number, dep);
                    }
                }
            }
        }

        #[test]
        fn planning_terminates_under_cap(n in 1usize..300, wave_size in 1usize..3) {
            // A single ring: every round has to force.
            let population: Vec<Repository> =
                (0..n).map(|i| repo(i as i64, &format!("r{i}"), None)).collect();
            let named: Vec<(String, String)> =
                (0..n).map(|i| (format!("r{i}"), format!("r{}", (i + 1) % n))).collect();
            let pairs: Vec<(&str, &str)> =
                named.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
            let plan = plan_waves(&population, &graph(&pairs), wave_size, 100);

            prop_assert!(plan.waves.len() <= 100);
            prop_assert_eq!(plan.scheduled_count() + plan.unscheduled.len(), n);
            // The first round forces `wave_size`; each later round frees one.
            prop_assert_eq!(plan.truncated, n > wave_size + 99);
        }
    }
}
