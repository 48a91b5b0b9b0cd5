use serde::Serialize;

use crate::graph::DependencyGraph;
use crate::types::Repository;

/// A ranked low-risk repository for an initial migration wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PilotCandidate {
    pub full_name: String,
    /// Lower is better.
    pub score: i64,
    pub local_dependency_count: usize,
    pub is_archived: bool,
    pub is_fork: bool,
    pub complexity_score: Option<i64>,
}

/// `10 × local deps + 5 × archived + 5 × fork + complexity`.
pub fn pilot_score(repo: &Repository, local_dependencies: usize) -> i64 {
    let deps = i64::try_from(local_dependencies).unwrap_or(i64::MAX);
    deps.saturating_mul(10)
        .saturating_add(5 * i64::from(repo.is_archived))
        .saturating_add(5 * i64::from(repo.is_fork))
        .saturating_add(repo.complexity_score.unwrap_or(0))
}

/// Rank `population` by pilot score, ties by name, keeping at most `max_count`.
pub fn rank_pilots(
    population: &[Repository],
    graph: &DependencyGraph,
    max_count: usize,
) -> Vec<PilotCandidate> {
    let mut ranked: Vec<PilotCandidate> = population
        .iter()
        .map(|repo| {
            let local_dependency_count = graph.local_dependency_count(&repo.full_name);
            PilotCandidate {
                full_name: repo.full_name.clone(),
                score: pilot_score(repo, local_dependency_count),
                local_dependency_count,
                is_archived: repo.is_archived,
                is_fork: repo.is_fork,
                complexity_score: repo.complexity_score,
            }
        })
        .collect();
    ranked.sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.full_name.cmp(&b.full_name)));
    ranked.truncate(max_count);
    ranked
}
