//! Advisory planning over the pending population: dependency-ordered waves
//! and low-risk pilot candidates.
//!
//! Planning reads a snapshot and writes nothing. It never fails on graph
//! shape: cycles are broken by forced placement, which is marked on the
//! affected entries.

pub mod pilot;
pub mod waves;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::SchedulingSection;
use crate::graph::DependencyGraph;
use crate::status::RepositoryStatus;
use crate::store::MigrationStore;
use crate::types::{Repository, RepositoryFilter};

pub use pilot::{PilotCandidate, pilot_score, rank_pilots};
pub use waves::{ForcedPlacement, Wave, WaveEntry, WavePlan, plan_waves};

/// Default hard cap on the number of waves in one plan.
pub const MAX_WAVES: usize = 100;

/// Plans waves and pilot candidates from the store.
#[derive(Debug, Clone)]
pub struct WaveScheduler {
    store: Arc<dyn MigrationStore>,
    max_waves: usize,
}

impl WaveScheduler {
    pub fn new(store: Arc<dyn MigrationStore>) -> Self {
        Self {
            store,
            max_waves: MAX_WAVES,
        }
    }

    pub fn from_config(store: Arc<dyn MigrationStore>, config: &SchedulingSection) -> Self {
        Self::new(store).with_max_waves(config.max_waves)
    }

    #[must_use]
    pub fn with_max_waves(mut self, max_waves: usize) -> Self {
        self.max_waves = max_waves.max(1);
        self
    }

    /// Partition the `pending` repositories of `organization` (all when `None`)
    /// into dependency-ordered waves of at most `wave_size`.
    pub async fn plan_waves(
        &self,
        organization: Option<&str>,
        wave_size: usize,
    ) -> crate::error::Result<WavePlan> {
        let wave_size = if wave_size == 0 {
            warn!("Wave size 0 requested, using 1");
            1
        } else {
            wave_size
        };

        let (population, graph) = self.load_pending(organization).await?;
        let plan = plan_waves(&population, &graph, wave_size, self.max_waves);

        let forced = plan.forced_count();
        if forced > 0 {
            warn!(forced, "Dependency cycles broken by forced placement");
        }
        if plan.truncated {
            warn!(
                unscheduled = plan.unscheduled.len(),
                max_waves = self.max_waves,
                "Wave cap reached"
            );
        }
        info!(
            repositories = population.len(),
            waves = plan.waves.len(),
            wave_size,
            "Planned migration waves"
        );
        Ok(plan)
    }

    /// The `max_count` lowest-risk `pending` repositories of `organization`.
    pub async fn find_pilot_candidates(
        &self,
        organization: Option<&str>,
        max_count: usize,
    ) -> crate::error::Result<Vec<PilotCandidate>> {
        let (population, graph) = self.load_pending(organization).await?;
        let ranked = rank_pilots(&population, &graph, max_count);
        info!(
            repositories = population.len(),
            candidates = ranked.len(),
            "Ranked pilot candidates"
        );
        Ok(ranked)
    }

    async fn load_pending(
        &self,
        organization: Option<&str>,
    ) -> crate::error::Result<(Vec<Repository>, DependencyGraph)> {
        let filter =
            RepositoryFilter::with_status(RepositoryStatus::Pending).in_organization(organization);
        let population = self.store.find_repositories(&filter).await?;
        let names: Vec<String> = population.iter().map(|r| r.full_name.clone()).collect();
        let graph = DependencyGraph::load(self.store.as_ref(), &names).await?;
        Ok((population, graph))
    }
}

/// Names of a population, for membership tests.
fn name_set(population: &[Repository]) -> HashSet<&str> {
    population.iter().map(|r| r.full_name.as_str()).collect()
}
