// Discovery lifecycle: the single background fleet-inventory run.
//
// The store enforces at most one `in_progress` run; this module layers the
// operation vocabulary, recovery, and a driver over a pluggable source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::config::DiscoverySection;
use crate::error::ConvoyError;
use crate::ledger::Ledger;
use crate::store::MigrationStore;
use crate::types::{
    DiscoveredRepository, DiscoveryPhase, DiscoveryRun, DiscoveryRunId, DiscoveryStatus,
    organization_of,
};

/// Recorded as `last_error` on a run cancelled by an operator reset.
pub const FORCE_RESET_MESSAGE: &str = "Force reset by operator";

// ── Lifecycle manager ──────────────────────────────────────────────

/// Governs discovery runs.
#[derive(Debug, Clone)]
pub struct DiscoveryManager {
    store: Arc<dyn MigrationStore>,
}

impl DiscoveryManager {
    pub fn new(store: Arc<dyn MigrationStore>) -> Self {
        Self { store }
    }

    /// Start a run in phase `listing`. Fails with `AlreadyRunning` if a run is
    /// active; prior terminal runs are pruned.
    pub async fn start(&self, target: &str) -> crate::error::Result<DiscoveryRun> {
        let run = self.store.start_discovery(target, DiscoveryPhase::Listing).await?;
        info!(run_id = %run.id, target = %run.target, "Discovery run started");
        Ok(run)
    }

    pub async fn update_phase(
        &self,
        id: DiscoveryRunId,
        phase: DiscoveryPhase,
    ) -> crate::error::Result<()> {
        self.store.update_discovery_phase(id, phase).await?;
        debug!(run_id = %id, phase = %phase, "Discovery phase");
        Ok(())
    }

    pub async fn update_repo_progress(
        &self,
        id: DiscoveryRunId,
        processed: u64,
        total: u64,
    ) -> crate::error::Result<()> {
        self.store
            .update_discovery_repo_progress(id, processed, total)
            .await
    }

    pub async fn update_org_progress(
        &self,
        id: DiscoveryRunId,
        processed: u64,
        total: u64,
    ) -> crate::error::Result<()> {
        self.store
            .update_discovery_org_progress(id, processed, total)
            .await
    }

    pub async fn increment_processed(
        &self,
        id: DiscoveryRunId,
        count: u64,
    ) -> crate::error::Result<()> {
        self.store.increment_discovery_processed(id, count).await
    }

    /// Record a non-fatal per-item error. The run keeps going.
    pub async fn increment_error(
        &self,
        id: DiscoveryRunId,
        message: &str,
    ) -> crate::error::Result<()> {
        warn!(run_id = %id, error = %message, "Discovery item failed");
        self.store.increment_discovery_error(id, message).await
    }

    pub async fn complete(&self, id: DiscoveryRunId) -> crate::error::Result<()> {
        self.store
            .finish_discovery(
                id,
                DiscoveryStatus::Completed,
                Some(DiscoveryPhase::Completed),
                None,
            )
            .await?;
        info!(run_id = %id, "Discovery run completed");
        Ok(())
    }

    pub async fn fail(&self, id: DiscoveryRunId, message: &str) -> crate::error::Result<()> {
        self.store
            .finish_discovery(id, DiscoveryStatus::Failed, None, Some(message))
            .await?;
        warn!(run_id = %id, error = %message, "Discovery run failed");
        Ok(())
    }

    pub async fn cancel(&self, id: DiscoveryRunId) -> crate::error::Result<()> {
        self.store
            .finish_discovery(id, DiscoveryStatus::Cancelled, None, None)
            .await?;
        info!(run_id = %id, "Discovery run cancelled");
        Ok(())
    }

    /// Cancel any active run regardless of age. Returns the number cancelled.
    pub async fn force_reset(&self) -> crate::error::Result<u64> {
        let cancelled = self
            .store
            .cancel_active_discovery(None, FORCE_RESET_MESSAGE)
            .await?;
        if cancelled > 0 {
            warn!(cancelled, "Discovery force reset cancelled active run");
        }
        Ok(cancelled)
    }

    /// Cancel an active run that started more than `timeout` ago.
    pub async fn recover_stuck(&self, timeout: Duration) -> crate::error::Result<u64> {
        let Some(cutoff) = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            // Nothing can be that old.
            return Ok(0);
        };
        let message = format!("Recovered stuck discovery run: exceeded timeout of {timeout:?}");
        let cancelled = self
            .store
            .cancel_active_discovery(Some(cutoff), &message)
            .await?;
        if cancelled > 0 {
            warn!(cancelled, timeout = ?timeout, "Recovered stuck discovery run");
        }
        Ok(cancelled)
    }

    /// Run stuck-run recovery once at process start, if configured.
    pub async fn recover_on_startup(
        &self,
        config: &DiscoverySection,
    ) -> crate::error::Result<u64> {
        if !config.recover_on_startup {
            return Ok(0);
        }
        self.recover_stuck(config.stuck_timeout()).await
    }

    pub async fn get(&self, id: DiscoveryRunId) -> crate::error::Result<Option<DiscoveryRun>> {
        self.store.get_discovery(id).await
    }

    pub async fn get_active(&self) -> crate::error::Result<Option<DiscoveryRun>> {
        self.store.active_discovery().await
    }

    /// The active run, else the most recent terminal run.
    pub async fn get_latest(&self) -> crate::error::Result<Option<DiscoveryRun>> {
        self.store.latest_discovery().await
    }
}

// ── Discovery driver ───────────────────────────────────────────────

/// Where discovery reads the fleet from (a hosting API, a fixture).
#[async_trait::async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Full names of every repository under `target`.
    async fn list_repositories(&self, target: &str) -> crate::error::Result<Vec<String>>;

    /// Profile and dependency edges for one repository.
    async fn describe(&self, full_name: &str) -> crate::error::Result<DiscoveredRepository>;
}

/// Statistics returned by a discovery run.
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    pub repositories_listed: u64,
    pub repositories_recorded: u64,
    pub organizations: u64,
    pub edges_relocalized: u64,
    /// True if the run was cancelled from outside before it finished.
    pub cancelled: bool,
    pub duration: Duration,
    pub errors: Vec<(String, ConvoyError)>,
}

/// Executes one complete discovery run against a [`DiscoverySource`].
#[derive(Debug)]
pub struct DiscoveryRunner {
    manager: DiscoveryManager,
    ledger: Ledger,
    store: Arc<dyn MigrationStore>,
}

impl DiscoveryRunner {
    pub fn new(store: Arc<dyn MigrationStore>) -> Self {
        Self {
            manager: DiscoveryManager::new(Arc::clone(&store)),
            ledger: Ledger::new(Arc::clone(&store)),
            store,
        }
    }

    /// Inventory `target`. Listing failure fails the run; per-repository
    /// failures are counted on the run and skipped. Any other error after the
    /// run started also fails it before propagating, so the next run is not
    /// refused.
    pub async fn run(
        &self,
        source: &dyn DiscoverySource,
        target: &str,
    ) -> crate::error::Result<DiscoveryStats> {
        let start = Instant::now();
        let mut stats = DiscoveryStats::default();
        let run = self.manager.start(target).await?;
        let id = run.id;

        if let Err(e) = self.process(id, source, target, &mut stats).await {
            match self.manager.fail(id, &e.to_string()).await {
                Ok(()) => {}
                // Already cancelled or reset from outside.
                Err(fail_err) if fail_err.is_not_found() => {}
                Err(fail_err) => {
                    warn!(run_id = %id, error = %fail_err, "Could not mark discovery run failed");
                }
            }
            return Err(e);
        }

        stats.duration = start.elapsed();
        info!(
            run_id = %id,
            recorded = stats.repositories_recorded,
            errors = stats.errors.len(),
            relocalized = stats.edges_relocalized,
            duration = ?stats.duration,
            "Discovery run finished"
        );
        Ok(stats)
    }

    async fn process(
        &self,
        id: DiscoveryRunId,
        source: &dyn DiscoverySource,
        target: &str,
        stats: &mut DiscoveryStats,
    ) -> crate::error::Result<()> {
        let names = source.list_repositories(target).await?;
        stats.repositories_listed = names.len() as u64;

        let mut remaining_per_org: HashMap<&str, usize> = HashMap::new();
        for name in &names {
            *remaining_per_org.entry(organization_of(name)).or_default() += 1;
        }
        let total_orgs = remaining_per_org.len() as u64;
        let mut processed_orgs = 0;

        self.manager.update_phase(id, DiscoveryPhase::Processing).await?;
        self.manager
            .update_repo_progress(id, 0, stats.repositories_listed)
            .await?;
        self.manager.update_org_progress(id, 0, total_orgs).await?;
        info!(run_id = %id, repositories = names.len(), organizations = total_orgs, "Processing repositories");

        for name in &names {
            match self.record(source, name).await {
                Ok(()) => stats.repositories_recorded += 1,
                Err(e) => {
                    self.manager
                        .increment_error(id, &format!("{name}: {e}"))
                        .await?;
                    stats.errors.push((name.clone(), e));
                }
            }
            self.manager.increment_processed(id, 1).await?;

            let org = organization_of(name);
            if let Some(left) = remaining_per_org.get_mut(org) {
                *left -= 1;
                if *left == 0 {
                    processed_orgs += 1;
                    self.manager
                        .update_org_progress(id, processed_orgs, total_orgs)
                        .await?;
                }
            }

            let active = self.manager.get(id).await?.is_some_and(|r| r.is_active());
            if !active {
                info!(run_id = %id, "Discovery run cancelled externally, stopping");
                stats.cancelled = true;
                break;
            }
        }
        stats.organizations = processed_orgs;

        stats.edges_relocalized = self.store.refresh_dependency_locality().await?;
        if !stats.cancelled {
            self.manager.complete(id).await?;
        }
        Ok(())
    }

    async fn record(&self, source: &dyn DiscoverySource, name: &str) -> crate::error::Result<()> {
        let mut repo = source.describe(name).await?;
        if repo.full_name != name {
            debug!(listed = %name, described = %repo.full_name, "Source renamed repository");
            repo.full_name = name.to_string();
        }
        self.ledger.record_discovered(&repo).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::DiscoveryError;
    use crate::status::RepositoryStatus;
    use crate::store::sqlite::SqliteStore;
    use crate::types::{DependencyType, NewDependency, RepositoryFilter};

    fn manager() -> (DiscoveryManager, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        (DiscoveryManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn concurrent_starts_admit_one_run() {
        let (manager, store) = manager();
        let other = manager.clone();

        let (first, second) = tokio::join!(manager.start("acme"), other.start("acme"));
        let (winner, loser) = match (first, second) {
            (Ok(run), Err(e)) | (Err(e), Ok(run)) => (run, e),
            (a, b) => panic!("expected exactly one winner, got {a:?} / {b:?}"),
        };
        match loser {
            ConvoyError::Discovery(DiscoveryError::AlreadyRunning { id, .. }) => {
                assert_eq!(id, winner.id);
            }
            other => panic!("expected AlreadyRunning, got {other}"),
        }
        assert_eq!(store.discovery_run_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminal_transitions_require_active_run() {
        let (manager, _) = manager();
        let run = manager.start("acme").await.unwrap();
        manager.complete(run.id).await.unwrap();

        assert!(manager.fail(run.id, "late").await.unwrap_err().is_not_found());
        assert!(manager.cancel(run.id).await.unwrap_err().is_not_found());
        assert!(
            manager
                .complete(DiscoveryRunId(999))
                .await
                .unwrap_err()
                .is_not_found()
        );

        let done = manager.get(run.id).await.unwrap().unwrap();
        assert_eq!(done.status, DiscoveryStatus::Completed);
        assert_eq!(done.phase, DiscoveryPhase::Completed);
    }

    #[tokio::test]
    async fn retention_keeps_active_plus_latest() {
        let (manager, store) = manager();
        for _ in 0..4 {
            let run = manager.start("acme").await.unwrap();
            manager.fail(run.id, "boom").await.unwrap();
            assert!(store.discovery_run_count().await.unwrap() <= 2);
        }
        let latest = manager.get_latest().await.unwrap().unwrap();
        assert_eq!(latest.status, DiscoveryStatus::Failed);
        assert!(manager.get_active().await.unwrap().is_none());

        manager.start("acme").await.unwrap();
        assert!(store.discovery_run_count().await.unwrap() <= 2);
    }

    #[tokio::test]
    async fn errors_accumulate_without_failing_run() {
        let (manager, _) = manager();
        let run = manager.start("acme").await.unwrap();
        manager.increment_error(run.id, "acme/a: timeout").await.unwrap();
        manager.increment_error(run.id, "acme/b: 404").await.unwrap();

        let run = manager.get_active().await.unwrap().unwrap();
        assert_eq!(run.error_count, 2);
        assert_eq!(run.last_error.as_deref(), Some("acme/b: 404"));
        assert!(run.is_active());
    }

    #[tokio::test]
    async fn force_reset_cancels_fresh_run() {
        let (manager, _) = manager();
        let run = manager.start("acme").await.unwrap();
        assert_eq!(manager.force_reset().await.unwrap(), 1);
        assert_eq!(manager.force_reset().await.unwrap(), 0);

        let run = manager.get(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, DiscoveryStatus::Cancelled);
        assert_eq!(run.last_error.as_deref(), Some(FORCE_RESET_MESSAGE));
        manager.start("acme").await.unwrap();
    }

    #[tokio::test]
    async fn recover_stuck_spares_young_runs() {
        let (manager, _) = manager();
        manager.start("acme").await.unwrap();
        assert_eq!(manager.recover_stuck(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(manager.get_active().await.unwrap().is_some());
        assert_eq!(manager.recover_stuck(Duration::MAX).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recover_stuck_is_idempotent() {
        let (manager, _) = manager();
        let run = manager.start("acme").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let timeout = Duration::from_millis(5);
        assert_eq!(manager.recover_stuck(timeout).await.unwrap(), 1);
        assert_eq!(manager.recover_stuck(timeout).await.unwrap(), 0);

        let run = manager.get(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, DiscoveryStatus::Cancelled);
        assert!(run.last_error.unwrap().contains("exceeded timeout of 5ms"));
    }

    #[tokio::test]
    async fn startup_recovery_honors_config() {
        let (manager, _) = manager();
        manager.start("acme").await.unwrap();
        let disabled = DiscoverySection {
            recover_on_startup: false,
            ..Default::default()
        };
        assert_eq!(manager.recover_on_startup(&disabled).await.unwrap(), 0);
        assert_eq!(manager.recover_on_startup(&DiscoverySection::default()).await.unwrap(), 0);
    }

    // ── Runner ─────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeSource {
        repos: Vec<DiscoveredRepository>,
        broken: Vec<&'static str>,
        list_fails: bool,
        reset_after: Option<(usize, DiscoveryManager)>,
        /// Drops the dependency table once listing is done.
        drop_edges_table: Option<Arc<SqliteStore>>,
        described: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl DiscoverySource for FakeSource {
        async fn list_repositories(&self, _target: &str) -> crate::error::Result<Vec<String>> {
            if self.list_fails {
                return Err(ConvoyError::Source("rate limited".into()));
            }
            if let Some(store) = &self.drop_edges_table {
                store
                    .lock()?
                    .execute_batch("DROP TABLE repository_dependencies")?;
            }
            Ok(self.repos.iter().map(|r| r.full_name.clone()).collect())
        }

        async fn describe(&self, full_name: &str) -> crate::error::Result<DiscoveredRepository> {
            let seen = {
                let mut described = self.described.lock().unwrap();
                *described += 1;
                *described
            };
            if let Some((after, manager)) = &self.reset_after {
                if seen == *after {
                    manager.force_reset().await?;
                }
            }
            if self.broken.contains(&full_name) {
                return Err(ConvoyError::Source(format!("cannot read {full_name}")));
            }
            self.repos
                .iter()
                .find(|r| r.full_name == full_name)
                .cloned()
                .ok_or_else(|| ConvoyError::Source("unknown".into()))
        }
    }

    fn fleet() -> Vec<DiscoveredRepository> {
        let mut app = DiscoveredRepository::new("acme/app");
        // Listed before its dependency, so the edge starts out foreign.
        app.dependencies = vec![NewDependency::new("acme/lib", DependencyType::Submodule)];
        vec![
            app,
            DiscoveredRepository::new("acme/lib"),
            DiscoveredRepository::new("globex/tool"),
        ]
    }

    #[tokio::test]
    async fn runner_records_fleet_and_completes() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let runner = DiscoveryRunner::new(store.clone());
        let source = FakeSource {
            repos: fleet(),
            ..Default::default()
        };

        let stats = runner.run(&source, "acme").await.unwrap();
        assert_eq!(stats.repositories_recorded, 3);
        assert_eq!(stats.organizations, 2);
        assert!(!stats.cancelled);
        assert!(stats.errors.is_empty());

        let run = store.latest_discovery().await.unwrap().unwrap();
        assert_eq!(run.status, DiscoveryStatus::Completed);
        assert_eq!((run.processed_repos, run.total_repos), (3, 3));
        assert_eq!((run.processed_orgs, run.total_orgs), (2, 2));

        let edges = store.get_dependencies("acme/app").await.unwrap();
        assert!(edges[0].is_local);
    }

    #[tokio::test]
    async fn runner_counts_item_errors_and_continues() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let runner = DiscoveryRunner::new(store.clone());
        let source = FakeSource {
            repos: fleet(),
            broken: vec!["acme/lib"],
            ..Default::default()
        };

        let stats = runner.run(&source, "acme").await.unwrap();
        assert_eq!(stats.repositories_recorded, 2);
        assert_eq!(stats.errors.len(), 1);

        let run = store.latest_discovery().await.unwrap().unwrap();
        assert_eq!(run.status, DiscoveryStatus::Completed);
        assert_eq!(run.error_count, 1);
        assert!(run.last_error.unwrap().starts_with("acme/lib:"));

        let pending = store
            .find_repositories(&RepositoryFilter::with_status(RepositoryStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn runner_fails_run_when_listing_fails() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let runner = DiscoveryRunner::new(store.clone());
        let source = FakeSource {
            list_fails: true,
            ..Default::default()
        };

        assert!(runner.run(&source, "acme").await.is_err());
        let run = store.latest_discovery().await.unwrap().unwrap();
        assert_eq!(run.status, DiscoveryStatus::Failed);
        assert!(run.last_error.unwrap().contains("rate limited"));
    }

    #[tokio::test]
    async fn runner_fails_run_on_storage_error_after_listing() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let runner = DiscoveryRunner::new(store.clone());
        let source = FakeSource {
            repos: fleet(),
            drop_edges_table: Some(store.clone()),
            ..Default::default()
        };

        let err = runner.run(&source, "acme").await.unwrap_err();
        assert!(matches!(err, ConvoyError::Store(_)));
        let run = store.latest_discovery().await.unwrap().unwrap();
        assert_eq!(run.status, DiscoveryStatus::Failed);
        assert_eq!(run.error_count, 3);
        assert!(run.last_error.unwrap().contains("no such table"));

        let manager = DiscoveryManager::new(store.clone());
        assert!(manager.get_active().await.unwrap().is_none());
        manager.start("acme").await.unwrap();
    }

    #[tokio::test]
    async fn runner_stops_after_external_cancel() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let runner = DiscoveryRunner::new(store.clone());
        let source = FakeSource {
            repos: fleet(),
            reset_after: Some((1, DiscoveryManager::new(store.clone()))),
            ..Default::default()
        };

        let stats = runner.run(&source, "acme").await.unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.repositories_recorded, 1);

        let run = store.latest_discovery().await.unwrap().unwrap();
        assert_eq!(run.status, DiscoveryStatus::Cancelled);
        assert_eq!(run.last_error.as_deref(), Some(FORCE_RESET_MESSAGE));
    }

    #[tokio::test]
    async fn runner_refuses_while_run_active() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        DiscoveryManager::new(store.clone()).start("acme").await.unwrap();
        let runner = DiscoveryRunner::new(store.clone());
        let source = FakeSource::default();
        assert!(runner.run(&source, "acme").await.unwrap_err().is_conflict());
    }
}
