// Fleet fixtures for Convoy integration tests.

use std::path::PathBuf;
use std::sync::Arc;

use convoy_core::batch::BatchAggregator;
use convoy_core::discovery::DiscoveryManager;
use convoy_core::ledger::Ledger;
use convoy_core::schedule::WaveScheduler;
use convoy_core::status::RepositoryStatus;
use convoy_core::store::MigrationStore;
use convoy_core::store::sqlite::SqliteStore;
use convoy_core::types::{
    BatchId, BatchKind, DependencyType, DiscoveredRepository, NewBatch, NewDependency,
    RepositoryId,
};

/// One repository to seed into a fleet.
#[derive(Debug, Clone)]
pub struct RepoSpec {
    pub repo: DiscoveredRepository,
    pub status: RepositoryStatus,
}

impl RepoSpec {
    pub fn new(full_name: &str) -> Self {
        Self {
            repo: DiscoveredRepository::new(full_name),
            status: RepositoryStatus::Pending,
        }
    }

    #[must_use]
    pub fn complexity(mut self, score: i64) -> Self {
        self.repo.complexity_score = Some(score);
        self
    }

    #[must_use]
    pub fn size(mut self, bytes: i64) -> Self {
        self.repo.total_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn depends_on(mut self, targets: &[&str]) -> Self {
        self.repo.dependencies.extend(
            targets
                .iter()
                .map(|t| NewDependency::new(*t, DependencyType::Submodule)),
        );
        self
    }

    #[must_use]
    pub fn status(mut self, status: RepositoryStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn archived(mut self) -> Self {
        self.repo.is_archived = true;
        self
    }

    #[must_use]
    pub fn fork(mut self) -> Self {
        self.repo.is_fork = true;
        self
    }
}

/// A store plus every control-plane facade over it.
#[derive(Debug)]
pub struct Fleet {
    pub store: Arc<dyn MigrationStore>,
    pub ledger: Ledger,
    pub batches: BatchAggregator,
    pub discovery: DiscoveryManager,
    pub scheduler: WaveScheduler,
    dir: Option<tempfile::TempDir>,
}

impl Fleet {
    /// A fleet over an in-memory store.
    pub fn in_memory() -> Self {
        let store = SqliteStore::in_memory().expect("open in-memory store");
        Self::with_store(Arc::new(store), None)
    }

    /// A fleet over a database file in a fresh temporary directory.
    pub fn on_disk() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let store = SqliteStore::open(&dir.path().join("convoy.db")).expect("open store");
        Self::with_store(Arc::new(store), Some(dir))
    }

    fn with_store(store: Arc<dyn MigrationStore>, dir: Option<tempfile::TempDir>) -> Self {
        Self {
            ledger: Ledger::new(Arc::clone(&store)),
            batches: BatchAggregator::new(Arc::clone(&store)),
            discovery: DiscoveryManager::new(Arc::clone(&store)),
            scheduler: WaveScheduler::new(Arc::clone(&store)),
            store,
            dir,
        }
    }

    /// Database file backing an on-disk fleet.
    pub fn db_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.path().join("convoy.db"))
    }

    /// Another connection to the same database file, as a second process
    /// would open it.
    pub fn reopen(&self) -> SqliteStore {
        let path = self.db_path().expect("reopen needs an on-disk fleet");
        SqliteStore::open(&path).expect("reopen store")
    }

    /// Seed repositories, then recompute edge locality so dependencies on
    /// later entries count as local.
    pub async fn seed(&self, specs: Vec<RepoSpec>) -> Vec<RepositoryId> {
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = self
                .ledger
                .record_discovered(&spec.repo)
                .await
                .expect("record repository");
            if spec.status != RepositoryStatus::Pending {
                self.ledger
                    .set_status(&spec.repo.full_name, spec.status)
                    .await
                    .expect("set status");
            }
            ids.push(id);
        }
        self.store
            .refresh_dependency_locality()
            .await
            .expect("refresh locality");
        ids
    }

    /// Create a batch holding `members`.
    pub async fn batch_with(&self, name: &str, members: &[RepositoryId]) -> BatchId {
        let batch = self
            .batches
            .create(&NewBatch::new(name, BatchKind::Wave))
            .await
            .expect("create batch");
        self.batches
            .add_repositories(batch.id, members)
            .await
            .expect("add members");
        batch.id
    }
}
