use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::status::RepositoryStatus;
use crate::store::MigrationStore;
use crate::types::{
    DiscoveredRepository, HistoryEntry, HistoryStatus, MigrationPhase, NewHistoryEntry,
    Repository, RepositoryFilter, RepositoryId,
};

/// Audit message for a rollback that arrives as a plain status write.
pub const STATUS_ROLLBACK_REASON: &str = "Rolled back via status update";

/// The repository ledger: identity, status and history per repository.
///
/// Status writes are trusted; the ledger does not check that a transition is
/// legal. Every write re-derives the owning batch inside the same store
/// transaction.
#[derive(Debug, Clone)]
pub struct Ledger {
    store: Arc<dyn MigrationStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn MigrationStore>) -> Self {
        Self { store }
    }

    /// Record a repository seen by discovery: refresh its profile and replace
    /// its dependency edges wholesale.
    pub async fn record_discovered(
        &self,
        repo: &DiscoveredRepository,
    ) -> crate::error::Result<RepositoryId> {
        let id = self.store.upsert_repository(repo).await?;
        let edges = self
            .store
            .replace_dependencies(&repo.full_name, &repo.dependencies)
            .await?;
        debug!(repo = %repo.full_name, edges, "Recorded discovered repository");
        Ok(id)
    }

    /// Unconditional status write. `complete` and `migration_complete` stamp
    /// `migrated_at`; `rolled_back` goes through [`rollback`](Self::rollback)
    /// so the batch membership is cleared and audited.
    pub async fn set_status(
        &self,
        full_name: &str,
        status: RepositoryStatus,
    ) -> crate::error::Result<Repository> {
        if status == RepositoryStatus::RolledBack {
            return self.rollback(full_name, STATUS_ROLLBACK_REASON).await;
        }
        let migrated_at = status.is_migrated().then(Utc::now);
        let repo = self
            .store
            .set_repository_status(full_name, status, migrated_at)
            .await?;
        info!(repo = %full_name, status = %status, batch = ?repo.batch_id, "Repository status set");
        Ok(repo)
    }

    /// Roll a repository back: status `rolled_back`, batch membership cleared,
    /// and a zero-duration audit entry carrying `reason`, all in one unit.
    pub async fn rollback(&self, full_name: &str, reason: &str) -> crate::error::Result<Repository> {
        let now = Utc::now();
        let audit = NewHistoryEntry {
            phase: MigrationPhase::Rollback,
            status: HistoryStatus::Completed,
            message: Some(reason.to_string()),
            started_at: now,
            completed_at: Some(now),
        };
        let repo = self.store.rollback_repository(full_name, &audit).await?;
        info!(
            repo = %full_name,
            reason,
            rollbacks = repo.rollback_count,
            "Repository rolled back"
        );
        Ok(repo)
    }

    pub async fn get(&self, full_name: &str) -> crate::error::Result<Option<Repository>> {
        self.store.get_repository(full_name).await
    }

    /// Like [`get`](Self::get) but a missing repository is an error.
    pub async fn require(&self, full_name: &str) -> crate::error::Result<Repository> {
        self.store
            .get_repository(full_name)
            .await?
            .ok_or_else(|| LedgerError::RepositoryNotFound(full_name.to_string()).into())
    }

    /// Resolve full names to ids, failing on the first unknown name.
    pub async fn resolve_ids(&self, full_names: &[String]) -> crate::error::Result<Vec<RepositoryId>> {
        let mut ids = Vec::with_capacity(full_names.len());
        for name in full_names {
            ids.push(self.require(name).await?.id);
        }
        Ok(ids)
    }

    pub async fn find(&self, filter: &RepositoryFilter) -> crate::error::Result<Vec<Repository>> {
        self.store.find_repositories(filter).await
    }

    /// Repositories that may be placed into a batch: unbatched and not in an
    /// excluded status.
    pub async fn available_for_batch(
        &self,
        filter: &RepositoryFilter,
    ) -> crate::error::Result<Vec<Repository>> {
        self.store.find_assignable_repositories(filter).await
    }

    pub async fn history(&self, full_name: &str) -> crate::error::Result<Vec<HistoryEntry>> {
        self.store.get_history(full_name).await
    }

    /// Append a dry-run or migration audit record.
    pub async fn record_history(
        &self,
        full_name: &str,
        entry: &NewHistoryEntry,
    ) -> crate::error::Result<()> {
        let repo = self.require(full_name).await?;
        self.store.append_history(repo.id, entry).await?;
        Ok(())
    }

    pub async fn dependents(&self, full_name: &str) -> crate::error::Result<Vec<String>> {
        self.store.get_dependents(full_name).await
    }

    pub async fn status_counts(&self) -> crate::error::Result<BTreeMap<RepositoryStatus, u64>> {
        self.store.status_counts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchAggregator;
    use crate::status::BatchStatus;
    use crate::store::sqlite::SqliteStore;
    use crate::types::{BatchKind, DependencyType, NewBatch, NewDependency};

    fn ledger() -> (Ledger, Arc<dyn MigrationStore>) {
        let store: Arc<dyn MigrationStore> = Arc::new(SqliteStore::in_memory().unwrap());
        (Ledger::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn set_status_stamps_migrated_at_only_when_migrated() {
        let (ledger, _) = ledger();
        ledger
            .record_discovered(&DiscoveredRepository::new("acme/api"))
            .await
            .unwrap();

        let repo = ledger
            .set_status("acme/api", RepositoryStatus::MigratingContent)
            .await
            .unwrap();
        assert!(repo.migrated_at.is_none());

        let repo = ledger
            .set_status("acme/api", RepositoryStatus::MigrationComplete)
            .await
            .unwrap();
        assert!(repo.migrated_at.is_some());
    }

    #[tokio::test]
    async fn rolled_back_repository_is_immediately_assignable() {
        let (ledger, store) = ledger();
        let batches = BatchAggregator::new(Arc::clone(&store));
        let id = ledger
            .record_discovered(&DiscoveredRepository::new("acme/api"))
            .await
            .unwrap();
        let first = batches.create(&NewBatch::new("wave-1", BatchKind::Wave)).await.unwrap();
        batches.add_repositories(first.id, &[id]).await.unwrap();
        ledger
            .set_status("acme/api", RepositoryStatus::MigrationFailed)
            .await
            .unwrap();

        let repo = ledger.rollback("acme/api", "destination rejected push").await.unwrap();
        assert_eq!(repo.status, RepositoryStatus::RolledBack);
        assert!(repo.batch_id.is_none());
        assert!(repo.is_assignable());

        let available = ledger
            .available_for_batch(&RepositoryFilter::default())
            .await
            .unwrap();
        assert_eq!(available.len(), 1);

        let second = batches.create(&NewBatch::new("retry", BatchKind::Custom)).await.unwrap();
        assert_eq!(batches.add_repositories(second.id, &[id]).await.unwrap(), 1);
        let emptied = batches.get(first.id).await.unwrap().unwrap();
        assert_eq!(emptied.repository_count, 0);
        assert_eq!(emptied.status, BatchStatus::Pending);

        let history = ledger.history("acme/api").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message.as_deref(), Some("destination rejected push"));
    }

    #[tokio::test]
    async fn rolled_back_status_write_detaches_and_audits() {
        let (ledger, store) = ledger();
        let batches = BatchAggregator::new(Arc::clone(&store));
        let id = ledger
            .record_discovered(&DiscoveredRepository::new("acme/api"))
            .await
            .unwrap();
        let batch = batches.create(&NewBatch::new("w", BatchKind::Wave)).await.unwrap();
        batches.add_repositories(batch.id, &[id]).await.unwrap();

        let repo = ledger
            .set_status("acme/api", RepositoryStatus::RolledBack)
            .await
            .unwrap();
        assert_eq!(repo.status, RepositoryStatus::RolledBack);
        assert!(repo.batch_id.is_none());
        assert_eq!(repo.rollback_count, 1);

        let history = ledger.history("acme/api").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].phase, MigrationPhase::Rollback);
        assert_eq!(history[0].message.as_deref(), Some(STATUS_ROLLBACK_REASON));

        let emptied = batches.get(batch.id).await.unwrap().unwrap();
        assert_eq!(emptied.repository_count, 0);
        assert_eq!(
            ledger
                .available_for_batch(&RepositoryFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn rollback_count_marks_retried_pending() {
        let (ledger, _) = ledger();
        ledger
            .record_discovered(&DiscoveredRepository::new("acme/api"))
            .await
            .unwrap();
        ledger.rollback("acme/api", "first").await.unwrap();
        let repo = ledger.set_status("acme/api", RepositoryStatus::Pending).await.unwrap();
        assert_eq!(repo.status, RepositoryStatus::Pending);
        assert_eq!(repo.rollback_count, 1);
    }

    #[tokio::test]
    async fn record_discovered_replaces_edges() {
        let (ledger, store) = ledger();
        ledger
            .record_discovered(&DiscoveredRepository::new("acme/lib"))
            .await
            .unwrap();
        let mut app = DiscoveredRepository::new("acme/app");
        app.dependencies = vec![NewDependency::new("acme/lib", DependencyType::Submodule)];
        ledger.record_discovered(&app).await.unwrap();
        assert_eq!(ledger.dependents("acme/lib").await.unwrap(), vec!["acme/app"]);

        app.dependencies.clear();
        ledger.record_discovered(&app).await.unwrap();
        assert!(store.get_dependencies("acme/app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_names_fail_resolution() {
        let (ledger, _) = ledger();
        ledger
            .record_discovered(&DiscoveredRepository::new("acme/one"))
            .await
            .unwrap();
        let err = ledger
            .resolve_ids(&["acme/one".into(), "acme/ghost".into()])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(ledger.set_status("acme/ghost", RepositoryStatus::Complete).await.is_err());
    }
}
