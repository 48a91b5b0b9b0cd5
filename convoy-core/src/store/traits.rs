use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::status::{BatchStatus, RepositoryStatus};
use crate::types::{
    Batch, BatchFilter, BatchId, DependencyEdge, DiscoveredRepository, DiscoveryPhase,
    DiscoveryRun, DiscoveryRunId, DiscoveryStatus, HistoryEntry, HistoryEntryId, NewBatch,
    NewDependency, NewHistoryEntry, Repository, RepositoryFilter, RepositoryId,
};

/// The durable store behind the control plane.
///
/// Every method that touches more than one row is atomic: implementations run
/// it in a single transaction so readers never observe half of it.
#[async_trait::async_trait]
pub trait MigrationStore: Send + Sync + std::fmt::Debug {
    // ── Repository ledger ──────────────────────────────────────────

    /// Insert a repository or refresh its profile fields. Status, batch
    /// membership and history survive a refresh.
    async fn upsert_repository(
        &self,
        repo: &DiscoveredRepository,
    ) -> crate::error::Result<RepositoryId>;

    async fn get_repository(&self, full_name: &str) -> crate::error::Result<Option<Repository>>;

    async fn get_repository_by_id(
        &self,
        id: RepositoryId,
    ) -> crate::error::Result<Option<Repository>>;

    /// Repositories matching a filter, in discovery order.
    async fn find_repositories(
        &self,
        filter: &RepositoryFilter,
    ) -> crate::error::Result<Vec<Repository>>;

    /// Repositories with no batch whose status is assignable, narrowed by
    /// `filter` (its `unbatched` flag is implied).
    async fn find_assignable_repositories(
        &self,
        filter: &RepositoryFilter,
    ) -> crate::error::Result<Vec<Repository>>;

    /// Write a repository's status and re-derive its batch in the same
    /// transaction. `migrated_at` is stamped when given.
    async fn set_repository_status(
        &self,
        full_name: &str,
        status: RepositoryStatus,
        migrated_at: Option<DateTime<Utc>>,
    ) -> crate::error::Result<Repository>;

    /// Mark a repository `rolled_back`, detach it from its batch, bump its
    /// rollback counter and append `audit` to its history, atomically.
    async fn rollback_repository(
        &self,
        full_name: &str,
        audit: &NewHistoryEntry,
    ) -> crate::error::Result<Repository>;

    /// Repository counts per status.
    async fn status_counts(&self) -> crate::error::Result<BTreeMap<RepositoryStatus, u64>>;

    // ── Dependency edges ───────────────────────────────────────────

    /// Replace a repository's outgoing edges wholesale. Returns the number of
    /// edges written.
    async fn replace_dependencies(
        &self,
        full_name: &str,
        edges: &[NewDependency],
    ) -> crate::error::Result<usize>;

    async fn get_dependencies(&self, full_name: &str)
    -> crate::error::Result<Vec<DependencyEdge>>;

    /// Local dependency targets for each of `full_names`. Repositories with
    /// no local edges are absent from the map.
    async fn local_dependencies(
        &self,
        full_names: &[String],
    ) -> crate::error::Result<HashMap<String, Vec<String>>>;

    /// Repositories with a local edge pointing at `full_name`.
    async fn get_dependents(&self, full_name: &str) -> crate::error::Result<Vec<String>>;

    /// Recompute `is_local` for every edge against current ledger contents.
    /// Returns the number of edges whose flag changed.
    async fn refresh_dependency_locality(&self) -> crate::error::Result<u64>;

    // ── Batches ────────────────────────────────────────────────────

    async fn create_batch(&self, batch: &NewBatch) -> crate::error::Result<Batch>;

    async fn get_batch(&self, id: BatchId) -> crate::error::Result<Option<Batch>>;

    async fn list_batches(&self, filter: &BatchFilter) -> crate::error::Result<Vec<Batch>>;

    /// Delete a batch, detaching its members. Returns false if it did not exist.
    async fn delete_batch(&self, id: BatchId) -> crate::error::Result<bool>;

    /// Move repositories into a batch and re-derive every batch whose
    /// membership changed. A missing batch affects zero rows.
    async fn add_repositories(
        &self,
        batch_id: BatchId,
        ids: &[RepositoryId],
    ) -> crate::error::Result<u64>;

    /// Detach repositories from a batch and re-derive it. Repositories that
    /// are not members are ignored.
    async fn remove_repositories(
        &self,
        batch_id: BatchId,
        ids: &[RepositoryId],
    ) -> crate::error::Result<u64>;

    /// Explicit pipeline transition. Stamps `started_at` on `in_progress` and
    /// `completed_at` on terminal statuses.
    async fn set_batch_status(
        &self,
        id: BatchId,
        status: BatchStatus,
    ) -> crate::error::Result<Batch>;

    async fn batch_repositories(&self, id: BatchId) -> crate::error::Result<Vec<Repository>>;

    // ── Migration history ──────────────────────────────────────────

    async fn append_history(
        &self,
        repository_id: RepositoryId,
        entry: &NewHistoryEntry,
    ) -> crate::error::Result<HistoryEntryId>;

    /// A repository's history, oldest first.
    async fn get_history(&self, full_name: &str) -> crate::error::Result<Vec<HistoryEntry>>;

    // ── Discovery runs ─────────────────────────────────────────────

    /// Atomically prune terminal runs and insert a new `in_progress` run.
    /// Fails with `AlreadyRunning` if a run is active.
    async fn start_discovery(
        &self,
        target: &str,
        phase: DiscoveryPhase,
    ) -> crate::error::Result<DiscoveryRun>;

    async fn update_discovery_phase(
        &self,
        id: DiscoveryRunId,
        phase: DiscoveryPhase,
    ) -> crate::error::Result<()>;

    async fn update_discovery_repo_progress(
        &self,
        id: DiscoveryRunId,
        processed: u64,
        total: u64,
    ) -> crate::error::Result<()>;

    async fn update_discovery_org_progress(
        &self,
        id: DiscoveryRunId,
        processed: u64,
        total: u64,
    ) -> crate::error::Result<()>;

    async fn increment_discovery_processed(
        &self,
        id: DiscoveryRunId,
        count: u64,
    ) -> crate::error::Result<()>;

    async fn increment_discovery_error(
        &self,
        id: DiscoveryRunId,
        message: &str,
    ) -> crate::error::Result<()>;

    /// Move an active run to a terminal status. Fails with `NotFound` when no
    /// active run has this id.
    async fn finish_discovery(
        &self,
        id: DiscoveryRunId,
        status: DiscoveryStatus,
        phase: Option<DiscoveryPhase>,
        error: Option<&str>,
    ) -> crate::error::Result<()>;

    /// Cancel every active run started before `cutoff` (all active runs when
    /// `cutoff` is `None`), recording `message`. Returns the number cancelled.
    async fn cancel_active_discovery(
        &self,
        cutoff: Option<DateTime<Utc>>,
        message: &str,
    ) -> crate::error::Result<u64>;

    async fn get_discovery(&self, id: DiscoveryRunId) -> crate::error::Result<Option<DiscoveryRun>>;

    async fn active_discovery(&self) -> crate::error::Result<Option<DiscoveryRun>>;

    /// The active run if there is one, else the most recently inserted run.
    async fn latest_discovery(&self) -> crate::error::Result<Option<DiscoveryRun>>;

    /// Number of discovery rows retained.
    async fn discovery_run_count(&self) -> crate::error::Result<u64>;
}
