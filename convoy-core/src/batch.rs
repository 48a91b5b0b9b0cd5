use std::sync::Arc;

use tracing::{debug, info};

use crate::error::LedgerError;
use crate::status::BatchStatus;
use crate::store::MigrationStore;
use crate::types::{Batch, BatchFilter, BatchId, NewBatch, Repository, RepositoryId};

/// Batch membership and derived batch status.
///
/// Membership changes recount `repository_count` and re-derive `status` in
/// the same transaction as the change. An `in_progress` batch keeps its
/// status until [`set_status`](Self::set_status) moves it.
#[derive(Debug, Clone)]
pub struct BatchAggregator {
    store: Arc<dyn MigrationStore>,
}

impl BatchAggregator {
    pub fn new(store: Arc<dyn MigrationStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, batch: &NewBatch) -> crate::error::Result<Batch> {
        let created = self.store.create_batch(batch).await?;
        info!(batch_id = %created.id, name = %created.name, kind = %created.kind, "Batch created");
        Ok(created)
    }

    /// Add repositories, moving them out of any batch they were in. Returns
    /// the number of rows changed; an unknown batch changes nothing.
    pub async fn add_repositories(
        &self,
        id: BatchId,
        repositories: &[RepositoryId],
    ) -> crate::error::Result<u64> {
        let affected = self.store.add_repositories(id, repositories).await?;
        debug!(batch_id = %id, requested = repositories.len(), affected, "Added to batch");
        Ok(affected)
    }

    /// Remove repositories that are members of this batch. Non-members and an
    /// unknown batch are ignored.
    pub async fn remove_repositories(
        &self,
        id: BatchId,
        repositories: &[RepositoryId],
    ) -> crate::error::Result<u64> {
        let affected = self.store.remove_repositories(id, repositories).await?;
        debug!(batch_id = %id, requested = repositories.len(), affected, "Removed from batch");
        Ok(affected)
    }

    pub async fn get(&self, id: BatchId) -> crate::error::Result<Option<Batch>> {
        self.store.get_batch(id).await
    }

    /// Like [`get`](Self::get) but a missing batch is an error.
    pub async fn require(&self, id: BatchId) -> crate::error::Result<Batch> {
        self.store
            .get_batch(id)
            .await?
            .ok_or_else(|| LedgerError::BatchNotFound(id).into())
    }

    pub async fn list(&self, filter: &BatchFilter) -> crate::error::Result<Vec<Batch>> {
        self.store.list_batches(filter).await
    }

    pub async fn members(&self, id: BatchId) -> crate::error::Result<Vec<Repository>> {
        self.store.batch_repositories(id).await
    }

    /// Explicit transition from the execution pipeline. This is the only way
    /// out of `in_progress`.
    pub async fn set_status(&self, id: BatchId, status: BatchStatus) -> crate::error::Result<Batch> {
        let batch = self.store.set_batch_status(id, status).await?;
        info!(batch_id = %id, status = %status, "Batch status set");
        Ok(batch)
    }

    /// Delete a batch, detaching its members. Returns false if it did not exist.
    pub async fn delete(&self, id: BatchId) -> crate::error::Result<bool> {
        let deleted = self.store.delete_batch(id).await?;
        if deleted {
            info!(batch_id = %id, "Batch deleted");
        }
        Ok(deleted)
    }
}


#[cfg(test)]
mod proptests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::BatchAggregator;
    use crate::status::{BatchStatus, RepositoryStatus};
    use crate::store::MigrationStore;
    use crate::store::sqlite::SqliteStore;
    use crate::types::{BatchKind, DiscoveredRepository, NewBatch};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn batch_status_tracks_member_statuses(
            statuses in proptest::collection::vec(
                proptest::sample::select(RepositoryStatus::ALL.to_vec()),
                1..8,
            ),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let status = rt.block_on(async {
                let store: Arc<dyn MigrationStore> = Arc::new(SqliteStore::in_memory().unwrap());
                let batches = BatchAggregator::new(Arc::clone(&store));
                let batch = batches.create(&NewBatch::new("b", BatchKind::Custom)).await.unwrap();
                let mut ids = Vec::new();
                for (i, status) in statuses.iter().enumerate() {
                    let name = format!("acme/r{i}");
                    ids.push(store.upsert_repository(&DiscoveredRepository::new(&name)).await.unwrap());
                    store.set_repository_status(&name, *status, None).await.unwrap();
                }
                batches.add_repositories(batch.id, &ids).await.unwrap();
                batches.require(batch.id).await.unwrap().status
            });

            let all_clean = statuses.iter().all(|s| *s == RepositoryStatus::DryRunComplete);
            prop_assert_eq!(status == BatchStatus::Ready, all_clean);
        }
    }
}
