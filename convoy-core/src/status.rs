//! Repository and batch status state machines.
//!
//! Repository statuses are written by the execution pipeline through a single
//! trusted setter; this module does not police transitions. What it does own
//! is the batch readiness rule: a batch is `ready` only when every member has
//! passed a dry run, and an in-flight batch is never re-derived.

use crate::types::tag_enum;

tag_enum! {
    /// Lifecycle state of a single repository.
    ///
    /// Happy path: `pending → dry_run_queued → dry_run_in_progress →
    /// dry_run_complete → queued_for_migration → migrating_content →
    /// archive_generating → post_migration → complete`. A rollback lands in
    /// `rolled_back`, from which the pipeline re-enters `pending`.
    pub enum RepositoryStatus {
        Pending => "pending",
        DryRunQueued => "dry_run_queued",
        DryRunInProgress => "dry_run_in_progress",
        DryRunComplete => "dry_run_complete",
        DryRunFailed => "dry_run_failed",
        PreMigration => "pre_migration",
        QueuedForMigration => "queued_for_migration",
        MigratingContent => "migrating_content",
        ArchiveGenerating => "archive_generating",
        PostMigration => "post_migration",
        Complete => "complete",
        MigrationComplete => "migration_complete",
        MigrationFailed => "migration_failed",
        RolledBack => "rolled_back",
        RemediationRequired => "remediation_required",
        WontMigrate => "wont_migrate",
    }
}

impl RepositoryStatus {
    /// Statuses that keep a repository out of the batch-assignable pool,
    /// even when it has no batch.
    pub const NOT_ASSIGNABLE: [Self; 11] = [
        Self::Complete,
        Self::QueuedForMigration,
        Self::DryRunInProgress,
        Self::DryRunQueued,
        Self::MigratingContent,
        Self::ArchiveGenerating,
        Self::PostMigration,
        Self::MigrationComplete,
        Self::WontMigrate,
        Self::RemediationRequired,
        Self::PreMigration,
    ];

    /// Whether a repository in this status may be placed into a batch.
    ///
    /// Failed and rolled-back repositories are assignable: they are retried
    /// by reassigning them to a new batch.
    pub fn is_assignable(self) -> bool {
        !Self::NOT_ASSIGNABLE.contains(&self)
    }

    /// The repository's content has landed at the destination.
    pub fn is_migrated(self) -> bool {
        matches!(self, Self::Complete | Self::MigrationComplete)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::DryRunFailed | Self::MigrationFailed | Self::RolledBack
        )
    }

    /// The execution pipeline currently owns the repository.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::DryRunQueued
                | Self::DryRunInProgress
                | Self::PreMigration
                | Self::QueuedForMigration
                | Self::MigratingContent
                | Self::ArchiveGenerating
                | Self::PostMigration
        )
    }
}

tag_enum! {
    /// Lifecycle state of a batch.
    ///
    /// `pending` and `ready` are derived from member statuses; every other
    /// status is set explicitly by the execution pipeline.
    pub enum BatchStatus {
        Pending => "pending",
        Ready => "ready",
        InProgress => "in_progress",
        Complete => "complete",
        CompletedWithErrors => "completed_with_errors",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::CompletedWithErrors | Self::Failed | Self::Cancelled
        )
    }
}

/// Derive a batch's status from its current status and its members' statuses.
///
/// An `in_progress` batch is returned unchanged. Otherwise the batch is
/// `ready` iff it has at least one member and every member is
/// `dry_run_complete`; anything else (empty, mixed, pending, failed) is
/// `pending`.
pub fn derive_batch_status<I>(current: BatchStatus, members: I) -> BatchStatus
where
    I: IntoIterator<Item = RepositoryStatus>,
{
    if current == BatchStatus::InProgress {
        return current;
    }

    let mut any = false;
    for status in members {
        if status != RepositoryStatus::DryRunComplete {
            return BatchStatus::Pending;
        }
        any = true;
    }

    if any {
        BatchStatus::Ready
    } else {
        BatchStatus::Pending
    }
}
