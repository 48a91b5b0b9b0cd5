use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{BatchStatus, RepositoryStatus};

// ── Typed ID wrappers ──────────────────────────────────────────────

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

typed_id!(RepositoryId);
typed_id!(BatchId);
typed_id!(DiscoveryRunId);
typed_id!(HistoryEntryId);

// ── String-tagged enums ────────────────────────────────────────────

/// A stored tag that does not name any known variant.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a fieldless enum persisted as a `snake_case` text tag, with
/// `as_str`, `Display`, `FromStr` and serde impls that agree on the tag.
macro_rules! tag_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $tag:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $tag)] $variant, )+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $tag, )+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::types::UnknownTag;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $tag => Ok(Self::$variant), )+
                    other => Err($crate::types::UnknownTag {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub(crate) use tag_enum;

// ── Repositories ───────────────────────────────────────────────────

/// A repository tracked by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    /// `org/name`, or `org/project/name` on nested hosting systems.
    pub full_name: String,
    /// First path segment of `full_name`; the grouping key for planning.
    pub organization: String,
    pub status: RepositoryStatus,
    pub batch_id: Option<BatchId>,
    /// Externally computed risk/size proxy. `None` until profiled.
    pub complexity_score: Option<i64>,
    /// Repository size in bytes as reported by the source.
    pub total_size: Option<i64>,
    pub is_archived: bool,
    pub is_fork: bool,
    /// Opaque validation flags supplied by the profiling component.
    pub profile: HashMap<String, serde_json::Value>,
    /// How many times this repository has been rolled back. Distinguishes a
    /// first-time `pending` from a post-rollback `pending`.
    pub rollback_count: u32,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub migrated_at: Option<DateTime<Utc>>,
}

impl Repository {
    /// Whether this repository may be placed into a batch right now.
    pub fn is_assignable(&self) -> bool {
        self.batch_id.is_none() && self.status.is_assignable()
    }
}

/// Identity and profile data for a repository as seen by discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveredRepository {
    pub full_name: String,
    pub complexity_score: Option<i64>,
    pub total_size: Option<i64>,
    pub is_archived: bool,
    pub is_fork: bool,
    pub profile: HashMap<String, serde_json::Value>,
    /// Outgoing dependency edges found while profiling.
    pub dependencies: Vec<NewDependency>,
}

impl DiscoveredRepository {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            ..Default::default()
        }
    }
}

/// The organization segment of a full name (`org/repo` → `org`).
pub fn organization_of(full_name: &str) -> &str {
    full_name.split('/').next().unwrap_or(full_name)
}

// ── Dependencies ───────────────────────────────────────────────────

tag_enum! {
    /// How one repository references another.
    pub enum DependencyType {
        Submodule => "submodule",
        WorkflowReference => "workflow_reference",
        Package => "package",
        Other => "other",
    }
}

/// A directed dependency edge: `repository_id` depends on `dependency_full_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub repository_id: RepositoryId,
    pub dependency_full_name: String,
    pub dependency_type: DependencyType,
    /// True iff the target repository exists in the ledger.
    pub is_local: bool,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDependency {
    pub dependency_full_name: String,
    pub dependency_type: DependencyType,
}

impl NewDependency {
    pub fn new(target: impl Into<String>, dependency_type: DependencyType) -> Self {
        Self {
            dependency_full_name: target.into(),
            dependency_type,
        }
    }
}

// ── Batches ────────────────────────────────────────────────────────

tag_enum! {
    pub enum BatchKind {
        /// A small, low-risk first batch.
        Pilot => "pilot",
        Wave => "wave",
        Custom => "custom",
    }
}

/// An operator-defined group of repositories migrated together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub description: Option<String>,
    pub kind: BatchKind,
    pub status: BatchStatus,
    /// Denormalized member count, recomputed on every membership change.
    pub repository_count: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatch {
    pub name: String,
    pub description: Option<String>,
    pub kind: BatchKind,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewBatch {
    pub fn new(name: impl Into<String>, kind: BatchKind) -> Self {
        Self {
            name: name.into(),
            description: None,
            kind,
            scheduled_at: None,
        }
    }
}

// ── Migration history ──────────────────────────────────────────────

tag_enum! {
    pub enum MigrationPhase {
        DryRun => "dry_run",
        Migration => "migration",
        Rollback => "rollback",
    }
}

tag_enum! {
    pub enum HistoryStatus {
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
    }
}

/// One audit record in a repository's migration history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: HistoryEntryId,
    pub repository_id: RepositoryId,
    pub phase: MigrationPhase,
    pub status: HistoryStatus,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHistoryEntry {
    pub phase: MigrationPhase,
    pub status: HistoryStatus,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Discovery runs ─────────────────────────────────────────────────

tag_enum! {
    pub enum DiscoveryStatus {
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl DiscoveryStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::InProgress
    }
}

tag_enum! {
    /// Progress marker inside an `in_progress` run, set by the caller.
    pub enum DiscoveryPhase {
        Listing => "listing",
        Processing => "processing",
        Completed => "completed",
        Cancelling => "cancelling",
    }
}

/// A background fleet-inventory run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRun {
    pub id: DiscoveryRunId,
    /// The organization or enterprise being inventoried.
    pub target: String,
    pub status: DiscoveryStatus,
    pub phase: DiscoveryPhase,
    pub total_orgs: u64,
    pub processed_orgs: u64,
    pub total_repos: u64,
    pub processed_repos: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DiscoveryRun {
    pub fn is_active(&self) -> bool {
        self.status == DiscoveryStatus::InProgress
    }
}

// ── Store query types ──────────────────────────────────────────────

/// Filter for listing repositories from the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryFilter {
    /// Only return repositories in one of these statuses (empty = any).
    pub statuses: Vec<RepositoryStatus>,
    /// Only return repositories in this organization.
    pub organization: Option<String>,
    /// Only return members of this batch.
    pub batch_id: Option<BatchId>,
    /// Only return repositories with no batch.
    pub unbatched: bool,
    /// Only return repositories whose full name contains this substring.
    pub name_contains: Option<String>,
    /// Maximum number of results to return.
    pub limit: Option<u32>,
}

impl RepositoryFilter {
    pub fn with_status(status: RepositoryStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    #[must_use]
    pub fn in_organization(mut self, organization: Option<&str>) -> Self {
        self.organization = organization.map(str::to_string);
        self
    }
}

/// Filter for listing batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchFilter {
    pub status: Option<BatchStatus>,
    pub kind: Option<BatchKind>,
}
