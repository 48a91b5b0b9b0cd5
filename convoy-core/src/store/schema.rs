/// Current schema version.
pub const SCHEMA_VERSION: &str = "1";

/// Full SQL schema for Convoy's `SQLite` database.
pub const SCHEMA_SQL: &str = r"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS convoy_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Operator-defined migration batches
CREATE TABLE IF NOT EXISTS batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    repository_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    scheduled_at TEXT,
    started_at TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status);

-- The repository ledger
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    full_name TEXT NOT NULL UNIQUE,
    organization TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    batch_id INTEGER REFERENCES batches(id) ON DELETE SET NULL,
    complexity_score INTEGER,
    total_size INTEGER,
    is_archived INTEGER NOT NULL DEFAULT 0,
    is_fork INTEGER NOT NULL DEFAULT 0,
    profile TEXT NOT NULL DEFAULT '{}',
    rollback_count INTEGER NOT NULL DEFAULT 0,
    discovered_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    migrated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_repositories_status ON repositories(status);
CREATE INDEX IF NOT EXISTS idx_repositories_batch ON repositories(batch_id);
CREATE INDEX IF NOT EXISTS idx_repositories_org ON repositories(organization);

-- Dependency edges, replaced wholesale per repository on re-discovery
CREATE TABLE IF NOT EXISTS repository_dependencies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    dependency_full_name TEXT NOT NULL,
    dependency_type TEXT NOT NULL,
    is_local INTEGER NOT NULL DEFAULT 0,
    detected_at TEXT NOT NULL,
    UNIQUE(repository_id, dependency_full_name, dependency_type)
);
CREATE INDEX IF NOT EXISTS idx_deps_repo ON repository_dependencies(repository_id);
CREATE INDEX IF NOT EXISTS idx_deps_target ON repository_dependencies(dependency_full_name);

-- Audit trail of migration attempts and rollbacks
CREATE TABLE IF NOT EXISTS migration_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    phase TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    duration_seconds INTEGER
);
CREATE INDEX IF NOT EXISTS idx_history_repo ON migration_history(repository_id);

-- Discovery runs: the active run plus the most recent terminal run
CREATE TABLE IF NOT EXISTS discovery_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT NOT NULL,
    status TEXT NOT NULL,
    phase TEXT NOT NULL,
    total_orgs INTEGER NOT NULL DEFAULT 0,
    processed_orgs INTEGER NOT NULL DEFAULT 0,
    total_repos INTEGER NOT NULL DEFAULT 0,
    processed_repos INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);
-- At most one in-progress run, enforced by the store itself
CREATE UNIQUE INDEX IF NOT EXISTS uq_discovery_single_active
    ON discovery_runs(status) WHERE status = 'in_progress';
";

/// `SQLite` PRAGMAs for performance.
pub const PRAGMAS_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA foreign_keys = ON;
";
