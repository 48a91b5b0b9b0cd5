use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use crate::error::{DiscoveryError, LedgerError, StoreError};
use crate::status::{BatchStatus, RepositoryStatus, derive_batch_status};
use crate::types::{
    Batch, BatchFilter, BatchId, DependencyEdge, DiscoveredRepository, DiscoveryPhase,
    DiscoveryRun, DiscoveryRunId, DiscoveryStatus, HistoryEntry, HistoryEntryId, NewBatch,
    NewDependency, NewHistoryEntry, Repository, RepositoryFilter, RepositoryId, UnknownTag,
    organization_of,
};

use super::MigrationStore;
use super::dialect::{SqlDialect, SqliteDialect};
use super::schema;

const REPO_COLUMNS: &str = "id, full_name, organization, status, batch_id, complexity_score, \
     total_size, is_archived, is_fork, profile, rollback_count, discovered_at, updated_at, \
     migrated_at";

/// Maximum bound parameters per `IN (...)` list.
const IN_CHUNK: usize = 500;

/// SQLite-backed implementation of `MigrationStore`.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    dialect: SqliteDialect,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> crate::error::Result<Self> {
        let conn = Connection::open(path).map_err(StoreError::Sqlite)?;
        let store = Self {
            conn: Mutex::new(conn),
            dialect: SqliteDialect,
            db_path: Some(path.to_path_buf()),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> crate::error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::Sqlite)?;
        let store = Self {
            conn: Mutex::new(conn),
            dialect: SqliteDialect,
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Path of the backing database file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn initialize(&self) -> crate::error::Result<()> {
        let conn = self.lock()?;

        if self.db_path.is_some() {
            conn.execute_batch(schema::PRAGMAS_SQL)
                .map_err(StoreError::Sqlite)?;
        } else {
            // WAL does not apply to in-memory databases
            conn.execute_batch("PRAGMA foreign_keys = ON;")
                .map_err(StoreError::Sqlite)?;
        }

        conn.execute_batch(schema::SCHEMA_SQL)
            .map_err(StoreError::Sqlite)?;

        conn.execute(
            "INSERT OR IGNORE INTO convoy_meta (key, value) VALUES ('schema_version', ?1)",
            params![schema::SCHEMA_VERSION],
        )
        .map_err(StoreError::Sqlite)?;

        let version: String = conn
            .query_row(
                "SELECT value FROM convoy_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        if version != schema::SCHEMA_VERSION {
            return Err(StoreError::Migration(format!(
                "database schema version {version} does not match supported version {}",
                schema::SCHEMA_VERSION
            ))
            .into());
        }

        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn now(&self) -> String {
        self.dialect.encode_timestamp(Utc::now())
    }

    // ── Row helpers ────────────────────────────────────────────────

    fn row_to_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
        let profile: String = row.get("profile")?;
        Ok(Repository {
            id: RepositoryId(row.get("id")?),
            full_name: row.get("full_name")?,
            organization: row.get("organization")?,
            status: decode(&row.get::<_, String>("status")?)?,
            batch_id: row.get::<_, Option<i64>>("batch_id")?.map(BatchId),
            complexity_score: row.get("complexity_score")?,
            total_size: row.get("total_size")?,
            is_archived: row.get("is_archived")?,
            is_fork: row.get("is_fork")?,
            profile: serde_json::from_str(&profile).unwrap_or_default(),
            rollback_count: row.get("rollback_count")?,
            discovered_at: parse_ts(&row.get::<_, String>("discovered_at")?),
            updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
            migrated_at: row
                .get::<_, Option<String>>("migrated_at")?
                .as_deref()
                .map(parse_ts),
        })
    }

    fn row_to_batch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Batch> {
        Ok(Batch {
            id: BatchId(row.get("id")?),
            name: row.get("name")?,
            description: row.get("description")?,
            kind: decode(&row.get::<_, String>("kind")?)?,
            status: decode(&row.get::<_, String>("status")?)?,
            repository_count: row.get("repository_count")?,
            created_at: parse_ts(&row.get::<_, String>("created_at")?),
            scheduled_at: opt_ts(row, "scheduled_at")?,
            started_at: opt_ts(row, "started_at")?,
            completed_at: opt_ts(row, "completed_at")?,
        })
    }

    fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<DependencyEdge> {
        Ok(DependencyEdge {
            repository_id: RepositoryId(row.get("repository_id")?),
            dependency_full_name: row.get("dependency_full_name")?,
            dependency_type: decode(&row.get::<_, String>("dependency_type")?)?,
            is_local: row.get("is_local")?,
            detected_at: parse_ts(&row.get::<_, String>("detected_at")?),
        })
    }

    fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
        Ok(HistoryEntry {
            id: HistoryEntryId(row.get("id")?),
            repository_id: RepositoryId(row.get("repository_id")?),
            phase: decode(&row.get::<_, String>("phase")?)?,
            status: decode(&row.get::<_, String>("status")?)?,
            message: row.get("message")?,
            started_at: parse_ts(&row.get::<_, String>("started_at")?),
            completed_at: opt_ts(row, "completed_at")?,
            duration_seconds: row.get("duration_seconds")?,
        })
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<DiscoveryRun> {
        Ok(DiscoveryRun {
            id: DiscoveryRunId(row.get("id")?),
            target: row.get("target")?,
            status: decode(&row.get::<_, String>("status")?)?,
            phase: decode(&row.get::<_, String>("phase")?)?,
            total_orgs: row.get("total_orgs")?,
            processed_orgs: row.get("processed_orgs")?,
            total_repos: row.get("total_repos")?,
            processed_repos: row.get("processed_repos")?,
            error_count: row.get("error_count")?,
            last_error: row.get("last_error")?,
            started_at: parse_ts(&row.get::<_, String>("started_at")?),
            completed_at: opt_ts(row, "completed_at")?,
        })
    }

    fn repository_by_name(conn: &Connection, full_name: &str) -> rusqlite::Result<Option<Repository>> {
        conn.query_row(
            &format!("SELECT {REPO_COLUMNS} FROM repositories WHERE full_name = ?1"),
            params![full_name],
            Self::row_to_repository,
        )
        .optional()
    }

    fn batch_by_id(conn: &Connection, id: BatchId) -> rusqlite::Result<Option<Batch>> {
        conn.query_row(
            "SELECT * FROM batches WHERE id = ?1",
            params![id.0],
            Self::row_to_batch,
        )
        .optional()
    }

    fn run_by_id(conn: &Connection, id: DiscoveryRunId) -> rusqlite::Result<Option<DiscoveryRun>> {
        conn.query_row(
            "SELECT * FROM discovery_runs WHERE id = ?1",
            params![id.0],
            Self::row_to_run,
        )
        .optional()
    }

    fn active_run(conn: &Connection) -> rusqlite::Result<Option<DiscoveryRun>> {
        conn.query_row(
            "SELECT * FROM discovery_runs WHERE status = ?1 ORDER BY id DESC LIMIT 1",
            params![DiscoveryStatus::InProgress.as_str()],
            Self::row_to_run,
        )
        .optional()
    }

    /// Recompute a batch's member count and, unless it is in flight, its
    /// derived status. Must run inside the transaction that changed membership
    /// or member status. A missing batch is ignored.
    fn refresh_batch(conn: &Connection, batch_id: BatchId) -> rusqlite::Result<()> {
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM batches WHERE id = ?1",
                params![batch_id.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(());
        };
        let current: BatchStatus = decode(&current)?;

        let mut stmt =
            conn.prepare_cached("SELECT status FROM repositories WHERE batch_id = ?1")?;
        let members = stmt
            .query_map(params![batch_id.0], |row| {
                decode::<RepositoryStatus>(&row.get::<_, String>(0)?)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let derived = derive_batch_status(current, members.iter().copied());
        conn.execute(
            "UPDATE batches SET repository_count = ?1, status = ?2 WHERE id = ?3",
            params![to_i64(members.len() as u64), derived.as_str(), batch_id.0],
        )?;

        if derived != current {
            debug!(
                batch_id = batch_id.0,
                from = %current,
                to = %derived,
                members = members.len(),
                "Batch status re-derived"
            );
        }
        Ok(())
    }

    fn insert_history(
        conn: &Connection,
        dialect: &SqliteDialect,
        repository_id: RepositoryId,
        entry: &NewHistoryEntry,
    ) -> rusqlite::Result<HistoryEntryId> {
        let duration = entry
            .completed_at
            .map(|done| (done - entry.started_at).num_seconds());
        conn.execute(
            "INSERT INTO migration_history
                (repository_id, phase, status, message, started_at, completed_at, duration_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                repository_id.0,
                entry.phase.as_str(),
                entry.status.as_str(),
                entry.message,
                dialect.encode_timestamp(entry.started_at),
                entry.completed_at.map(|t| dialect.encode_timestamp(t)),
                duration,
            ],
        )?;
        Ok(HistoryEntryId(conn.last_insert_rowid()))
    }

    /// Build the repository listing query for a filter. With `assignable_only`
    /// the batch-assignment predicate is applied on top of the filter.
    fn repository_query(
        filter: &RepositoryFilter,
        assignable_only: bool,
    ) -> (String, Vec<Box<dyn ToSql>>) {
        let mut sql = format!("SELECT {REPO_COLUMNS} FROM repositories WHERE 1=1");
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if !filter.statuses.is_empty() {
            sql.push_str(" AND status IN (");
            for (i, status) in filter.statuses.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                let _ = write!(sql, "?{}", values.len() + 1);
                values.push(Box::new(status.as_str()));
            }
            sql.push(')');
        }
        if let Some(org) = &filter.organization {
            let _ = write!(sql, " AND organization = ?{}", values.len() + 1);
            values.push(Box::new(org.clone()));
        }
        if let Some(batch_id) = filter.batch_id {
            let _ = write!(sql, " AND batch_id = ?{}", values.len() + 1);
            values.push(Box::new(batch_id.0));
        }
        if filter.unbatched || assignable_only {
            sql.push_str(" AND batch_id IS NULL");
        }
        if assignable_only {
            sql.push_str(" AND status NOT IN (");
            for (i, status) in RepositoryStatus::NOT_ASSIGNABLE.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                let _ = write!(sql, "?{}", values.len() + 1);
                values.push(Box::new(status.as_str()));
            }
            sql.push(')');
        }
        if let Some(contains) = &filter.name_contains {
            let _ = write!(sql, " AND full_name LIKE ?{}", values.len() + 1);
            values.push(Box::new(format!("%{contains}%")));
        }
        sql.push_str(" ORDER BY id");
        if let Some(limit) = filter.limit {
            let _ = write!(sql, " LIMIT {limit}");
        }
        (sql, values)
    }

    fn query_repositories(
        &self,
        filter: &RepositoryFilter,
        assignable_only: bool,
    ) -> crate::error::Result<Vec<Repository>> {
        let conn = self.lock()?;
        let (sql, values) = Self::repository_query(filter, assignable_only);
        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn ToSql> = values.iter().map(AsRef::as_ref).collect();
        let repos = stmt
            .query_map(params_ref.as_slice(), Self::row_to_repository)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(repos)
    }

    fn update_run(&self, id: DiscoveryRunId, sql: &str, values: &[&dyn ToSql]) -> crate::error::Result<()> {
        let conn = self.lock()?;
        let affected = conn.execute(sql, values)?;
        if affected == 0 {
            return Err(DiscoveryError::NotFound(id).into());
        }
        Ok(())
    }
}

/// Parse a stored tag, surfacing unknown tags as a conversion failure.
fn decode<T>(raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = UnknownTag>,
{
    raw.parse().map_err(|e: UnknownTag| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

fn opt_ts(row: &rusqlite::Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<String>>(column)?.as_deref().map(parse_ts))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait::async_trait]
impl MigrationStore for SqliteStore {
    // ── Repository ledger ──────────────────────────────────────────

    async fn upsert_repository(
        &self,
        repo: &DiscoveredRepository,
    ) -> crate::error::Result<RepositoryId> {
        let mut conn = self.lock()?;
        let now = self.now();
        let profile = serde_json::to_string(&repo.profile)?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO repositories
                (full_name, organization, complexity_score, total_size, is_archived, is_fork,
                 profile, discovered_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(full_name) DO UPDATE SET
                complexity_score = excluded.complexity_score,
                total_size = excluded.total_size,
                is_archived = excluded.is_archived,
                is_fork = excluded.is_fork,
                profile = excluded.profile,
                updated_at = excluded.updated_at",
            params![
                repo.full_name,
                organization_of(&repo.full_name),
                repo.complexity_score,
                repo.total_size,
                repo.is_archived,
                repo.is_fork,
                profile,
                now,
            ],
        )?;

        // last_insert_rowid() is stale after ON CONFLICT DO UPDATE
        let id: i64 = tx.query_row(
            "SELECT id FROM repositories WHERE full_name = ?1",
            params![repo.full_name],
            |row| row.get(0),
        )?;

        // Edges recorded before this repository was known now point inside the fleet.
        tx.execute(
            &format!(
                "UPDATE repository_dependencies SET is_local = {}
                 WHERE dependency_full_name = ?1 AND is_local = {}",
                self.dialect.bool_literal(true),
                self.dialect.bool_literal(false),
            ),
            params![repo.full_name],
        )?;

        tx.commit()?;
        Ok(RepositoryId(id))
    }

    async fn get_repository(&self, full_name: &str) -> crate::error::Result<Option<Repository>> {
        let conn = self.lock()?;
        Ok(Self::repository_by_name(&conn, full_name)?)
    }

    async fn get_repository_by_id(
        &self,
        id: RepositoryId,
    ) -> crate::error::Result<Option<Repository>> {
        let conn = self.lock()?;
        let repo = conn
            .query_row(
                &format!("SELECT {REPO_COLUMNS} FROM repositories WHERE id = ?1"),
                params![id.0],
                Self::row_to_repository,
            )
            .optional()?;
        Ok(repo)
    }

    async fn find_repositories(
        &self,
        filter: &RepositoryFilter,
    ) -> crate::error::Result<Vec<Repository>> {
        self.query_repositories(filter, false)
    }

    async fn find_assignable_repositories(
        &self,
        filter: &RepositoryFilter,
    ) -> crate::error::Result<Vec<Repository>> {
        self.query_repositories(filter, true)
    }

    async fn set_repository_status(
        &self,
        full_name: &str,
        status: RepositoryStatus,
        migrated_at: Option<DateTime<Utc>>,
    ) -> crate::error::Result<Repository> {
        let mut conn = self.lock()?;
        let now = self.now();
        let migrated = migrated_at.map(|t| self.dialect.encode_timestamp(t));
        let tx = conn.transaction()?;

        let affected = tx.execute(
            "UPDATE repositories
             SET status = ?1, updated_at = ?2, migrated_at = COALESCE(?3, migrated_at)
             WHERE full_name = ?4",
            params![status.as_str(), now, migrated, full_name],
        )?;
        if affected == 0 {
            return Err(LedgerError::RepositoryNotFound(full_name.to_string()).into());
        }

        let repo = Self::repository_by_name(&tx, full_name)?
            .ok_or_else(|| LedgerError::RepositoryNotFound(full_name.to_string()))?;
        if let Some(batch_id) = repo.batch_id {
            Self::refresh_batch(&tx, batch_id)?;
        }

        tx.commit()?;
        Ok(repo)
    }

    async fn rollback_repository(
        &self,
        full_name: &str,
        audit: &NewHistoryEntry,
    ) -> crate::error::Result<Repository> {
        let mut conn = self.lock()?;
        let now = self.now();
        let tx = conn.transaction()?;

        let before = Self::repository_by_name(&tx, full_name)?
            .ok_or_else(|| LedgerError::RepositoryNotFound(full_name.to_string()))?;

        tx.execute(
            "UPDATE repositories
             SET status = ?1, batch_id = NULL, rollback_count = rollback_count + 1, updated_at = ?2
             WHERE id = ?3",
            params![RepositoryStatus::RolledBack.as_str(), now, before.id.0],
        )?;
        Self::insert_history(&tx, &self.dialect, before.id, audit)?;
        if let Some(batch_id) = before.batch_id {
            Self::refresh_batch(&tx, batch_id)?;
        }

        let after = Self::repository_by_name(&tx, full_name)?
            .ok_or_else(|| LedgerError::RepositoryNotFound(full_name.to_string()))?;
        tx.commit()?;
        Ok(after)
    }

    async fn status_counts(&self) -> crate::error::Result<BTreeMap<RepositoryStatus, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM repositories GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((
                    decode::<RepositoryStatus>(&row.get::<_, String>(0)?)?,
                    row.get::<_, u64>(1)?,
                ))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(counts)
    }

    // ── Dependency edges ───────────────────────────────────────────

    async fn replace_dependencies(
        &self,
        full_name: &str,
        edges: &[NewDependency],
    ) -> crate::error::Result<usize> {
        let mut conn = self.lock()?;
        let now = self.now();
        let tx = conn.transaction()?;

        let repo_id: i64 = tx
            .query_row(
                "SELECT id FROM repositories WHERE full_name = ?1",
                params![full_name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| LedgerError::RepositoryNotFound(full_name.to_string()))?;

        tx.execute(
            "DELETE FROM repository_dependencies WHERE repository_id = ?1",
            params![repo_id],
        )?;

        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO repository_dependencies
                    (repository_id, dependency_full_name, dependency_type, is_local, detected_at)
                 VALUES (?1, ?2, ?3,
                    EXISTS (SELECT 1 FROM repositories WHERE full_name = ?2), ?4)",
            )?;
            for edge in edges {
                written += stmt.execute(params![
                    repo_id,
                    edge.dependency_full_name,
                    edge.dependency_type.as_str(),
                    now,
                ])?;
            }
        }

        tx.commit()?;
        Ok(written)
    }

    async fn get_dependencies(
        &self,
        full_name: &str,
    ) -> crate::error::Result<Vec<DependencyEdge>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT d.* FROM repository_dependencies d
             JOIN repositories r ON r.id = d.repository_id
             WHERE r.full_name = ?1
             ORDER BY d.id",
        )?;
        let edges = stmt
            .query_map(params![full_name], Self::row_to_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    async fn local_dependencies(
        &self,
        full_names: &[String],
    ) -> crate::error::Result<HashMap<String, Vec<String>>> {
        let conn = self.lock()?;
        let mut map: HashMap<String, Vec<String>> = HashMap::new();

        for chunk in full_names.chunks(IN_CHUNK) {
            let placeholders = (1..=chunk.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT r.full_name, d.dependency_full_name
                 FROM repository_dependencies d
                 JOIN repositories r ON r.id = d.repository_id
                 WHERE d.is_local = {} AND r.full_name IN ({placeholders})
                 ORDER BY d.id",
                self.dialect.bool_literal(true),
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (source, target) = row?;
                let targets = map.entry(source).or_default();
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        Ok(map)
    }

    async fn get_dependents(&self, full_name: &str) -> crate::error::Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT r.full_name FROM repository_dependencies d
             JOIN repositories r ON r.id = d.repository_id
             WHERE d.dependency_full_name = ?1 AND d.is_local = {}
             ORDER BY r.full_name",
            self.dialect.bool_literal(true),
        ))?;
        let names = stmt
            .query_map(params![full_name], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    async fn refresh_dependency_locality(&self) -> crate::error::Result<u64> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE repository_dependencies
             SET is_local = NOT is_local
             WHERE is_local != EXISTS (
                SELECT 1 FROM repositories r
                WHERE r.full_name = repository_dependencies.dependency_full_name
             )",
            [],
        )?;
        Ok(changed as u64)
    }

    // ── Batches ────────────────────────────────────────────────────

    async fn create_batch(&self, batch: &NewBatch) -> crate::error::Result<Batch> {
        let conn = self.lock()?;
        let now = self.now();
        let result = conn.execute(
            "INSERT INTO batches (name, description, kind, status, created_at, scheduled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                batch.name,
                batch.description,
                batch.kind.as_str(),
                BatchStatus::Pending.as_str(),
                now,
                batch.scheduled_at.map(|t| self.dialect.encode_timestamp(t)),
            ],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(LedgerError::DuplicateBatch(batch.name.clone()).into());
            }
            Err(e) => return Err(e.into()),
        }

        let id = BatchId(conn.last_insert_rowid());
        Self::batch_by_id(&conn, id)?.ok_or_else(|| LedgerError::BatchNotFound(id).into())
    }

    async fn get_batch(&self, id: BatchId) -> crate::error::Result<Option<Batch>> {
        let conn = self.lock()?;
        Ok(Self::batch_by_id(&conn, id)?)
    }

    async fn list_batches(&self, filter: &BatchFilter) -> crate::error::Result<Vec<Batch>> {
        let conn = self.lock()?;
        let mut sql = String::from("SELECT * FROM batches WHERE 1=1");
        let mut values: Vec<&dyn ToSql> = Vec::new();
        let status = filter.status.map(BatchStatus::as_str);
        let kind = filter.kind.map(crate::types::BatchKind::as_str);

        if let Some(status) = &status {
            let _ = write!(sql, " AND status = ?{}", values.len() + 1);
            values.push(status);
        }
        if let Some(kind) = &kind {
            let _ = write!(sql, " AND kind = ?{}", values.len() + 1);
            values.push(kind);
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = conn.prepare(&sql)?;
        let batches = stmt
            .query_map(values.as_slice(), Self::row_to_batch)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(batches)
    }

    async fn delete_batch(&self, id: BatchId) -> crate::error::Result<bool> {
        let mut conn = self.lock()?;
        let now = self.now();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE repositories SET batch_id = NULL, updated_at = ?1 WHERE batch_id = ?2",
            params![now, id.0],
        )?;
        let deleted = tx.execute("DELETE FROM batches WHERE id = ?1", params![id.0])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    async fn add_repositories(
        &self,
        batch_id: BatchId,
        ids: &[RepositoryId],
    ) -> crate::error::Result<u64> {
        let mut conn = self.lock()?;
        let now = self.now();
        let tx = conn.transaction()?;

        if Self::batch_by_id(&tx, batch_id)?.is_none() {
            return Ok(0);
        }

        let mut affected = 0u64;
        let mut previous: Vec<BatchId> = Vec::new();
        {
            let mut current_stmt =
                tx.prepare_cached("SELECT batch_id FROM repositories WHERE id = ?1")?;
            let mut update_stmt = tx.prepare_cached(
                "UPDATE repositories SET batch_id = ?1, updated_at = ?2 WHERE id = ?3",
            )?;
            for id in ids {
                let current: Option<Option<i64>> = current_stmt
                    .query_row(params![id.0], |row| row.get(0))
                    .optional()?;
                let Some(current) = current else {
                    continue;
                };
                if let Some(old) = current
                    .map(BatchId)
                    .filter(|old| *old != batch_id && !previous.contains(old))
                {
                    previous.push(old);
                }
                affected += update_stmt.execute(params![batch_id.0, now, id.0])? as u64;
            }
        }

        Self::refresh_batch(&tx, batch_id)?;
        for old in previous {
            Self::refresh_batch(&tx, old)?;
        }

        tx.commit()?;
        Ok(affected)
    }

    async fn remove_repositories(
        &self,
        batch_id: BatchId,
        ids: &[RepositoryId],
    ) -> crate::error::Result<u64> {
        let mut conn = self.lock()?;
        let now = self.now();
        let tx = conn.transaction()?;

        let mut affected = 0u64;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE repositories SET batch_id = NULL, updated_at = ?1
                 WHERE id = ?2 AND batch_id = ?3",
            )?;
            for id in ids {
                affected += stmt.execute(params![now, id.0, batch_id.0])? as u64;
            }
        }
        Self::refresh_batch(&tx, batch_id)?;

        tx.commit()?;
        Ok(affected)
    }

    async fn set_batch_status(
        &self,
        id: BatchId,
        status: BatchStatus,
    ) -> crate::error::Result<Batch> {
        let conn = self.lock()?;
        let now = self.now();
        let sql = if status == BatchStatus::InProgress {
            "UPDATE batches SET status = ?1, started_at = ?2, completed_at = NULL WHERE id = ?3"
        } else if status.is_terminal() {
            "UPDATE batches SET status = ?1, completed_at = ?2 WHERE id = ?3"
        } else {
            // ?2 is bound but unused: derived statuses carry no timestamp
            "UPDATE batches SET status = ?1, completed_at = NULL WHERE id = ?3"
        };
        let affected = conn.execute(sql, params![status.as_str(), now, id.0])?;
        if affected == 0 {
            return Err(LedgerError::BatchNotFound(id).into());
        }
        Self::batch_by_id(&conn, id)?.ok_or_else(|| LedgerError::BatchNotFound(id).into())
    }

    async fn batch_repositories(&self, id: BatchId) -> crate::error::Result<Vec<Repository>> {
        self.query_repositories(
            &RepositoryFilter {
                batch_id: Some(id),
                ..Default::default()
            },
            false,
        )
    }

    // ── Migration history ──────────────────────────────────────────

    async fn append_history(
        &self,
        repository_id: RepositoryId,
        entry: &NewHistoryEntry,
    ) -> crate::error::Result<HistoryEntryId> {
        let conn = self.lock()?;
        Ok(Self::insert_history(&conn, &self.dialect, repository_id, entry)?)
    }

    async fn get_history(&self, full_name: &str) -> crate::error::Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT h.* FROM migration_history h
             JOIN repositories r ON r.id = h.repository_id
             WHERE r.full_name = ?1
             ORDER BY h.id",
        )?;
        let entries = stmt
            .query_map(params![full_name], Self::row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    // ── Discovery runs ─────────────────────────────────────────────

    async fn start_discovery(
        &self,
        target: &str,
        phase: DiscoveryPhase,
    ) -> crate::error::Result<DiscoveryRun> {
        let mut conn = self.lock()?;
        let now = self.now();
        // IMMEDIATE takes the write lock up front, so the active-run check and
        // the insert cannot interleave with another writer.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(active) = Self::active_run(&tx)? {
            return Err(DiscoveryError::AlreadyRunning {
                id: active.id,
                target: active.target,
            }
            .into());
        }

        tx.execute(
            "DELETE FROM discovery_runs WHERE status != ?1",
            params![DiscoveryStatus::InProgress.as_str()],
        )?;

        let inserted = tx.execute(
            "INSERT INTO discovery_runs (target, status, phase, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                target,
                DiscoveryStatus::InProgress.as_str(),
                phase.as_str(),
                now
            ],
        );
        if let Err(e) = inserted {
            if is_constraint_violation(&e) {
                if let Some(active) = Self::active_run(&tx)? {
                    return Err(DiscoveryError::AlreadyRunning {
                        id: active.id,
                        target: active.target,
                    }
                    .into());
                }
            }
            return Err(e.into());
        }
        let id = DiscoveryRunId(tx.last_insert_rowid());
        tx.commit()?;

        Self::run_by_id(&conn, id)?.ok_or_else(|| DiscoveryError::NotFound(id).into())
    }

    async fn update_discovery_phase(
        &self,
        id: DiscoveryRunId,
        phase: DiscoveryPhase,
    ) -> crate::error::Result<()> {
        self.update_run(
            id,
            "UPDATE discovery_runs SET phase = ?1 WHERE id = ?2",
            params![phase.as_str(), id.0],
        )
    }

    async fn update_discovery_repo_progress(
        &self,
        id: DiscoveryRunId,
        processed: u64,
        total: u64,
    ) -> crate::error::Result<()> {
        self.update_run(
            id,
            "UPDATE discovery_runs SET processed_repos = ?1, total_repos = ?2 WHERE id = ?3",
            params![to_i64(processed), to_i64(total), id.0],
        )
    }

    async fn update_discovery_org_progress(
        &self,
        id: DiscoveryRunId,
        processed: u64,
        total: u64,
    ) -> crate::error::Result<()> {
        self.update_run(
            id,
            "UPDATE discovery_runs SET processed_orgs = ?1, total_orgs = ?2 WHERE id = ?3",
            params![to_i64(processed), to_i64(total), id.0],
        )
    }

    async fn increment_discovery_processed(
        &self,
        id: DiscoveryRunId,
        count: u64,
    ) -> crate::error::Result<()> {
        self.update_run(
            id,
            "UPDATE discovery_runs SET processed_repos = processed_repos + ?1 WHERE id = ?2",
            params![to_i64(count), id.0],
        )
    }

    async fn increment_discovery_error(
        &self,
        id: DiscoveryRunId,
        message: &str,
    ) -> crate::error::Result<()> {
        self.update_run(
            id,
            "UPDATE discovery_runs SET error_count = error_count + 1, last_error = ?1 WHERE id = ?2",
            params![message, id.0],
        )
    }

    async fn finish_discovery(
        &self,
        id: DiscoveryRunId,
        status: DiscoveryStatus,
        phase: Option<DiscoveryPhase>,
        error: Option<&str>,
    ) -> crate::error::Result<()> {
        let now = self.now();
        self.update_run(
            id,
            "UPDATE discovery_runs
             SET status = ?1, phase = COALESCE(?2, phase), last_error = COALESCE(?3, last_error),
                 completed_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                status.as_str(),
                phase.map(DiscoveryPhase::as_str),
                error,
                now,
                id.0,
                DiscoveryStatus::InProgress.as_str(),
            ],
        )
    }

    async fn cancel_active_discovery(
        &self,
        cutoff: Option<DateTime<Utc>>,
        message: &str,
    ) -> crate::error::Result<u64> {
        let conn = self.lock()?;
        let now = self.now();
        let mut sql = String::from(
            "UPDATE discovery_runs SET status = ?1, last_error = ?2, completed_at = ?3
             WHERE status = ?4",
        );
        let cutoff = cutoff.map(|t| self.dialect.encode_timestamp(t));
        let cancelled = DiscoveryStatus::Cancelled.as_str();
        let active = DiscoveryStatus::InProgress.as_str();
        let mut values: Vec<&dyn ToSql> = vec![&cancelled, &message, &now, &active];
        if let Some(cutoff) = &cutoff {
            let _ = write!(sql, " AND {}", self.dialect.earlier_than("started_at", 5));
            values.push(cutoff);
        }
        let count = conn.execute(&sql, values.as_slice())?;
        Ok(count as u64)
    }

    async fn get_discovery(
        &self,
        id: DiscoveryRunId,
    ) -> crate::error::Result<Option<DiscoveryRun>> {
        let conn = self.lock()?;
        Ok(Self::run_by_id(&conn, id)?)
    }

    async fn active_discovery(&self) -> crate::error::Result<Option<DiscoveryRun>> {
        let conn = self.lock()?;
        Ok(Self::active_run(&conn)?)
    }

    async fn latest_discovery(&self) -> crate::error::Result<Option<DiscoveryRun>> {
        let conn = self.lock()?;
        if let Some(active) = Self::active_run(&conn)? {
            return Ok(Some(active));
        }
        let latest = conn
            .query_row(
                "SELECT * FROM discovery_runs ORDER BY id DESC LIMIT 1",
                [],
                Self::row_to_run,
            )
            .optional()?;
        Ok(latest)
    }

    async fn discovery_run_count(&self) -> crate::error::Result<u64> {
        let conn = self.lock()?;
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM discovery_runs", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }
}
