use crate::types::{BatchId, DiscoveryRunId};

/// Top-level Convoy error type.
///
/// All fallible operations in `convoy-core` return [`Result<T, ConvoyError>`](Result).
/// Each variant wraps a domain-specific error enum, so callers can match on
/// the failing component without losing type information.
#[derive(thiserror::Error, Debug)]
pub enum ConvoyError {
    /// Error from the storage layer (`SQLite` operations, schema setup).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Repository or batch lookup failed.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Discovery run lifecycle violation.
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A discovery source failed to list or describe repositories.
    #[error("Source error: {0}")]
    Source(String),
}

impl ConvoyError {
    /// True for errors that name an entity that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Ledger(LedgerError::RepositoryNotFound(_) | LedgerError::BatchNotFound(_))
                | Self::Discovery(DiscoveryError::NotFound(_))
        )
    }

    /// True for conflicts with existing state (a second active discovery run,
    /// a duplicate batch name).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Discovery(DiscoveryError::AlreadyRunning { .. })
                | Self::Ledger(LedgerError::DuplicateBatch(_))
        )
    }
}

impl From<rusqlite::Error> for ConvoyError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

impl From<serde_json::Error> for ConvoyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

/// Errors from the SQLite-backed store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying `SQLite` operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema setup failed (version mismatch or DDL error).
    #[error("Migration failed: {0}")]
    Migration(String),

    /// JSON serialization/deserialization of profile data failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A previous holder of the connection lock panicked.
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Lookup failures against the repository ledger and batches.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("A batch named '{0}' already exists")]
    DuplicateBatch(String),
}

/// Discovery lifecycle errors.
#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    /// A run is already in progress. Carries the active run so operators can
    /// inspect or cancel it.
    #[error("Discovery run {id} is already in progress for '{target}'")]
    AlreadyRunning {
        id: DiscoveryRunId,
        target: String,
    },

    /// No active discovery run with this id.
    #[error("Discovery run not found or no longer active: {0}")]
    NotFound(DiscoveryRunId),
}

/// Errors in Convoy configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Convenience alias for `Result<T, ConvoyError>`.
pub type Result<T> = std::result::Result<T, ConvoyError>;
