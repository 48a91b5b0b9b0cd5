//! Dialect-specific SQL fragments.
//!
//! Store implementations build every backend-specific fragment (boolean
//! literals, timestamp encoding, date comparisons) through a [`SqlDialect`].
//! Nothing above the store layer constructs SQL.

use chrono::{DateTime, SecondsFormat, Utc};

pub trait SqlDialect: Send + Sync + std::fmt::Debug {
    /// Literal for a boolean column value.
    fn bool_literal(&self, value: bool) -> &'static str;

    /// Encode a timestamp for storage. Encoded values must order the same way
    /// as the instants they represent.
    fn encode_timestamp(&self, ts: DateTime<Utc>) -> String;

    /// Predicate: `column` holds an instant strictly earlier than the
    /// timestamp bound to positional parameter `param`.
    fn earlier_than(&self, column: &str, param: usize) -> String;
}

/// `SQLite`: integer booleans and fixed-width RFC 3339 text timestamps, which
/// compare correctly as strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn bool_literal(&self, value: bool) -> &'static str {
        if value { "1" } else { "0" }
    }

    fn encode_timestamp(&self, ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn earlier_than(&self, column: &str, param: usize) -> String {
        format!("julianday({column}) < julianday(?{param})")
    }
}
