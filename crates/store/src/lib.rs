//! Durable storage for Faultline, backed by SQLite.
//!
//! The database is the only source of truth: jobs, turns, steps, quota
//! counters, and security events all live here. Every multi-row change
//! that must stay consistent (job + turn status pairs, step sequence
//! assignment) happens inside one transaction.
//!
//! All tables are scoped by workspace id; the query layer takes the
//! workspace for every read so cross-tenant access is impossible by
//! construction.

mod integrations;
mod jobs;
mod quota;
mod schema;
mod security;
mod sessions;
mod turns;

pub use integrations::{IntegrationRow, LlmConfigRow, LlmProviderKind};
pub use jobs::ClaimOutcome;
pub use quota::{next_reset, window_key, QuotaDecision, RESOURCE_RCA};
pub use security::{SecurityEvent, MESSAGE_PREFIX_MAX};
pub use sessions::NewSession;

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use fl_domain::{Error, Result};

/// Handle to the Faultline database.
///
/// Cheap to share behind an `Arc`; the inner connection is serialized by a
/// mutex. Individual statements are short (a few ms) so contention is not a
/// concern at the intended scale; heavier deployments can point `path` at
/// a shared volume and run several processes (SQLite WAL handles the
/// cross-process locking).
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(storage)?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure with the locked connection.
    pub(crate) fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside an exclusive transaction.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(storage)?;
        let out = f(&tx)?;
        tx.commit().map_err(storage)?;
        Ok(out)
    }

    /// Liveness probe used by the health endpoint.
    pub fn ping(&self) -> bool {
        self.with(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(storage)
        })
        .is_ok()
    }
}

// ── shared row helpers ──────────────────────────────────────────────

pub(crate) fn storage(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

/// UTC timestamp as a sortable string (millisecond precision). Stored
/// timestamps compare correctly both in SQL and after parsing.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp '{s}': {e}")))
}

pub(crate) fn parse_uuid(s: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s).map_err(|e| Error::Storage(format!("bad uuid '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_ping() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.ping());
    }

    #[test]
    fn open_on_disk_creates_parent_dirs(){
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/faultline.db");
        let store = Store::open(&path).unwrap();
        assert!(store.ping());
        assert!(path.exists());
    }

    #[test]
    fn timestamps_round_trip_sortably() {
        let now = Utc::now();
        let s = ts(now);
        let back = parse_ts(&s).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());

        let earlier = ts(now - chrono::Duration::seconds(5));
        assert!(earlier < s);
    }
}
