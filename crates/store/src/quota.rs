//! Daily quota counters.
//!
//! Admission is a single conditional upsert so concurrent requests can
//! never push a counter past the plan limit. Windows roll over by key
//! (UTC day stamp); stale rows are left behind and are harmless.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rusqlite::params;

use fl_domain::Result;

use crate::{storage, Store};

/// The admission resource name used by the chat path.
pub const RESOURCE_RCA: &str = "rca_request";

/// Outcome of a quota admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Admitted,
    Exceeded,
}

impl Store {
    /// Atomically increment `(workspace, resource, window)` iff the count
    /// is below `limit`.
    pub fn quota_try_admit(
        &self,
        workspace_id: &str,
        resource: &str,
        window_key: &str,
        limit: u32,
    ) -> Result<QuotaDecision> {
        if limit == 0 {
            return Ok(QuotaDecision::Exceeded);
        }
        self.with(|conn| {
            // The WHERE on the DO UPDATE arm makes the increment
            // conditional; when the counter is at the limit no row
            // changes and `changes()` reports 0.
            let n = conn
                .execute(
                    "INSERT INTO quota_counters (workspace_id, resource, window_key, count)
                     VALUES (?1, ?2, ?3, 1)
                     ON CONFLICT(workspace_id, resource, window_key)
                     DO UPDATE SET count = count + 1 WHERE count < ?4",
                    params![workspace_id, resource, window_key, limit as i64],
                )
                .map_err(storage)?;
            Ok(if n > 0 {
                QuotaDecision::Admitted
            } else {
                QuotaDecision::Exceeded
            })
        })
    }

    pub fn quota_count(
        &self,
        workspace_id: &str,
        resource: &str,
        window_key: &str,
    ) -> Result<u32> {
        self.with(|conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COALESCE(
                        (SELECT count FROM quota_counters
                         WHERE workspace_id = ?1 AND resource = ?2 AND window_key = ?3), 0)",
                    params![workspace_id, resource, window_key],
                    |row| row.get(0),
                )
                .map_err(storage)?;
            Ok(n as u32)
        })
    }
}

/// UTC day stamp, e.g. `2026-08-01`.
pub fn window_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Next UTC midnight after `now`; reported to callers as `reset_at`.
pub fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    Utc.with_ymd_and_hms(tomorrow.year(), tomorrow.month(), tomorrow.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}
