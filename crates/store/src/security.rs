//! Append-only prompt-guard audit log.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use fl_domain::Result;

use crate::{parse_ts, parse_uuid, storage, ts, Store};

/// Characters of the offending message retained in the log.
pub const MESSAGE_PREFIX_MAX: usize = 300;

#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub workspace_id: String,
    /// Guard verdict that triggered the record: `block` or `degraded`.
    pub classification: String,
    pub message_prefix: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub fn record_security_event(
        &self,
        workspace_id: &str,
        classification: &str,
        message: &str,
        reason: Option<&str>,
    ) -> Result<SecurityEvent> {
        let now = Utc::now();
        let prefix: String = message.chars().take(MESSAGE_PREFIX_MAX).collect();
        let event = SecurityEvent {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.to_owned(),
            classification: classification.to_owned(),
            message_prefix: prefix,
            reason: reason.map(str::to_owned),
            created_at: now,
        };
        self.with(|conn| {
            conn.execute(
                "INSERT INTO security_events
                   (id, workspace_id, classification, message_prefix, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id.to_string(),
                    event.workspace_id,
                    event.classification,
                    event.message_prefix,
                    event.reason,
                    ts(now),
                ],
            )
            .map_err(storage)?;
            Ok(())
        })?;
        Ok(event)
    }

    pub fn list_security_events(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<SecurityEvent>> {
        self.with(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, workspace_id, classification, message_prefix, reason, created_at
                     FROM security_events WHERE workspace_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![workspace_id, limit as i64], event_from_row)
                .map_err(storage)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage)??);
            }
            Ok(out)
        })
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Result<SecurityEvent>> {
    Ok(build_event(row))
}

fn build_event(row: &Row<'_>) -> Result<SecurityEvent> {
    let id: String = row.get(0).map_err(storage)?;
    let created: String = row.get(5).map_err(storage)?;
    Ok(SecurityEvent {
        id: parse_uuid(&id)?,
        workspace_id: row.get(1).map_err(storage)?,
        classification: row.get(2).map_err(storage)?,
        message_prefix: row.get(3).map_err(storage)?,
        reason: row.get(4).map_err(storage)?,
        created_at: parse_ts(&created)?,
    })
}
