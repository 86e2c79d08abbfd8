//! Session queries.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use fl_domain::session::{Session, SessionOrigin, ThreadCoords};
use fl_domain::{Error, Result};

use crate::{parse_ts, parse_uuid, storage, ts, Store};

/// Inputs for creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub workspace_id: String,
    pub origin: SessionOrigin,
    pub user_id: Option<String>,
    pub thread: ThreadCoords,
    pub title: String,
}

impl Store {
    pub fn create_session(&self, new: NewSession) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            workspace_id: new.workspace_id,
            origin: new.origin,
            user_id: new.user_id,
            thread: new.thread,
            title: new.title,
            created_at: now,
            updated_at: now,
        };
        self.with(|conn| {
            conn.execute(
                "INSERT INTO sessions
                   (id, workspace_id, origin, user_id, external_channel, external_thread,
                    title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session.id.to_string(),
                    session.workspace_id,
                    session.origin.as_str(),
                    session.user_id,
                    session.thread.channel,
                    session.thread.thread,
                    session.title,
                    ts(session.created_at),
                    ts(session.updated_at),
                ],
            )
            .map_err(|e| {
                if crate::is_unique_violation(&e) {
                    Error::Validation {
                        field: "thread",
                        message: "a session already exists for this thread".into(),
                    }
                } else {
                    storage(e)
                }
            })?;
            Ok(())
        })?;
        Ok(session)
    }

    pub fn get_session(&self, workspace_id: &str, id: Uuid) -> Result<Option<Session>> {
        self.with(|conn| {
            conn.query_row(
                "SELECT id, workspace_id, origin, user_id, external_channel, external_thread,
                        title, created_at, updated_at
                 FROM sessions WHERE id = ?1 AND workspace_id = ?2",
                params![id.to_string(), workspace_id],
                session_from_row,
            )
            .optional()
            .map_err(storage)?
            .transpose()
        })
    }

    /// Chat-platform lookup by external thread coordinates.
    pub fn find_session_by_thread(
        &self,
        workspace_id: &str,
        origin: SessionOrigin,
        thread: &ThreadCoords,
    ) -> Result<Option<Session>> {
        self.with(|conn| {
            conn.query_row(
                "SELECT id, workspace_id, origin, user_id, external_channel, external_thread,
                        title, created_at, updated_at
                 FROM sessions
                 WHERE workspace_id = ?1 AND origin = ?2
                   AND external_channel = ?3 AND external_thread = ?4",
                params![
                    workspace_id,
                    origin.as_str(),
                    thread.channel,
                    thread.thread
                ],
                session_from_row,
            )
            .optional()
            .map_err(storage)?
            .transpose()
        })
    }

    /// Most-recently-updated first.
    pub fn list_sessions(
        &self,
        workspace_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        self.with(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, workspace_id, origin, user_id, external_channel, external_thread,
                            title, created_at, updated_at
                     FROM sessions WHERE workspace_id = ?1
                     ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(
                    params![workspace_id, limit as i64, offset as i64],
                    session_from_row,
                )
                .map_err(storage)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage)??);
            }
            Ok(out)
        })
    }

    pub fn rename_session(&self, workspace_id: &str, id: Uuid, title: &str) -> Result<bool> {
        self.with(|conn| {
            let n = conn
                .execute(
                    "UPDATE sessions SET title = ?1, updated_at = ?2
                     WHERE id = ?3 AND workspace_id = ?4",
                    params![title, ts(Utc::now()), id.to_string(), workspace_id],
                )
                .map_err(storage)?;
            Ok(n > 0)
        })
    }

    /// Delete a session; turns, steps, jobs, and feedback cascade.
    pub fn delete_session(&self, workspace_id: &str, id: Uuid) -> Result<bool> {
        self.with(|conn| {
            let n = conn
                .execute(
                    "DELETE FROM sessions WHERE id = ?1 AND workspace_id = ?2",
                    params![id.to_string(), workspace_id],
                )
                .map_err(storage)?;
            Ok(n > 0)
        })
    }

    pub(crate) fn touch_session(&self, id: Uuid) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![ts(Utc::now()), id.to_string()],
            )
            .map_err(storage)?;
            Ok(())
        })
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Session>> {
    Ok(build_session(row))
}

fn build_session(row: &Row<'_>) -> Result<Session> {
    let id: String = row.get(0).map_err(storage)?;
    let origin: String = row.get(2).map_err(storage)?;
    let created: String = row.get(7).map_err(storage)?;
    let updated: String = row.get(8).map_err(storage)?;
    Ok(Session {
        id: parse_uuid(&id)?,
        workspace_id: row.get(1).map_err(storage)?,
        origin: SessionOrigin::parse(&origin)
            .ok_or_else(|| Error::Storage(format!("bad origin '{origin}'")))?,
        user_id: row.get(3).map_err(storage)?,
        thread: ThreadCoords {
            channel: row.get(4).map_err(storage)?,
            thread: row.get(5).map_err(storage)?,
        },
        title: row.get(6).map_err(storage)?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}
