//! Turn, turn-step, and feedback queries.
//!
//! Step sequences are assigned here: `append_step` computes
//! `max(sequence) + 1` for the turn inside an immediate transaction, so
//! sequences are gap-free and strictly increasing even with concurrent
//! writers.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use fl_domain::turn::{
    Feedback, NewStep, StepStatus, StepType, Turn, TurnStatus, TurnStep,
};
use fl_domain::{Error, Result};

use crate::{parse_ts, parse_uuid, storage, ts, Store};

impl Store {
    /// Create a pending turn in a session.
    pub fn create_turn(&self, session_id: Uuid, user_message: &str) -> Result<Turn> {
        let now = Utc::now();
        let turn = Turn {
            id: Uuid::new_v4(),
            session_id,
            user_message: user_message.to_owned(),
            final_response: None,
            status: TurnStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.with(|conn| {
            conn.execute(
                "INSERT INTO turns (id, session_id, user_message, final_response, status,
                                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6)",
                params![
                    turn.id.to_string(),
                    session_id.to_string(),
                    turn.user_message,
                    turn.status.as_str(),
                    ts(now),
                    ts(now),
                ],
            )
            .map_err(storage)?;
            Ok(())
        })?;
        self.touch_session(session_id)?;
        Ok(turn)
    }

    pub fn get_turn(&self, id: Uuid) -> Result<Option<Turn>> {
        self.with(|conn| {
            conn.query_row(
                "SELECT id, session_id, user_message, final_response, status,
                        created_at, updated_at
                 FROM turns WHERE id = ?1",
                params![id.to_string()],
                turn_from_row,
            )
            .optional()
            .map_err(storage)?
            .transpose()
        })
    }

    /// Fetch a turn only if its session belongs to the workspace.
    pub fn get_turn_scoped(&self, workspace_id: &str, id: Uuid) -> Result<Option<Turn>> {
        self.with(|conn| {
            conn.query_row(
                "SELECT t.id, t.session_id, t.user_message, t.final_response, t.status,
                        t.created_at, t.updated_at
                 FROM turns t JOIN sessions s ON s.id = t.session_id
                 WHERE t.id = ?1 AND s.workspace_id = ?2",
                params![id.to_string(), workspace_id],
                turn_from_row,
            )
            .optional()
            .map_err(storage)?
            .transpose()
        })
    }

    /// Turns in a session, oldest first.
    pub fn session_turns(&self, session_id: Uuid) -> Result<Vec<Turn>> {
        self.with(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, session_id, user_message, final_response, status,
                            created_at, updated_at
                     FROM turns WHERE session_id = ?1 ORDER BY created_at",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![session_id.to_string()], turn_from_row)
                .map_err(storage)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage)??);
            }
            Ok(out)
        })
    }

    /// Mark a turn failed before a job ever ran (admission-path failures).
    pub fn fail_turn(&self, turn_id: Uuid) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE turns SET status = 'failed', updated_at = ?1 WHERE id = ?2",
                params![ts(Utc::now()), turn_id.to_string()],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    // ── Steps ───────────────────────────────────────────────────────

    /// Append a step with the next sequence number for the turn.
    pub fn append_step(&self, turn_id: Uuid, new: NewStep) -> Result<TurnStep> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let sequence = self.with_tx(|tx| {
            let next: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(sequence), 0) + 1 FROM turn_steps WHERE turn_id = ?1",
                    params![turn_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(storage)?;
            tx.execute(
                "INSERT INTO turn_steps
                   (id, turn_id, step_type, tool_name, content, step_status, sequence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.to_string(),
                    turn_id.to_string(),
                    new.step_type.as_str(),
                    new.tool_name,
                    new.content,
                    new.step_status.as_str(),
                    next,
                    ts(now),
                ],
            )
            .map_err(storage)?;
            Ok(next as u32)
        })?;

        Ok(TurnStep {
            id,
            turn_id,
            step_type: new.step_type,
            tool_name: new.tool_name,
            content: new.content,
            step_status: new.step_status,
            sequence,
            created_at: now,
        })
    }

    /// All steps of a turn in sequence order.
    pub fn list_steps(&self, turn_id: Uuid) -> Result<Vec<TurnStep>> {
        self.with(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, turn_id, step_type, tool_name, content, step_status,
                            sequence, created_at
                     FROM turn_steps WHERE turn_id = ?1 ORDER BY sequence",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![turn_id.to_string()], step_from_row)
                .map_err(storage)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage)??);
            }
            Ok(out)
        })
    }

    // ── Feedback ────────────────────────────────────────────────────

    /// One rating per (turn, user); duplicates are a validation error.
    pub fn add_feedback(
        &self,
        turn_id: Uuid,
        user_id: &str,
        score: i8,
        comment: Option<&str>,
    ) -> Result<Feedback> {
        let now = Utc::now();
        let fb = Feedback {
            id: Uuid::new_v4(),
            turn_id,
            user_id: user_id.to_owned(),
            score,
            comment: comment.map(str::to_owned),
            created_at: now,
        };
        self.with(|conn| {
            conn.execute(
                "INSERT INTO feedback (id, turn_id, user_id, score, comment, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    fb.id.to_string(),
                    turn_id.to_string(),
                    user_id,
                    score as i64,
                    fb.comment,
                    ts(now),
                ],
            )
            .map_err(|e| {
                if crate::is_unique_violation(&e) {
                    Error::Validation {
                        field: "feedback",
                        message: "feedback already recorded for this turn".into(),
                    }
                } else {
                    storage(e)
                }
            })?;
            Ok(())
        })?;
        Ok(fb)
    }
}

fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Turn>> {
    Ok(build_turn(row))
}

fn build_turn(row: &Row<'_>) -> Result<Turn> {
    let id: String = row.get(0).map_err(storage)?;
    let session_id: String = row.get(1).map_err(storage)?;
    let status: String = row.get(4).map_err(storage)?;
    let created: String = row.get(5).map_err(storage)?;
    let updated: String = row.get(6).map_err(storage)?;
    Ok(Turn {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        user_message: row.get(2).map_err(storage)?,
        final_response: row.get(3).map_err(storage)?,
        status: TurnStatus::parse(&status)
            .ok_or_else(|| Error::Storage(format!("bad turn status '{status}'")))?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Result<TurnStep>> {
    Ok(build_step(row))
}

fn build_step(row: &Row<'_>) -> Result<TurnStep> {
    let id: String = row.get(0).map_err(storage)?;
    let turn_id: String = row.get(1).map_err(storage)?;
    let step_type: String = row.get(2).map_err(storage)?;
    let step_status: String = row.get(5).map_err(storage)?;
    let sequence: i64 = row.get(6).map_err(storage)?;
    let created: String = row.get(7).map_err(storage)?;
    Ok(TurnStep {
        id: parse_uuid(&id)?,
        turn_id: parse_uuid(&turn_id)?,
        step_type: StepType::parse(&step_type)
            .ok_or_else(|| Error::Storage(format!("bad step type '{step_type}'")))?,
        tool_name: row.get(3).map_err(storage)?,
        content: row.get(4).map_err(storage)?,
        step_status: StepStatus::parse(&step_status)
            .ok_or_else(|| Error::Storage(format!("bad step status '{step_status}'")))?,
        sequence: sequence as u32,
        created_at: parse_ts(&created)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::NewSession;
    use fl_domain::session::{SessionOrigin, ThreadCoords};

    fn seed(store: &Store) -> Turn {
        let session = store
            .create_session(NewSession {
                workspace_id: "ws".into(),
                origin: SessionOrigin::Web,
                user_id: Some("u-1".into()),
                thread: ThreadCoords::default(),
                title: "t".into(),
            })
            .unwrap();
        store.create_turn(session.id, "why is api-gw slow?").unwrap()
    }

    #[test]
    fn sequences_are_contiguous_from_one() {
        let store = Store::open_in_memory().unwrap();
        let turn = seed(&store);

        for i in 0..5 {
            let step = store
                .append_step(turn.id, NewStep::status(format!("step {i}")))
                .unwrap();
            assert_eq!(step.sequence, i + 1);
        }

        let steps = store.list_steps(turn.id).unwrap();
        let seqs: Vec<u32> = steps.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn tool_steps_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let turn = seed(&store);

        store
            .append_step(turn.id, NewStep::tool_start("logs.errors.loki"))
            .unwrap();
        store
            .append_step(
                turn.id,
                NewStep::tool_end("logs.errors.loki", false, "ERROR: upstream unavailable"),
            )
            .unwrap();

        let steps = store.list_steps(turn.id).unwrap();
        assert_eq!(steps[0].step_status, StepStatus::Running);
        assert_eq!(steps[1].step_status, StepStatus::Failed);
        assert_eq!(steps[1].tool_name.as_deref(), Some("logs.errors.loki"));
    }

    #[test]
    fn turn_scoping_requires_matching_workspace() {
        let store = Store::open_in_memory().unwrap();
        let turn = seed(&store);
        assert!(store.get_turn_scoped("ws", turn.id).unwrap().is_some());
        assert!(store.get_turn_scoped("other", turn.id).unwrap().is_none());
    }

    #[test]
    fn duplicate_feedback_rejected() {
        let store = Store::open_in_memory().unwrap();
        let turn = seed(&store);

        store.add_feedback(turn.id, "u-1", 1, Some("helpful")).unwrap();
        let err = store.add_feedback(turn.id, "u-1", -1, None).unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        // A different user can still rate.
        store.add_feedback(turn.id, "u-2", -1, None).unwrap();
    }

    #[test]
    fn session_delete_cascades_to_turns_and_steps() {
        let store = Store::open_in_memory().unwrap();
        let turn = seed(&store);
        store.append_step(turn.id, NewStep::status("Queued")).unwrap();

        store.delete_session("ws", turn.session_id).unwrap();
        assert!(store.get_turn(turn.id).unwrap().is_none());
        assert!(store.list_steps(turn.id).unwrap().is_empty());
    }
}
