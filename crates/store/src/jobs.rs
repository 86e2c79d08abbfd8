//! Job queries: creation, the claim transition, finalization, retry
//! requeues, and the stale-running reconciler scan.
//!
//! Single-writer semantics come from conditional UPDATEs: a claim only
//! succeeds when the row is still `queued`, so duplicate queue deliveries
//! and racing workers collapse to exactly one execution.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use fl_domain::job::{Job, JobStatus, RequestedContext};
use fl_domain::{Error, Result};

use crate::{parse_ts, parse_uuid, storage, ts, Store};

/// Result of a worker's attempt to claim a job.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The claim succeeded; the job is now running and the paired turn is
    /// processing.
    Claimed(Job),
    /// The job exists but is not claimable (already running or terminal).
    /// The delivery should be acknowledged as a duplicate.
    NotClaimable(JobStatus),
    /// The job is queued but backing off; redeliver after the deadline.
    Backoff(DateTime<Utc>),
    NotFound,
}

impl Store {
    pub fn create_job(
        &self,
        workspace_id: &str,
        turn_id: Uuid,
        context: &RequestedContext,
        max_retries: u32,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.to_owned(),
            turn_id,
            status: JobStatus::Queued,
            retries: 0,
            max_retries,
            backoff_until: None,
            priority: 0,
            requested_context: context.clone(),
            started_at: None,
            finished_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.with(|conn| {
            conn.execute(
                "INSERT INTO jobs
                   (id, workspace_id, turn_id, status, retries, max_retries, backoff_until,
                    priority, requested_context, started_at, finished_at, error,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, 0, ?6, NULL, NULL, NULL, ?7, ?8)",
                params![
                    job.id.to_string(),
                    workspace_id,
                    turn_id.to_string(),
                    job.status.as_str(),
                    max_retries as i64,
                    serde_json::to_string(context)?,
                    ts(now),
                    ts(now),
                ],
            )
            .map_err(storage)?;
            Ok(())
        })?;
        Ok(job)
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.with(|conn| {
            conn.query_row(
                &format!("{JOB_SELECT} WHERE id = ?1"),
                params![id.to_string()],
                job_from_row,
            )
            .optional()
            .map_err(storage)?
            .transpose()
        })
    }

    pub fn get_job_by_turn(&self, turn_id: Uuid) -> Result<Option<Job>> {
        self.with(|conn| {
            conn.query_row(
                &format!("{JOB_SELECT} WHERE turn_id = ?1"),
                params![turn_id.to_string()],
                job_from_row,
            )
            .optional()
            .map_err(storage)?
            .transpose()
        })
    }

    /// Atomic `queued → running` claim. Also flips the paired turn to
    /// `processing` in the same transaction.
    pub fn claim_job(&self, id: Uuid) -> Result<ClaimOutcome> {
        let now = Utc::now();
        self.with_tx(|tx| {
            let row = tx
                .query_row(
                    "SELECT status, backoff_until FROM jobs WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                        ))
                    },
                )
                .optional()
                .map_err(storage)?;

            let (status_str, backoff) = match row {
                Some(r) => r,
                None => return Ok(ClaimOutcome::NotFound),
            };
            let status = JobStatus::parse(&status_str)
                .ok_or_else(|| Error::Storage(format!("bad job status '{status_str}'")))?;

            if status != JobStatus::Queued {
                return Ok(ClaimOutcome::NotClaimable(status));
            }
            if let Some(until) = backoff {
                let until = parse_ts(&until)?;
                if until > now {
                    return Ok(ClaimOutcome::Backoff(until));
                }
            }

            let n = tx
                .execute(
                    "UPDATE jobs
                     SET status = 'running', started_at = ?1, backoff_until = NULL,
                         updated_at = ?1
                     WHERE id = ?2 AND status = 'queued'",
                    params![ts(now), id.to_string()],
                )
                .map_err(storage)?;
            if n == 0 {
                // Lost a race inside the same process; treat as duplicate.
                return Ok(ClaimOutcome::NotClaimable(JobStatus::Running));
            }

            tx.execute(
                "UPDATE turns SET status = 'processing', updated_at = ?1
                 WHERE id = (SELECT turn_id FROM jobs WHERE id = ?2)",
                params![ts(now), id.to_string()],
            )
            .map_err(storage)?;

            let job = tx
                .query_row(
                    &format!("{JOB_SELECT} WHERE id = ?1"),
                    params![id.to_string()],
                    job_from_row,
                )
                .map_err(storage)??;
            Ok(ClaimOutcome::Claimed(job))
        })
    }

    /// Terminal success: job completed + turn completed with the final
    /// response, one transaction.
    pub fn finalize_success(&self, job_id: Uuid, final_response: &str) -> Result<()> {
        let now = Utc::now();
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "UPDATE jobs SET status = 'completed', finished_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND status = 'running'",
                    params![ts(now), job_id.to_string()],
                )
                .map_err(storage)?;
            if n == 0 {
                return Err(Error::Storage(format!(
                    "job {job_id} not running at finalization"
                )));
            }
            tx.execute(
                "UPDATE turns SET status = 'completed', final_response = ?1, updated_at = ?2
                 WHERE id = (SELECT turn_id FROM jobs WHERE id = ?3)",
                params![final_response, ts(now), job_id.to_string()],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    /// Terminal failure: job failed with the error + turn failed, one
    /// transaction.
    pub fn finalize_failure(&self, job_id: Uuid, error: &str) -> Result<()> {
        let now = Utc::now();
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE jobs SET status = 'failed', error = ?1, finished_at = ?2, updated_at = ?2
                 WHERE id = ?3",
                params![error, ts(now), job_id.to_string()],
            )
            .map_err(storage)?;
            tx.execute(
                "UPDATE turns SET status = 'failed', updated_at = ?1
                 WHERE id = (SELECT turn_id FROM jobs WHERE id = ?2)",
                params![ts(now), job_id.to_string()],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    /// Retryable failure: `running → queued` with an incremented retry
    /// counter and a backoff deadline. The paired turn goes back to
    /// pending so a later claim flips it to processing again.
    pub fn requeue_with_backoff(
        &self,
        job_id: Uuid,
        backoff_until: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let now = Utc::now();
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "UPDATE jobs
                     SET status = 'queued', retries = retries + 1, backoff_until = ?1,
                         error = ?2, started_at = NULL, updated_at = ?3
                     WHERE id = ?4 AND status = 'running'",
                    params![ts(backoff_until), error, ts(now), job_id.to_string()],
                )
                .map_err(storage)?;
            if n == 0 {
                return Err(Error::Storage(format!("job {job_id} not running at requeue")));
            }
            tx.execute(
                "UPDATE turns SET status = 'pending', updated_at = ?1
                 WHERE id = (SELECT turn_id FROM jobs WHERE id = ?2)",
                params![ts(now), job_id.to_string()],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    /// Jobs stuck in `running` longer than `max_age` (crashed worker).
    pub fn stale_running_jobs(&self, max_age: Duration) -> Result<Vec<Job>> {
        let cutoff = ts(Utc::now() - max_age);
        self.with(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{JOB_SELECT} WHERE status = 'running' AND started_at < ?1"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![cutoff], job_from_row)
                .map_err(storage)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage)??);
            }
            Ok(out)
        })
    }

    /// Reset one stale running job back to queued (`retries += 1`).
    /// Returns false when another reconciler got there first.
    pub fn reset_stale_job(&self, job_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "UPDATE jobs
                     SET status = 'queued', retries = retries + 1, started_at = NULL,
                         backoff_until = NULL, updated_at = ?1
                     WHERE id = ?2 AND status = 'running'",
                    params![ts(now), job_id.to_string()],
                )
                .map_err(storage)?;
            if n > 0 {
                tx.execute(
                    "UPDATE turns SET status = 'pending', updated_at = ?1
                     WHERE id = (SELECT turn_id FROM jobs WHERE id = ?2)",
                    params![ts(now), job_id.to_string()],
                )
                .map_err(storage)?;
            }
            Ok(n > 0)
        })
    }

    /// Number of queued jobs (admission backpressure signal).
    pub fn queued_depth(&self) -> Result<usize> {
        self.with(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM jobs WHERE status = 'queued'", [], |r| {
                    r.get(0)
                })
                .map_err(storage)?;
            Ok(n as usize)
        })
    }
}

const JOB_SELECT: &str = "SELECT id, workspace_id, turn_id, status, retries, max_retries,
        backoff_until, priority, requested_context, started_at, finished_at, error,
        created_at, updated_at FROM jobs";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Job>> {
    Ok(build_job(row))
}

fn build_job(row: &Row<'_>) -> Result<Job> {
    let id: String = row.get(0).map_err(storage)?;
    let turn_id: String = row.get(2).map_err(storage)?;
    let status: String = row.get(3).map_err(storage)?;
    let retries: i64 = row.get(4).map_err(storage)?;
    let max_retries: i64 = row.get(5).map_err(storage)?;
    let backoff: Option<String> = row.get(6).map_err(storage)?;
    let priority: i64 = row.get(7).map_err(storage)?;
    let context: String = row.get(8).map_err(storage)?;
    let started: Option<String> = row.get(9).map_err(storage)?;
    let finished: Option<String> = row.get(10).map_err(storage)?;
    let created: String = row.get(12).map_err(storage)?;
    let updated: String = row.get(13).map_err(storage)?;

    Ok(Job {
        id: parse_uuid(&id)?,
        workspace_id: row.get(1).map_err(storage)?,
        turn_id: parse_uuid(&turn_id)?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| Error::Storage(format!("bad job status '{status}'")))?,
        retries: retries as u32,
        max_retries: max_retries as u32,
        backoff_until: backoff.as_deref().map(parse_ts).transpose()?,
        priority: priority as i32,
        requested_context: serde_json::from_str(&context)?,
        started_at: started.as_deref().map(parse_ts).transpose()?,
        finished_at: finished.as_deref().map(parse_ts).transpose()?,
        error: row.get(11).map_err(storage)?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::NewSession;
    use fl_domain::session::{SessionOrigin, ThreadCoords};
    use fl_domain::turn::TurnStatus;

    fn seed_job(store: &Store) -> Job {
        let session = store
            .create_session(NewSession {
                workspace_id: "ws".into(),
                origin: SessionOrigin::Web,
                user_id: None,
                thread: ThreadCoords::default(),
                title: "t".into(),
            })
            .unwrap();
        let turn = store.create_turn(session.id, "why slow?").unwrap();
        let ctx = RequestedContext {
            query: "why slow?".into(),
            user_id: None,
            hints: serde_json::Value::Null,
        };
        store.create_job("ws", turn.id, &ctx, 3).unwrap()
    }

    #[test]
    fn claim_flips_job_and_turn() {
        let store = Store::open_in_memory().unwrap();
        let job = seed_job(&store);

        let claimed = match store.claim_job(job.id).unwrap() {
            ClaimOutcome::Claimed(j) => j,
            other => panic!("expected claim, got {other:?}"),
        };
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        let turn = store.get_turn(job.turn_id).unwrap().unwrap();
        assert_eq!(turn.status, TurnStatus::Processing);
    }

    #[test]
    fn duplicate_claim_is_not_claimable() {
        let store = Store::open_in_memory().unwrap();
        let job = seed_job(&store);

        assert!(matches!(store.claim_job(job.id).unwrap(), ClaimOutcome::Claimed(_)));
        assert!(matches!(
            store.claim_job(job.id).unwrap(),
            ClaimOutcome::NotClaimable(JobStatus::Running)
        ));
    }

    #[test]
    fn backoff_delays_claim() {
        let store = Store::open_in_memory().unwrap();
        let job = seed_job(&store);
        let until = Utc::now() + Duration::seconds(120);

        assert!(matches!(store.claim_job(job.id).unwrap(), ClaimOutcome::Claimed(_)));
        store.requeue_with_backoff(job.id, until, "llm transient").unwrap();

        match store.claim_job(job.id).unwrap() {
            ClaimOutcome::Backoff(t) => {
                assert_eq!(t.timestamp_millis(), until.timestamp_millis())
            }
            other => panic!("expected backoff, got {other:?}"),
        }

        let j = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(j.retries, 1);
        assert_eq!(j.status, JobStatus::Queued);
    }

    #[test]
    fn expired_backoff_is_claimable() {
        let store = Store::open_in_memory().unwrap();
        let job = seed_job(&store);

        assert!(matches!(store.claim_job(job.id).unwrap(), ClaimOutcome::Claimed(_)));
        store
            .requeue_with_backoff(job.id, Utc::now() - Duration::seconds(1), "transient")
            .unwrap();
        assert!(matches!(store.claim_job(job.id).unwrap(), ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn finalize_success_sets_both_rows() {
        let store = Store::open_in_memory().unwrap();
        let job = seed_job(&store);
        store.claim_job(job.id).unwrap();
        store.finalize_success(job.id, "root cause: pool exhaustion").unwrap();

        let j = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Completed);
        assert!(j.finished_at.is_some());
        assert!(j.finished_at.unwrap() >= j.created_at);

        let t = store.get_turn(job.turn_id).unwrap().unwrap();
        assert_eq!(t.status, TurnStatus::Completed);
        assert_eq!(t.final_response.as_deref(), Some("root cause: pool exhaustion"));
    }

    #[test]
    fn finalize_failure_sets_error() {
        let store = Store::open_in_memory().unwrap();
        let job = seed_job(&store);
        store.claim_job(job.id).unwrap();
        store.finalize_failure(job.id, "llm protocol failure").unwrap();

        let j = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.error.as_deref(), Some("llm protocol failure"));

        let t = store.get_turn(job.turn_id).unwrap().unwrap();
        assert_eq!(t.status, TurnStatus::Failed);
    }

    #[test]
    fn reconciler_resets_stale_running() {
        let store = Store::open_in_memory().unwrap();
        let job = seed_job(&store);
        store.claim_job(job.id).unwrap();

        // Nothing stale yet.
        assert!(store.stale_running_jobs(Duration::seconds(120)).unwrap().is_empty());
        // With a zero threshold the running job is stale.
        let stale = store.stale_running_jobs(Duration::seconds(0)).unwrap();
        assert_eq!(stale.len(), 1);

        assert!(store.reset_stale_job(job.id).unwrap());
        let j = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Queued);
        assert_eq!(j.retries, 1);
        assert!(j.started_at.is_none());

        // Second reset is a no-op.
        assert!(!store.reset_stale_job(job.id).unwrap());
    }

    #[test]
    fn queued_depth_counts_only_queued() {
        let store = Store::open_in_memory().unwrap();
        let a = seed_job(&store);
        let _b = seed_job(&store);
        assert_eq!(store.queued_depth().unwrap(), 2);

        store.claim_job(a.id).unwrap();
        assert_eq!(store.queued_depth().unwrap(), 1);
    }
}
