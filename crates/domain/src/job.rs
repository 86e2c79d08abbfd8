use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    WaitingInput,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::WaitingInput => "waiting_input",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "waiting_input" => Some(JobStatus::WaitingInput),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requested context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque bag of inputs the worker needs to execute a job, captured at
/// admission time so the analysis is reproducible from the job row alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestedContext {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Free-form integration hints (e.g. a service name the channel bot
    /// extracted from the thread).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub hints: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The durable unit of work, 1:1 with a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub workspace_id: String,
    pub turn_id: Uuid,
    pub status: JobStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub priority: i32,
    pub requested_context: RequestedContext,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }
}

/// Exponential backoff delay for the next retry: `base · 2^retries`.
///
/// `retries` is the count BEFORE the increment, so the first requeue waits
/// one base period (60 s by default), the second two, the third four.
pub fn backoff_delay(base_secs: u64, retries: u32) -> Duration {
    let factor = 2u64.saturating_pow(retries.min(16));
    Duration::seconds((base_secs.saturating_mul(factor)) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(60, 0).num_seconds(), 60);
        assert_eq!(backoff_delay(60, 1).num_seconds(), 120);
        assert_eq!(backoff_delay(60, 2).num_seconds(), 240);
    }

    #[test]
    fn backoff_is_capped_against_overflow() {
        // Pathological retry counts must not panic.
        let d = backoff_delay(60, 64);
        assert!(d.num_seconds() > 0);
    }

    #[test]
    fn status_round_trip() {
        for s in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::WaitingInput,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn requested_context_round_trips_json() {
        let ctx = RequestedContext {
            query: "why is svc api-gw slow?".into(),
            user_id: Some("u-1".into()),
            hints: serde_json::json!({"service": "api-gw"}),
        };
        let json = serde_json::to_string(&ctx).unwrap();
        let back: RequestedContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.query, ctx.query);
        assert_eq!(back.hints["service"], "api-gw");
    }
}
