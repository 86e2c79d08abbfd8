//! The orchestrator worker.
//!
//! Pulls job ids off the queue, drives one turn to completion with the
//! reason–act engine, persists every step before publishing its frame,
//! and classifies failures into retryable requeues or terminal errors.
//! A periodic reconciler rescues jobs orphaned by crashed workers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use fl_domain::frame::Frame;
use fl_domain::job::{backoff_delay, Job};
use fl_domain::turn::NewStep;
use fl_domain::{Error, Result};
use fl_providers::{LlmKind, WorkspaceLlm};
use fl_store::{ClaimOutcome, LlmConfigRow, LlmProviderKind};

use crate::state::AppState;

use super::react::{Budgets, EngineEvent, ReactEngine, StepSink};
use super::tools::build_tool_set;

/// Extra visibility beyond the turn budget so a healthy worker always
/// finishes (or requeues) before the queue redelivers.
const CLAIM_GRACE: Duration = Duration::from_secs(30);

/// How long one receive call blocks before the loop re-checks heartbeats.
const RECEIVE_WAIT: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker registry (health reporting)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct WorkerRegistry {
    last_seen: RwLock<HashMap<usize, Instant>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeat(&self, worker_id: usize) {
        self.last_seen.write().insert(worker_id, Instant::now());
    }

    /// Workers that heartbeated within `window`.
    pub fn seen_within(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.last_seen
            .read()
            .values()
            .filter(|t| now.duration_since(**t) <= window)
            .count()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Long-running worker task; one per configured worker slot.
pub async fn run_worker_loop(state: AppState, worker_id: usize) {
    tracing::info!(worker_id, "worker started");
    loop {
        state.workers.heartbeat(worker_id);
        if let Err(e) = run_once(&state, worker_id).await {
            tracing::error!(worker_id, error = %e, "worker iteration failed");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Claim and process at most one message. Returns after the job reaches
/// a terminal or requeued state, or after the receive wait lapses idle.
pub async fn run_once(state: &AppState, worker_id: usize) -> Result<()> {
    let visibility =
        Duration::from_secs(state.config.worker.max_turn_duration_secs) + CLAIM_GRACE;
    let Some(delivery) = state.queue.receive(visibility, RECEIVE_WAIT).await? else {
        return Ok(());
    };

    let job_id = match Uuid::parse_str(delivery.body.trim()) {
        Ok(id) => id,
        Err(_) => {
            tracing::error!(body = %delivery.body, "dropping ill-formed queue message");
            state.queue.delete(delivery.handle).await?;
            return Ok(());
        }
    };

    match state.store.claim_job(job_id)? {
        ClaimOutcome::NotFound => {
            tracing::error!(%job_id, "queued job no longer exists; dropping");
            state.queue.delete(delivery.handle).await?;
        }
        ClaimOutcome::NotClaimable(status) => {
            // Duplicate delivery; the first claim won.
            tracing::debug!(%job_id, status = status.as_str(), "duplicate delivery acked");
            state.queue.delete(delivery.handle).await?;
        }
        ClaimOutcome::Backoff(until) => {
            let delay = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(%job_id, delay_secs = delay.as_secs(), "job backing off; releasing");
            state.queue.change_visibility(delivery.handle, delay).await?;
        }
        ClaimOutcome::Claimed(job) => {
            let span = tracing::info_span!(
                "turn",
                worker_id,
                job_id = %job.id,
                turn_id = %job.turn_id,
                workspace_id = %job.workspace_id,
            );
            let _guard = span.enter();
            execute_job(state, job, delivery.handle).await?;
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn execute_job(state: &AppState, job: Job, handle: u64) -> Result<()> {
    tracing::debug!("job claimed");
    persist_and_publish(state, job.turn_id, NewStep::status("Starting analysis"))?;

    match run_analysis(state, &job).await {
        Ok(answer) => {
            persist_and_publish(state, job.turn_id, NewStep::status("Analysis complete"))?;
            state.store.finalize_success(job.id, &answer)?;
            // Ack only after the terminal state is durable.
            state.queue.delete(handle).await?;
            state
                .bus
                .publish(job.turn_id, Frame::Complete { final_response: answer });
            state.bus.cleanup(job.turn_id);
            tracing::info!("turn completed");
        }
        Err(e) if e.is_retryable() && job.can_retry() => {
            let delay = backoff_delay(state.config.retry.base_delay_secs, job.retries);
            let until = Utc::now() + delay;
            tracing::warn!(error = %e, retries = job.retries + 1, "retryable failure; requeueing");
            state.store.requeue_with_backoff(job.id, until, &e.to_string())?;
            persist_and_publish(
                state,
                job.turn_id,
                NewStep::status("Retrying after transient failure"),
            )?;

            // Requeue with delay, then ack; fall back to extending the
            // current lease when the send fails.
            let std_delay = delay.to_std().unwrap_or(Duration::ZERO);
            match state.queue.send(job.id.to_string(), Some(std_delay)).await {
                Ok(()) => state.queue.delete(handle).await?,
                Err(send_err) => {
                    tracing::error!(error = %send_err, "requeue send failed; extending lease");
                    state.queue.change_visibility(handle, std_delay).await?;
                }
            }
            // No terminal frame: subscribers keep waiting for the retry.
        }
        Err(e) => {
            let message = user_error_message(&e);
            tracing::error!(error = %e, "turn failed");
            state.store.finalize_failure(job.id, &message)?;
            state.queue.delete(handle).await?;
            state.bus.publish(job.turn_id, Frame::Error { message });
            state.bus.cleanup(job.turn_id);
        }
    }
    Ok(())
}

/// Resolve the model and tools for the job's workspace, then run the
/// engine with a sink that persists each step before publishing it.
async fn run_analysis(state: &AppState, job: &Job) -> Result<String> {
    let workspace_llm = state
        .store
        .get_llm_config(&job.workspace_id)?
        .map(to_workspace_llm)
        .transpose()?;
    let model = state.models.resolve(workspace_llm.as_ref())?;

    let tools = build_tool_set(&state.integrations, &job.workspace_id)?;
    tracing::debug!(tool_count = tools.len(), model = model.model_id(), "context resolved");

    let engine = ReactEngine::new(model, Budgets::from(&state.config.worker));
    let mut sink = PersistingSink {
        state: state.clone(),
        turn_id: job.turn_id,
    };
    engine
        .run(
            &job.requested_context.query,
            &job.requested_context.hints,
            &tools,
            &mut sink,
        )
        .await
}

fn to_workspace_llm(row: LlmConfigRow) -> Result<WorkspaceLlm> {
    // Admission refuses unhealthy BYO configs, but a config can go
    // unhealthy while the job waits in the queue.
    if row.provider != LlmProviderKind::Platform && !row.healthy {
        return Err(Error::LlmProtocol(
            "workspace LLM configuration is unhealthy".into(),
        ));
    }
    let kind = match row.provider {
        LlmProviderKind::Platform => LlmKind::Platform,
        LlmProviderKind::OpenAi => LlmKind::OpenAi,
        LlmProviderKind::AzureOpenAi => LlmKind::AzureOpenAi,
        LlmProviderKind::Gemini => LlmKind::Gemini,
    };
    Ok(WorkspaceLlm {
        kind,
        model: row.model,
        credentials_json: row.credentials_json,
    })
}

/// What subscribers and the turn record see on terminal failure.
/// Detailed causes stay in the logs.
fn user_error_message(e: &Error) -> String {
    match e {
        Error::Timeout(_) => "the analysis timed out before completing".into(),
        Error::LlmProtocol(_) => {
            "the language model failed to produce a valid analysis".into()
        }
        _ => "internal error during analysis".into(),
    }
}

/// Persist a step (sequence assigned by the store) and only then
/// publish its frame.
fn persist_and_publish(
    state: &AppState,
    turn_id: Uuid,
    step: NewStep,
) -> Result<fl_domain::turn::TurnStep> {
    let step = state.store.append_step(turn_id, step)?;
    state.bus.publish(turn_id, Frame::from_step(&step));
    Ok(step)
}

struct PersistingSink {
    state: AppState,
    turn_id: Uuid,
}

#[async_trait::async_trait]
impl StepSink for PersistingSink {
    async fn emit(&mut self, event: EngineEvent) -> Result<()> {
        let step = match event {
            EngineEvent::Thinking(content) => NewStep::thinking(content),
            EngineEvent::ToolStart { tool_name } => NewStep::tool_start(tool_name),
            EngineEvent::ToolEnd {
                tool_name,
                ok,
                summary,
            } => NewStep::tool_end(tool_name, ok, summary),
        };
        persist_and_publish(&self.state, self.turn_id, step)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconciler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Periodic task that rescues jobs stuck in `running` after a worker
/// crash (scenario: claim succeeded, process died, queue redelivery hit
/// the NotClaimable arm).
pub async fn run_reconciler(state: AppState) {
    let interval = Duration::from_secs(state.config.worker.reconcile_interval_secs);
    tracing::info!(interval_secs = interval.as_secs(), "reconciler started");
    loop {
        tokio::time::sleep(interval).await;
        match reconcile_once(&state).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(rescued = n, "reconciler reset stale jobs"),
            Err(e) => tracing::warn!(error = %e, "reconciler pass failed"),
        }
    }
}

/// Reset running jobs older than the turn budget back to queued, or
/// fail them when their retries are already spent.
pub async fn reconcile_once(state: &AppState) -> Result<usize> {
    let max_age = chrono::Duration::seconds(state.config.worker.max_turn_duration_secs as i64);
    let stale = state.store.stale_running_jobs(max_age)?;
    let mut rescued = 0;

    for job in stale {
        if job.retries >= job.max_retries {
            let message = "analysis crashed repeatedly and was abandoned".to_string();
            tracing::error!(job_id = %job.id, "stale job out of retries; failing");
            state.store.finalize_failure(job.id, &message)?;
            state.bus.publish(job.turn_id, Frame::Error { message });
            state.bus.cleanup(job.turn_id);
            continue;
        }
        if state.store.reset_stale_job(job.id)? {
            persist_and_publish(
                state,
                job.turn_id,
                NewStep::status("Retrying after internal error"),
            )?;
            state.queue.send(job.id.to_string(), None).await?;
            rescued += 1;
        }
    }
    Ok(rescued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_admitted_job, test_state, ScriptedResolver};
    use std::sync::Arc;
    use fl_domain::job::JobStatus;
    use fl_domain::turn::{StepType, TurnStatus};
    use fl_providers::ChatResponse;

    fn answer(text: &str) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: text.into(),
            tool_calls: Vec::new(),
            usage: None,
            model: "scripted".into(),
            finish_reason: Some("stop".into()),
        })
    }

    #[tokio::test]
    async fn happy_path_completes_turn_and_streams_frames() {
        let state = test_state(ScriptedResolver::new(vec![answer(
            "## Root cause\nconnection pool exhaustion on db-primary",
        )]));
        let job = seed_admitted_job(&state, "why is svc api-gw slow?").await;

        let mut rx = state.bus.subscribe(job.turn_id);
        run_once(&state, 0).await.unwrap();

        // Durable state.
        let stored_job = state.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored_job.status, JobStatus::Completed);
        assert!(stored_job.finished_at.is_some());

        let turn = state.store.get_turn(job.turn_id).unwrap().unwrap();
        assert_eq!(turn.status, TurnStatus::Completed);
        assert!(turn.final_response.as_deref().unwrap().contains("pool exhaustion"));

        // Steps: Queued, Starting analysis, Analysis complete — contiguous.
        let steps = state.store.list_steps(job.turn_id).unwrap();
        let seqs: Vec<u32> = steps.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, (1..=steps.len() as u32).collect::<Vec<_>>());
        assert_eq!(steps[0].content.as_deref(), Some("Queued"));
        assert_eq!(steps[1].content.as_deref(), Some("Starting analysis"));
        assert_eq!(steps.last().unwrap().content.as_deref(), Some("Analysis complete"));

        // Live frames end with exactly one terminal.
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        let terminal_count = frames.iter().filter(|f| f.is_terminal()).count();
        assert_eq!(terminal_count, 1);
        assert!(matches!(frames.last().unwrap(), Frame::Complete { .. }));
    }

    #[tokio::test]
    async fn duplicate_delivery_completes_exactly_once() {
        let state = test_state(ScriptedResolver::new(vec![answer("done")]));
        let job = seed_admitted_job(&state, "why slow?").await;

        // A second copy of the same job id (standard-queue duplicate).
        state.queue.send(job.id.to_string(), None).await.unwrap();

        run_once(&state, 0).await.unwrap();
        run_once(&state, 0).await.unwrap();

        let stored = state.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);

        let starts = state
            .store
            .list_steps(job.turn_id)
            .unwrap()
            .iter()
            .filter(|s| s.content.as_deref() == Some("Starting analysis"))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(state.queue.depth(), 0);
    }

    #[tokio::test]
    async fn transient_llm_failure_requeues_with_backoff() {
        let state = test_state(ScriptedResolver::new(vec![Err(Error::LlmTransient(
            "503 from provider".into(),
        ))]));
        let job = seed_admitted_job(&state, "why slow?").await;

        let mut rx = state.bus.subscribe(job.turn_id);
        run_once(&state, 0).await.unwrap();

        let stored = state.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retries, 1);
        let backoff = stored.backoff_until.unwrap();
        let delta = (backoff - Utc::now()).num_seconds();
        assert!((55..=65).contains(&delta), "first backoff ≈ 60s, got {delta}");

        // Turn is pending again; no terminal frame was published.
        let turn = state.store.get_turn(job.turn_id).unwrap().unwrap();
        assert_eq!(turn.status, TurnStatus::Pending);
        while let Ok(frame) = rx.try_recv() {
            assert!(!frame.is_terminal());
        }

        // The retry message is back in the queue (delayed).
        assert_eq!(state.queue.depth(), 1);
    }

    #[tokio::test]
    async fn protocol_failure_fails_turn_with_error_frame() {
        let state = test_state(ScriptedResolver::new(vec![Err(Error::LlmProtocol(
            "invalid auth".into(),
        ))]));
        let job = seed_admitted_job(&state, "why slow?").await;

        let mut rx = state.bus.subscribe(job.turn_id);
        run_once(&state, 0).await.unwrap();

        let stored = state.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.is_some());

        let turn = state.store.get_turn(job.turn_id).unwrap().unwrap();
        assert_eq!(turn.status, TurnStatus::Failed);

        let mut saw_error = false;
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Error { message } = frame {
                // Opaque to the user; the detail stays in logs.
                assert!(!message.contains("invalid auth"));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_terminally() {
        let state = test_state(ScriptedResolver::new(vec![Err(Error::LlmTransient(
            "503".into(),
        ))]));
        let job = seed_admitted_job(&state, "why slow?").await;
        // Burn the retry budget.
        for _ in 0..3 {
            let claimed = state.store.claim_job(job.id).unwrap();
            assert!(matches!(claimed, ClaimOutcome::Claimed(_)));
            state
                .store
                .requeue_with_backoff(job.id, Utc::now(), "transient")
                .unwrap();
        }

        run_once(&state, 0).await.unwrap();

        let stored = state.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retries, 3);
    }

    #[tokio::test]
    async fn ill_formed_message_is_dropped() {
        let state = test_state(ScriptedResolver::new(vec![]));
        state.queue.send("not-a-uuid".into(), None).await.unwrap();

        run_once(&state, 0).await.unwrap();
        assert_eq!(state.queue.depth(), 0);
    }

    #[tokio::test]
    async fn reconciler_rescues_stale_running_job() {
        let mut state = test_state(ScriptedResolver::new(vec![]));
        // Zero turn budget: any running job is immediately stale.
        {
            let config = Arc::make_mut(&mut state.config);
            config.worker.max_turn_duration_secs = 0;
        }
        let job = seed_admitted_job(&state, "why slow?").await;

        // Simulate a crash: claim the job, then never finish it. Drain
        // the original delivery so the queue is empty.
        let d = state
            .queue
            .receive(Duration::from_secs(60), Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        state.queue.delete(d.handle).await.unwrap();
        assert!(matches!(
            state.store.claim_job(job.id).unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        let rescued = reconcile_once(&state).await.unwrap();
        assert_eq!(rescued, 1);

        let stored = state.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retries, 1);

        let steps = state.store.list_steps(job.turn_id).unwrap();
        let last = steps.last().unwrap();
        assert_eq!(last.step_type, StepType::Status);
        assert_eq!(last.content.as_deref(), Some("Retrying after internal error"));

        // Re-enqueued for another attempt.
        assert_eq!(state.queue.depth(), 1);
    }

    #[tokio::test]
    async fn reconciler_fails_job_with_no_retries_left() {
        let mut state = test_state(ScriptedResolver::new(vec![]));
        {
            let config = Arc::make_mut(&mut state.config);
            config.worker.max_turn_duration_secs = 0;
            config.retry.max_retries = 0;
        }
        let job = seed_admitted_job(&state, "why slow?").await;
        assert!(matches!(
            state.store.claim_job(job.id).unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        reconcile_once(&state).await.unwrap();

        let stored = state.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }
}
