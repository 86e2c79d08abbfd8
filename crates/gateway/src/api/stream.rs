//! `GET /v1/turns/:id/stream` — the live progress stream.
//!
//! Fuses durable replay with live bus frames. The subscribe-before-read
//! order is mandatory: subscribing first means any frame published
//! while we read persisted steps is waiting in the receiver, and the
//! sequence-based dedupe drops the overlap.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Extension;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use uuid::Uuid;

use fl_domain::frame::Frame;
use fl_domain::turn::{Turn, TurnStatus};
use fl_domain::Error;

use crate::state::AppState;

use super::auth::Workspace;
use super::error::ApiError;

pub async fn stream_turn(
    State(state): State<AppState>,
    Extension(Workspace(workspace_id)): Extension<Workspace>,
    Path(turn_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let turn = state
        .store
        .get_turn_scoped(&workspace_id, turn_id)?
        .ok_or(Error::NotFound("turn"))?;

    let frames = turn_frames(state, turn);
    let sse = frames.map(|frame| {
        let name = frame_event_name(&frame);
        let data = serde_json::to_string(&frame).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event(name).data(data))
    });

    // Keep-alives every 10 s so idle-timeout intermediaries leave the
    // connection alone while a slow investigation runs.
    Ok(Sse::new(sse).keep_alive(
        KeepAlive::new().interval(std::time::Duration::from_secs(10)),
    ))
}

fn frame_event_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Status { .. } => "status",
        Frame::ToolStart { .. } => "tool_start",
        Frame::ToolEnd { .. } => "tool_end",
        Frame::Thinking { .. } => "thinking",
        Frame::Complete { .. } => "complete",
        Frame::Error { .. } => "error",
    }
}

/// The ordered frame sequence for one turn: replay of persisted steps,
/// then live frames deduplicated by sequence, closed by exactly one
/// terminal frame.
pub(crate) fn turn_frames(state: AppState, turn: Turn) -> impl Stream<Item = Frame> {
    async_stream::stream! {
        let turn_id = turn.id;

        // Terminal turn: pure replay, no subscription needed.
        if turn.status.is_terminal() {
            for step in state.store.list_steps(turn_id).unwrap_or_default() {
                yield Frame::from_step(&step);
            }
            yield terminal_frame(&state, &turn);
            return;
        }

        // In-flight: subscribe FIRST, then read.
        let mut rx = state.bus.subscribe(turn_id);
        let mut last_seq = 0u32;
        for step in state.store.list_steps(turn_id).unwrap_or_default() {
            last_seq = step.sequence;
            yield Frame::from_step(&step);
        }

        // The turn may have finished between the scoped fetch and the
        // subscription; the terminal frame would then never arrive on
        // the bus.
        if let Ok(Some(current)) = state.store.get_turn(turn_id) {
            if current.status.is_terminal() {
                yield terminal_frame(&state, &current);
                return;
            }
        }

        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if let Some(seq) = frame.sequence() {
                        if seq <= last_seq {
                            continue; // replayed already
                        }
                        last_seq = seq;
                    }
                    let terminal = frame.is_terminal();
                    yield frame;
                    if terminal {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Slow consumer: close rather than deliver a gapped
                    // sequence; the client reconnects and replays.
                    tracing::warn!(%turn_id, missed, "stream subscriber lagged; closing");
                    yield Frame::Error { message: "stream backpressure".into() };
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Worker finished and cleaned the channel up before
                    // we saw the terminal frame.
                    match state.store.get_turn(turn_id) {
                        Ok(Some(current)) if current.status.is_terminal() => {
                            yield terminal_frame(&state, &current);
                        }
                        _ => {
                            yield Frame::Error { message: "stream interrupted".into() };
                        }
                    }
                    return;
                }
            }
        }
    }
}

/// Synthesize the terminal frame for a finished turn from durable state.
fn terminal_frame(state: &AppState, turn: &Turn) -> Frame {
    match turn.status {
        TurnStatus::Completed => Frame::Complete {
            final_response: turn.final_response.clone().unwrap_or_default(),
        },
        _ => {
            let message = state
                .store
                .get_job_by_turn(turn.id)
                .ok()
                .flatten()
                .and_then(|j| j.error)
                .unwrap_or_else(|| "analysis failed".into());
            Frame::Error { message }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::worker::run_once;
    use crate::testutil::{seed_admitted_job, test_state, ScriptedResolver};
    use fl_providers::ChatResponse;

    fn answer(text: &str) -> fl_domain::Result<ChatResponse> {
        Ok(ChatResponse {
            content: text.into(),
            tool_calls: Vec::new(),
            usage: None,
            model: "scripted".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn collect(state: &AppState, turn_id: Uuid) -> Vec<Frame> {
        let turn = state.store.get_turn(turn_id).unwrap().unwrap();
        let stream = turn_frames(state.clone(), turn);
        futures_util::pin_mut!(stream);
        let mut frames = Vec::new();
        while let Some(frame) = stream.next().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn replay_after_completion_ends_with_one_terminal() {
        let state = test_state(ScriptedResolver::new(vec![answer("root cause: X")]));
        let job = seed_admitted_job(&state, "why slow?").await;
        run_once(&state, 0).await.unwrap();

        let frames = collect(&state, job.turn_id).await;

        // Sequences 1..k exactly once, in order.
        let seqs: Vec<u32> = frames.iter().filter_map(|f| f.sequence()).collect();
        assert_eq!(seqs, (1..=seqs.len() as u32).collect::<Vec<_>>());

        assert_eq!(frames.iter().filter(|f| f.is_terminal()).count(), 1);
        match frames.last().unwrap() {
            Frame::Complete { final_response } => {
                assert_eq!(final_response, "root cause: X")
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_replays_identical_history() {
        // Scenario: stream, drop, stream again — same frames both times.
        let state = test_state(ScriptedResolver::new(vec![answer("done")]));
        let job = seed_admitted_job(&state, "why slow?").await;
        run_once(&state, 0).await.unwrap();

        let first = collect(&state, job.turn_id).await;
        let second = collect(&state, job.turn_id).await;
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn live_subscriber_sees_prefix_of_persisted_order() {
        let state = test_state(ScriptedResolver::new(vec![answer("done")]));
        let job = seed_admitted_job(&state, "why slow?").await;

        // Open the stream while the turn is still pending.
        let turn = state.store.get_turn(job.turn_id).unwrap().unwrap();
        let stream = turn_frames(state.clone(), turn);
        let collector = tokio::spawn(async move {
            futures_util::pin_mut!(stream);
            let mut frames = Vec::new();
            while let Some(frame) = stream.next().await {
                frames.push(frame);
            }
            frames
        });

        // Let the subscriber replay the "Queued" step and park.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        run_once(&state, 0).await.unwrap();

        let frames = collector.await.unwrap();
        let seqs: Vec<u32> = frames.iter().filter_map(|f| f.sequence()).collect();
        assert_eq!(seqs, (1..=seqs.len() as u32).collect::<Vec<_>>());
        assert!(matches!(frames.last().unwrap(), Frame::Complete { .. }));
    }

    #[tokio::test]
    async fn failed_turn_replays_error_terminal() {
        let state = test_state(ScriptedResolver::new(vec![Err(
            fl_domain::Error::LlmProtocol("bad".into()),
        )]));
        let job = seed_admitted_job(&state, "why slow?").await;
        run_once(&state, 0).await.unwrap();

        let frames = collect(&state, job.turn_id).await;
        match frames.last().unwrap() {
            Frame::Error { message } => {
                assert!(message.contains("language model"))
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagged_subscriber_gets_backpressure_error() {
        let state = test_state(ScriptedResolver::new(vec![]));
        let job = seed_admitted_job(&state, "why slow?").await;

        let turn = state.store.get_turn(job.turn_id).unwrap().unwrap();
        let stream = turn_frames(state.clone(), turn);
        futures_util::pin_mut!(stream);

        // Replay the single persisted step.
        let first = stream.next().await.unwrap();
        assert_eq!(first.sequence(), Some(1));

        // Overflow the 256-slot broadcast buffer while the subscriber
        // is parked.
        for i in 0..400u32 {
            state.bus.publish(
                job.turn_id,
                Frame::Status { sequence: i + 2, content: "spam".into() },
            );
        }

        let mut saw_backpressure = false;
        while let Some(frame) = stream.next().await {
            if let Frame::Error { message } = &frame {
                assert_eq!(message, "stream backpressure");
                saw_backpressure = true;
            }
        }
        assert!(saw_backpressure);
    }
}
