//! Operational surface.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// `GET /v1/health` — liveness of the db, queue, and bus, plus how many
/// workers heartbeated in the last minute. Returns 503 when any
/// dependency is down so load balancers can rotate the instance out.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.ping();
    let queue_ok = state.queue.healthy();
    let bus_ok = state.bus.healthy();
    let workers = state.workers.seen_within(Duration::from_secs(60));

    let status = if db_ok && queue_ok && bus_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "db": if db_ok { "ok" } else { "fail" },
        "queue": if queue_ok { "ok" } else { "fail" },
        "bus": if bus_ok { "ok" } else { "fail" },
        "workers_seen_last_60s": workers,
    });
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_state, ScriptedResolver};

    #[tokio::test]
    async fn health_reports_dependencies_and_workers() {
        let state = test_state(ScriptedResolver::new(vec![]));
        state.workers.heartbeat(0);
        state.workers.heartbeat(1);

        let resp = health(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["db"], "ok");
        assert_eq!(body["workers_seen_last_60s"], 2);
    }
}
