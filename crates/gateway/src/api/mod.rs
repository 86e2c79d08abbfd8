pub mod admin;
pub mod auth;
pub mod chat;
pub mod error;
pub mod sessions;
pub mod stream;

use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// `/v1/health` is public (load-balancer probes); everything else goes
/// through the identity middleware, which attaches the caller's
/// [`auth::AuthContext`] and resolved [`auth::Workspace`].
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/v1/health", get(admin::health));

    let protected = Router::new()
        // Chat (admission)
        .route("/v1/chat", post(chat::send_message))
        // Turns
        .route("/v1/turns/:id", get(sessions::get_turn))
        .route("/v1/turns/:id/stream", get(stream::stream_turn))
        .route("/v1/turns/:id/feedback", post(sessions::submit_feedback))
        // Sessions
        .route("/v1/sessions", get(sessions::list_sessions))
        .route("/v1/sessions/:id", get(sessions::get_session))
        .route("/v1/sessions/:id", patch(sessions::rename_session))
        .route("/v1/sessions/:id", delete(sessions::delete_session))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_identity,
        ));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
