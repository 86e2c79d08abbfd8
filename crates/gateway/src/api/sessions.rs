//! Session and turn CRUD plus feedback.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;
use uuid::Uuid;

use fl_domain::Error;

use crate::state::AppState;

use super::auth::{AuthContext, Workspace};
use super::error::ApiError;

const LIST_LIMIT_MAX: usize = 250;
const COMMENT_MAX_CHARS: usize = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(Workspace(workspace_id)): Extension<Workspace>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(LIST_LIMIT_MAX);
    let offset = params.offset.unwrap_or(0);
    let sessions = state.store.list_sessions(&workspace_id, limit, offset)?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

pub async fn get_session(
    State(state): State<AppState>,
    Extension(Workspace(workspace_id)): Extension<Workspace>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .store
        .get_session(&workspace_id, session_id)?
        .ok_or(Error::NotFound("session"))?;
    let turns = state.store.session_turns(session_id)?;
    Ok(Json(serde_json::json!({ "session": session, "turns": turns })))
}

#[derive(Debug, Deserialize)]
pub struct RenameBody {
    pub title: String,
}

pub async fn rename_session(
    State(state): State<AppState>,
    Extension(Workspace(workspace_id)): Extension<Workspace>,
    Path(session_id): Path<Uuid>,
    Json(body): Json<RenameBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let title = body.title.trim();
    if title.is_empty() || title.chars().count() > 200 {
        return Err(Error::Validation {
            field: "title",
            message: "title must be 1..200 characters".into(),
        }
        .into());
    }
    if !state.store.rename_session(&workspace_id, session_id, title)? {
        return Err(Error::NotFound("session").into());
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(Workspace(workspace_id)): Extension<Workspace>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .store
        .get_session(&workspace_id, session_id)?
        .ok_or(Error::NotFound("session"))?;

    // Only the owning user may delete an owned session.
    if let Some(owner) = &session.user_id {
        if owner != &auth.user_id {
            return Err(Error::AuthZ.into());
        }
    }

    state.store.delete_session(&workspace_id, session_id)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turns & feedback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_turn(
    State(state): State<AppState>,
    Extension(Workspace(workspace_id)): Extension<Workspace>,
    Path(turn_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let turn = state
        .store
        .get_turn_scoped(&workspace_id, turn_id)?
        .ok_or(Error::NotFound("turn"))?;
    let steps = state.store.list_steps(turn_id)?;
    Ok(Json(serde_json::json!({ "turn": turn, "steps": steps })))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub score: i8,
    #[serde(default)]
    pub comment: Option<String>,
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(Workspace(workspace_id)): Extension<Workspace>,
    Path(turn_id): Path<Uuid>,
    Json(body): Json<FeedbackBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.score != -1 && body.score != 1 {
        return Err(Error::Validation {
            field: "score",
            message: "score must be -1 or +1".into(),
        }
        .into());
    }
    if let Some(comment) = &body.comment {
        if comment.chars().count() > COMMENT_MAX_CHARS {
            return Err(Error::Validation {
                field: "comment",
                message: format!("comment must be at most {COMMENT_MAX_CHARS} characters"),
            }
            .into());
        }
    }

    state
        .store
        .get_turn_scoped(&workspace_id, turn_id)?
        .ok_or(Error::NotFound("turn"))?;

    let feedback =
        state
            .store
            .add_feedback(turn_id, &auth.user_id, body.score, body.comment.as_deref())?;
    Ok(Json(serde_json::json!({ "feedback_id": feedback.id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_admitted_job, test_state, ScriptedResolver, TEST_WORKSPACE};

    fn auth_as(user: &str) -> AuthContext {
        AuthContext {
            user_id: user.into(),
            workspace_ids: vec![TEST_WORKSPACE.into()],
        }
    }

    fn ws() -> Workspace {
        Workspace(TEST_WORKSPACE.into())
    }

    #[tokio::test]
    async fn list_and_get_round_trip() {
        let state = test_state(ScriptedResolver::new(vec![]));
        let job = seed_admitted_job(&state, "why slow?").await;
        let turn = state.store.get_turn(job.turn_id).unwrap().unwrap();

        let Json(listed) = list_sessions(
            State(state.clone()),
            Extension(ws()),
            Query(ListParams { limit: None, offset: None }),
        )
        .await
        .unwrap();
        assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);

        let Json(got) = get_session(
            State(state.clone()),
            Extension(ws()),
            Path(turn.session_id),
        )
        .await
        .unwrap();
        assert_eq!(got["turns"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_turn_includes_ordered_steps() {
        let state = test_state(ScriptedResolver::new(vec![]));
        let job = seed_admitted_job(&state, "why slow?").await;

        let Json(got) = get_turn(State(state.clone()), Extension(ws()), Path(job.turn_id))
            .await
            .unwrap();
        let steps = got["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0]["sequence"], 1);
    }

    #[tokio::test]
    async fn feedback_is_unique_per_user() {
        let state = test_state(ScriptedResolver::new(vec![]));
        let job = seed_admitted_job(&state, "why slow?").await;

        let ok = submit_feedback(
            State(state.clone()),
            Extension(auth_as("u-test")),
            Extension(ws()),
            Path(job.turn_id),
            Json(FeedbackBody { score: 1, comment: Some("useful".into()) }),
        )
        .await;
        assert!(ok.is_ok());

        let dup = submit_feedback(
            State(state.clone()),
            Extension(auth_as("u-test")),
            Extension(ws()),
            Path(job.turn_id),
            Json(FeedbackBody { score: -1, comment: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(dup.error.kind(), "validation_error");
    }

    #[tokio::test]
    async fn feedback_score_must_be_unit() {
        let state = test_state(ScriptedResolver::new(vec![]));
        let job = seed_admitted_job(&state, "why slow?").await;

        let err = submit_feedback(
            State(state.clone()),
            Extension(auth_as("u-test")),
            Extension(ws()),
            Path(job.turn_id),
            Json(FeedbackBody { score: 0, comment: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.kind(), "validation_error");
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let state = test_state(ScriptedResolver::new(vec![]));
        let job = seed_admitted_job(&state, "why slow?").await;
        let turn = state.store.get_turn(job.turn_id).unwrap().unwrap();

        // Seeded sessions are owned by "u-test".
        let denied = delete_session(
            State(state.clone()),
            Extension(auth_as("u-other")),
            Extension(ws()),
            Path(turn.session_id),
        )
        .await
        .unwrap_err();
        assert_eq!(denied.error.kind(), "authz_error");

        delete_session(
            State(state.clone()),
            Extension(auth_as("u-test")),
            Extension(ws()),
            Path(turn.session_id),
        )
        .await
        .unwrap();

        // Cascade removed the turn.
        assert!(state.store.get_turn(job.turn_id).unwrap().is_none());
    }
}
