//! Error-to-HTTP mapping for the API surface.
//!
//! Every handler returns `Result<_, ApiError>`; the mapping here keeps
//! machine-readable kinds stable for clients while keeping internal
//! detail out of responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use fl_domain::Error;

#[derive(Debug)]
pub struct ApiError {
    pub error: Error,
    /// Extra qualifier for clients, e.g. `capacity` on a backpressure
    /// refusal.
    pub reason: Option<&'static str>,
}

impl ApiError {
    /// Queue backpressure refusal: same kind as quota, distinct reason.
    pub fn capacity() -> Self {
        Self {
            error: Error::QuotaExceeded {
                limit: 0,
                reset_at: chrono::Utc::now(),
            },
            reason: Some("capacity"),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            error,
            reason: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.error.kind();
        let (status, mut body) = match &self.error {
            Error::Validation { field, message } => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "error": kind,
                    "field": field,
                    "message": message,
                }),
            ),
            Error::AuthN => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": kind, "message": "authentication required" }),
            ),
            Error::AuthZ => (
                StatusCode::FORBIDDEN,
                serde_json::json!({ "error": kind, "message": "forbidden" }),
            ),
            Error::NotFound(what) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": kind, "message": format!("{what} not found") }),
            ),
            // Deliberately generic: the security event has the detail.
            Error::PolicyViolation { .. } => (
                StatusCode::FORBIDDEN,
                serde_json::json!({
                    "error": kind,
                    "message": "message rejected by content policy",
                }),
            ),
            Error::QuotaExceeded { limit, reset_at } => {
                let body = if self.reason == Some("capacity") {
                    serde_json::json!({
                        "error": kind,
                        "message": "the system is at capacity, try again shortly",
                    })
                } else {
                    serde_json::json!({
                        "error": kind,
                        "message": "daily analysis quota exceeded",
                        "limit": limit,
                        "reset_at": reset_at.to_rfc3339(),
                    })
                };
                (StatusCode::TOO_MANY_REQUESTS, body)
            }
            Error::TransportUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "error": kind,
                    "message": "could not queue the analysis, try again",
                }),
            ),
            Error::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                serde_json::json!({ "error": kind, "message": "the operation timed out" }),
            ),
            other => {
                tracing::error!(error = %other, "internal error on API path");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal", "message": "internal error" }),
                )
            }
        };

        if let Some(reason) = self.reason {
            body["reason"] = serde_json::json!(reason);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(resp: Response) -> (StatusCode, serde_json::Value) {
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn quota_exceeded_carries_limit_and_reset() {
        let reset = chrono::Utc::now();
        let err: ApiError = Error::QuotaExceeded { limit: 10, reset_at: reset }.into();
        let (status, body) = body_of(err.into_response()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "quota_exceeded");
        assert_eq!(body["limit"], 10);
        assert!(body["reset_at"].is_string());
    }

    #[tokio::test]
    async fn capacity_refusal_has_reason_without_limit() {
        let (status, body) = body_of(ApiError::capacity().into_response()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "quota_exceeded");
        assert_eq!(body["reason"], "capacity");
        assert!(body.get("limit").is_none());
    }

    #[tokio::test]
    async fn policy_violation_hides_the_reason() {
        let err: ApiError = Error::PolicyViolation { reason: "injection".into() }.into();
        let (status, body) = body_of(err.into_response()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!body.to_string().contains("injection"));
    }

    #[tokio::test]
    async fn internal_errors_are_opaque() {
        let err: ApiError = Error::Storage("secret table detail".into()).into();
        let (status, body) = body_of(err.into_response()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.to_string().contains("secret table detail"));
    }
}
