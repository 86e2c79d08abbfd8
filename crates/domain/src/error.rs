use chrono::{DateTime, Utc};

/// Shared error type used across all Faultline crates.
///
/// Variants correspond to the error kinds the API and the worker classify
/// on: admission failures surface immediately, `*Transient` kinds are
/// retried, and tool failures are absorbed by the agent loop as
/// observations rather than propagated.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("authentication required")]
    AuthN,

    #[error("forbidden")]
    AuthZ,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("message rejected by policy")]
    PolicyViolation { reason: String },

    #[error("daily quota exceeded ({limit})")]
    QuotaExceeded {
        limit: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("queue transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("llm transient failure: {0}")]
    LlmTransient(String),

    #[error("llm protocol failure: {0}")]
    LlmProtocol(String),

    #[error("tool transient failure: {0}")]
    ToolTransient(String),

    #[error("tool unauthorized: {0}")]
    ToolUnauthorized(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a worker-level failure with this error should be requeued
    /// with backoff rather than failing the turn outright.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LlmTransient(_)
                | Error::Timeout(_)
                | Error::TransportUnavailable(_)
                | Error::Storage(_)
                | Error::Io(_)
        )
    }

    /// Stable machine-readable kind, used in API bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation_error",
            Error::AuthN => "authn_error",
            Error::AuthZ => "authz_error",
            Error::NotFound(_) => "not_found",
            Error::PolicyViolation { .. } => "policy_violation",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::TransportUnavailable(_) => "transport_unavailable",
            Error::LlmTransient(_) => "llm_transient",
            Error::LlmProtocol(_) => "llm_protocol",
            Error::ToolTransient(_) => "tool_transient",
            Error::ToolUnauthorized(_) => "tool_unauthorized",
            Error::Timeout(_) => "timeout",
            Error::Io(_) | Error::Json(_) | Error::Http(_) | Error::Storage(_)
            | Error::Config(_) | Error::Internal(_) => "internal",
        }
    }
}
