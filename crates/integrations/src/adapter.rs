//! Adapter traits and the data shapes they return.
//!
//! Adapters are thin typed clients over each provider's HTTP API. They
//! hold decrypted credentials only for the lifetime of one tool call;
//! the registry constructs a fresh handle per invocation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fl_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// The trailing `minutes` before now.
    pub fn last_minutes(minutes: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - chrono::Duration::minutes(minutes),
            end,
        }
    }
}

/// Decoded integration credentials. The blob is written by the settings
/// surface; only the registry reads it.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Secondary key for providers that need one (Datadog app key).
    #[serde(default)]
    pub app_key: Option<String>,
}

impl Credentials {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|_| Error::Config("integration credentials are malformed".into()))
    }

    pub fn require_base_url(&self) -> Result<&str> {
        self.base_url
            .as_deref()
            .ok_or_else(|| Error::Config("integration credentials missing base_url".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub line: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub labels: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSeries {
    /// Label set identifying the series, e.g. `{service="api-gw"}`.
    pub labels: String,
    pub points: Vec<MetricPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoInfo {
    pub full_name: String,
    pub default_branch: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeMatch {
    pub repo: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait LogsAdapter: Send + Sync {
    async fn search(&self, query: &str, range: &TimeRange, limit: usize)
        -> Result<Vec<LogEntry>>;
    async fn errors(&self, service: &str, range: &TimeRange) -> Result<Vec<LogEntry>>;
}

#[async_trait::async_trait]
pub trait MetricsAdapter: Send + Sync {
    async fn query(&self, expr: &str, range: &TimeRange, step_secs: u64)
        -> Result<Vec<MetricSeries>>;
    async fn cpu(&self, service: &str, range: &TimeRange) -> Result<Vec<MetricSeries>>;
    async fn memory(&self, service: &str, range: &TimeRange) -> Result<Vec<MetricSeries>>;
    async fn latency(&self, service: &str, range: &TimeRange) -> Result<Vec<MetricSeries>>;
}

#[async_trait::async_trait]
pub trait CodeAdapter: Send + Sync {
    async fn list_repos(&self) -> Result<Vec<RepoInfo>>;
    async fn read_file(&self, repo: &str, path: &str, reference: Option<&str>) -> Result<String>;
    async fn search(&self, repo: Option<&str>, text: &str) -> Result<Vec<CodeMatch>>;
    async fn list_commits(
        &self,
        repo: &str,
        branch: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommitInfo>>;
}

/// A capability-typed adapter handle, valid for one tool invocation.
#[derive(Clone)]
pub enum AdapterHandle {
    Logs(Arc<dyn LogsAdapter>),
    Metrics(Arc<dyn MetricsAdapter>),
    Code(Arc<dyn CodeAdapter>),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared HTTP error mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn transport_err(provider: &str, e: reqwest::Error) -> Error {
    Error::ToolTransient(format!("{provider}: {e}"))
}

/// 401/403 marks the integration unhealthy upstream; 429/5xx is
/// transient; other statuses are reported as-is for the agent to read.
pub(crate) fn status_err(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let snippet: String = body.chars().take(200).collect();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        Error::ToolUnauthorized(format!("{provider}: HTTP {status}"))
    } else if status.as_u16() == 429 || status.is_server_error() {
        Error::ToolTransient(format!("{provider}: HTTP {status}: {snippet}"))
    } else {
        Error::Http(format!("{provider}: HTTP {status}: {snippet}"))
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .map_err(|e| Error::Internal(format!("http client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_decode() {
        let c = Credentials::from_json(r#"{"base_url":"http://loki:3100","token":"t"}"#).unwrap();
        assert_eq!(c.require_base_url().unwrap(), "http://loki:3100");

        let bad = Credentials::from_json("not json");
        assert!(bad.is_err());
    }

    #[test]
    fn unauthorized_maps_to_tool_unauthorized() {
        let e = status_err("github", reqwest::StatusCode::UNAUTHORIZED, "bad token");
        assert_eq!(e.kind(), "tool_unauthorized");
    }

    #[test]
    fn server_errors_are_transient() {
        let e = status_err("loki", reqwest::StatusCode::SERVICE_UNAVAILABLE, "down");
        assert_eq!(e.kind(), "tool_transient");
    }
}
