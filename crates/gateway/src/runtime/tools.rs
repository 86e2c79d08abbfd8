//! The tool layer: uniform, schema-validated callables over integration
//! adapters.
//!
//! Tools are built per job from the workspace's healthy integrations,
//! one per (integration, capability), named `<capability>.<provider>`
//! (e.g. `logs.search.loki`). The workspace is bound at construction —
//! the model never chooses it. Tool failures never abort the agent
//! loop; they come back as `ERROR:`-prefixed observations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use fl_domain::chat::ToolDefinition;
use fl_domain::{Error, Result};
use fl_integrations::{
    AdapterHandle, Capability, IntegrationRegistry, LogEntry, MetricSeries, TimeRange,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the model sees after a tool call.
#[derive(Debug, Clone)]
pub struct Observation {
    pub content: String,
    pub is_error: bool,
}

impl Observation {
    pub fn ok(content: String) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(detail: impl std::fmt::Display) -> Self {
        Self {
            content: format!("ERROR: {detail}"),
            is_error: true,
        }
    }
}

/// Cap an observation at `max_bytes` (on a char boundary) with an
/// explicit truncation marker.
pub fn truncate_observation(s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…<truncated>", &s[..cut])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolSet
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The async body of one tool.
#[async_trait::async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, input: &Value) -> Result<String>;
}

struct ToolEntry {
    definition: ToolDefinition,
    validator: jsonschema::Validator,
    runner: Arc<dyn ToolRunner>,
}

/// The tools available to one turn, keyed by name (sorted, so the
/// manifest shown to the model is deterministic).
#[derive(Default)]
pub struct ToolSet {
    tools: BTreeMap<String, ToolEntry>,
}

impl ToolSet {
    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        parameters: Value,
        runner: Arc<dyn ToolRunner>,
    ) -> Result<()> {
        let validator = jsonschema::validator_for(&parameters)
            .map_err(|e| Error::Internal(format!("tool '{name}' schema: {e}")))?;
        self.tools.insert(
            name.to_owned(),
            ToolEntry {
                definition: ToolDefinition {
                    name: name.to_owned(),
                    description: description.to_owned(),
                    parameters,
                },
                validator,
                runner,
            },
        );
        Ok(())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Validate and invoke a tool. Always returns an observation; the
    /// error cases are in-band so the agent can read them and adapt.
    pub async fn invoke(
        &self,
        name: &str,
        input: &Value,
        timeout: Duration,
        max_observation_bytes: usize,
    ) -> Observation {
        let Some(entry) = self.tools.get(name) else {
            return Observation::error(format!("unknown tool '{name}'"));
        };

        let errors: Vec<String> = entry
            .validator
            .iter_errors(input)
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            return Observation::error(format!("invalid arguments: {}", errors.join("; ")));
        }

        match tokio::time::timeout(timeout, entry.runner.run(input)).await {
            Err(_) => Observation::error(format!("timeout after {}s", timeout.as_secs())),
            Ok(Err(e)) => {
                let detail = match &e {
                    Error::ToolTransient(m) => format!("upstream unavailable: {m}"),
                    Error::ToolUnauthorized(m) => format!("integration unauthorized: {m}"),
                    other => other.to_string(),
                };
                Observation::error(detail)
            }
            Ok(Ok(content)) => {
                Observation::ok(truncate_observation(content, max_observation_bytes))
            }
        }
    }
}

/// Build the tool set for a workspace from its healthy integrations.
pub fn build_tool_set(
    registry: &Arc<IntegrationRegistry>,
    workspace_id: &str,
) -> Result<ToolSet> {
    let mut set = ToolSet::default();
    for (provider, capability) in registry.list_capabilities(workspace_id)? {
        let name = capability.tool_name(&provider);
        let runner = Arc::new(CapabilityRunner {
            registry: registry.clone(),
            workspace_id: workspace_id.to_owned(),
            provider: provider.clone(),
            capability,
        });
        set.register(
            &name,
            &describe(capability, &provider),
            schema_for(capability),
            runner,
        )?;
    }
    Ok(set)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Binds one (workspace, provider, capability) triple. Opens a fresh
/// adapter handle per invocation so decrypted credentials never outlive
/// the call.
struct CapabilityRunner {
    registry: Arc<IntegrationRegistry>,
    workspace_id: String,
    provider: String,
    capability: Capability,
}

#[async_trait::async_trait]
impl ToolRunner for CapabilityRunner {
    async fn run(&self, input: &Value) -> Result<String> {
        let handle = self
            .registry
            .open(&self.workspace_id, &self.provider, self.capability)?;
        let result = dispatch(handle, self.capability, input).await;
        if matches!(result, Err(Error::ToolUnauthorized(_))) {
            self.registry.mark_unhealthy(&self.workspace_id, &self.provider);
        }
        result
    }
}

async fn dispatch(handle: AdapterHandle, capability: Capability, input: &Value) -> Result<String> {
    let minutes = int_arg(input, "minutes").unwrap_or(60).clamp(1, 24 * 60);
    let range = TimeRange::last_minutes(minutes);

    match (handle, capability) {
        (AdapterHandle::Logs(logs), Capability::LogsSearch) => {
            let query = str_arg(input, "query")?;
            let limit = int_arg(input, "limit").unwrap_or(100).clamp(1, 1000) as usize;
            let entries = logs.search(query, &range, limit).await?;
            Ok(format_log_entries(&entries))
        }
        (AdapterHandle::Logs(logs), Capability::LogsErrors) => {
            let service = str_arg(input, "service")?;
            let entries = logs.errors(service, &range).await?;
            Ok(format_log_entries(&entries))
        }
        (AdapterHandle::Metrics(metrics), Capability::MetricsQuery) => {
            let query = str_arg(input, "query")?;
            let step = int_arg(input, "step_secs").unwrap_or(60).clamp(1, 3600) as u64;
            let series = metrics.query(query, &range, step).await?;
            Ok(format_series(&series))
        }
        (AdapterHandle::Metrics(metrics), Capability::MetricsCpu) => {
            let service = str_arg(input, "service")?;
            Ok(format_series(&metrics.cpu(service, &range).await?))
        }
        (AdapterHandle::Metrics(metrics), Capability::MetricsMemory) => {
            let service = str_arg(input, "service")?;
            Ok(format_series(&metrics.memory(service, &range).await?))
        }
        (AdapterHandle::Metrics(metrics), Capability::MetricsLatency) => {
            let service = str_arg(input, "service")?;
            Ok(format_series(&metrics.latency(service, &range).await?))
        }
        (AdapterHandle::Code(code), Capability::CodeListRepos) => {
            let repos = code.list_repos().await?;
            let lines: Vec<String> = repos
                .iter()
                .map(|r| format!("{} (default branch: {})", r.full_name, r.default_branch))
                .collect();
            Ok(format!("{} repositories:\n{}", repos.len(), lines.join("\n")))
        }
        (AdapterHandle::Code(code), Capability::CodeRead) => {
            let repo = str_arg(input, "repo")?;
            let path = str_arg(input, "path")?;
            let reference = input.get("ref").and_then(|v| v.as_str());
            code.read_file(repo, path, reference).await
        }
        (AdapterHandle::Code(code), Capability::CodeSearch) => {
            let text = str_arg(input, "text")?;
            let repo = input.get("repo").and_then(|v| v.as_str());
            let matches = code.search(repo, text).await?;
            let lines: Vec<String> = matches
                .iter()
                .map(|m| format!("{}:{}", m.repo, m.path))
                .collect();
            Ok(format!("{} matches:\n{}", matches.len(), lines.join("\n")))
        }
        (AdapterHandle::Code(code), Capability::CodeListCommits) => {
            let repo = str_arg(input, "repo")?;
            let branch = input.get("branch").and_then(|v| v.as_str());
            let limit = int_arg(input, "limit").unwrap_or(20).clamp(1, 100) as usize;
            let commits = code.list_commits(repo, branch, limit).await?;
            let lines: Vec<String> = commits
                .iter()
                .map(|c| {
                    let when = c
                        .timestamp
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "unknown time".into());
                    format!("{} {} ({}, {})", &c.sha[..c.sha.len().min(8)], c.message, c.author, when)
                })
                .collect();
            Ok(format!("{} commits:\n{}", commits.len(), lines.join("\n")))
        }
        (_, capability) => Err(Error::Internal(format!(
            "adapter does not serve {}",
            capability.as_str()
        ))),
    }
}

fn str_arg<'a>(input: &'a Value, key: &'static str) -> Result<&'a str> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or(Error::Validation {
            field: key,
            message: "missing required string argument".into(),
        })
}

fn int_arg(input: &Value, key: &str) -> Option<i64> {
    input.get(key).and_then(|v| v.as_i64())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Formatters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn format_log_entries(entries: &[LogEntry]) -> String {
    if entries.is_empty() {
        return "no matching log lines in the time range".into();
    }
    let lines: Vec<String> = entries
        .iter()
        .map(|e| format!("{}  {}", e.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"), e.line))
        .collect();
    format!(
        "found {} log lines (newest first):\n{}",
        entries.len(),
        lines.join("\n")
    )
}

fn format_series(series: &[MetricSeries]) -> String {
    if series.is_empty() {
        return "no series matched the query in the time range".into();
    }
    let lines: Vec<String> = series
        .iter()
        .map(|s| {
            if s.points.is_empty() {
                return format!("{}: no points", s.labels);
            }
            let values: Vec<f64> = s.points.iter().map(|p| p.value).collect();
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let last = *values.last().unwrap_or(&0.0);
            format!(
                "{}: {} points, min={min:.4}, max={max:.4}, last={last:.4}",
                s.labels,
                s.points.len()
            )
        })
        .collect();
    format!("{} series:\n{}", series.len(), lines.join("\n"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-capability schemas & descriptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn describe(capability: Capability, provider: &str) -> String {
    match capability {
        Capability::LogsSearch => format!(
            "Search log lines in {provider} with a provider query expression. Use for \
             finding specific messages, request ids, or error text in a service's logs."
        ),
        Capability::LogsErrors => format!(
            "Fetch recent error-level log lines for one service from {provider}. The \
             fastest way to see what a service is complaining about."
        ),
        Capability::MetricsQuery => format!(
            "Run a raw metrics query against {provider} over a time range and get \
             per-series summaries (min/max/last)."
        ),
        Capability::MetricsCpu => format!(
            "CPU usage series for one service from {provider}. Use when investigating \
             saturation or throttling."
        ),
        Capability::MetricsMemory => format!(
            "Memory working-set series for one service from {provider}. Use when \
             investigating leaks or OOM kills."
        ),
        Capability::MetricsLatency => format!(
            "p99 request latency series for one service from {provider}. Use to confirm \
             and time-bound a slowness report."
        ),
        Capability::CodeRead => format!(
            "Read one file from a repository via {provider}. Use after locating a \
             suspicious file or config."
        ),
        Capability::CodeSearch => format!(
            "Search code via {provider} for a string, optionally within one repository."
        ),
        Capability::CodeListCommits => format!(
            "List recent commits on a repository via {provider}. Use to correlate a \
             regression window with deployed changes."
        ),
        Capability::CodeListRepos => {
            format!("List repositories accessible via {provider}.")
        }
    }
}

fn schema_for(capability: Capability) -> Value {
    let obj = |properties: Value, required: &[&str]| {
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    };
    let minutes = serde_json::json!({
        "type": "integer",
        "description": "Look-back window in minutes (default 60)"
    });

    match capability {
        Capability::LogsSearch => obj(
            serde_json::json!({
                "query": {"type": "string", "description": "Log query expression"},
                "minutes": minutes,
                "limit": {"type": "integer", "description": "Max lines (default 100)"},
            }),
            &["query"],
        ),
        Capability::LogsErrors => obj(
            serde_json::json!({
                "service": {"type": "string", "description": "Service name"},
                "minutes": minutes,
            }),
            &["service"],
        ),
        Capability::MetricsQuery => obj(
            serde_json::json!({
                "query": {"type": "string", "description": "Metrics query expression"},
                "minutes": minutes,
                "step_secs": {"type": "integer", "description": "Resolution step in seconds (default 60)"},
            }),
            &["query"],
        ),
        Capability::MetricsCpu | Capability::MetricsMemory | Capability::MetricsLatency => obj(
            serde_json::json!({
                "service": {"type": "string", "description": "Service name"},
                "minutes": minutes,
            }),
            &["service"],
        ),
        Capability::CodeRead => obj(
            serde_json::json!({
                "repo": {"type": "string", "description": "Repository, e.g. 'org/name'"},
                "path": {"type": "string", "description": "File path within the repository"},
                "ref": {"type": "string", "description": "Branch, tag, or commit (optional)"},
            }),
            &["repo", "path"],
        ),
        Capability::CodeSearch => obj(
            serde_json::json!({
                "text": {"type": "string", "description": "Text to search for"},
                "repo": {"type": "string", "description": "Restrict to one repository (optional)"},
            }),
            &["text"],
        ),
        Capability::CodeListCommits => obj(
            serde_json::json!({
                "repo": {"type": "string", "description": "Repository, e.g. 'org/name'"},
                "branch": {"type": "string", "description": "Branch (default: default branch)"},
                "limit": {"type": "integer", "description": "Max commits (default 20)"},
            }),
            &["repo"],
        ),
        Capability::CodeListRepos => obj(serde_json::json!({}), &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoRunner;

    #[async_trait::async_trait]
    impl ToolRunner for EchoRunner {
        async fn run(&self, input: &Value) -> Result<String> {
            Ok(format!("echo: {}", input["query"].as_str().unwrap_or("")))
        }
    }

    struct SlowRunner;

    #[async_trait::async_trait]
    impl ToolRunner for SlowRunner {
        async fn run(&self, _input: &Value) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("never".into())
        }
    }

    struct FailingRunner;

    #[async_trait::async_trait]
    impl ToolRunner for FailingRunner {
        async fn run(&self, _input: &Value) -> Result<String> {
            Err(Error::ToolTransient("503 from upstream".into()))
        }
    }

    fn echo_set() -> ToolSet {
        let mut set = ToolSet::default();
        set.register(
            "logs.search.test",
            "test tool",
            schema_for(Capability::LogsSearch),
            Arc::new(EchoRunner),
        )
        .unwrap();
        set
    }

    const TIMEOUT: Duration = Duration::from_secs(20);
    const MAX_BYTES: usize = 8 * 1024;

    #[tokio::test]
    async fn invoke_happy_path() {
        let set = echo_set();
        let obs = set
            .invoke(
                "logs.search.test",
                &serde_json::json!({"query": "error"}),
                TIMEOUT,
                MAX_BYTES,
            )
            .await;
        assert!(!obs.is_error);
        assert_eq!(obs.content, "echo: error");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_observation() {
        let set = echo_set();
        let obs = set
            .invoke("logs.search.nope", &serde_json::json!({}), TIMEOUT, MAX_BYTES)
            .await;
        assert!(obs.is_error);
        assert!(obs.content.starts_with("ERROR: unknown tool"));
    }

    #[tokio::test]
    async fn invalid_arguments_are_fed_back() {
        let set = echo_set();
        // `query` missing and an unexpected property present.
        let obs = set
            .invoke(
                "logs.search.test",
                &serde_json::json!({"servce": "api-gw"}),
                TIMEOUT,
                MAX_BYTES,
            )
            .await;
        assert!(obs.is_error);
        assert!(obs.content.starts_with("ERROR: invalid arguments:"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_error_observation() {
        let mut set = ToolSet::default();
        set.register(
            "slow.tool",
            "never returns",
            serde_json::json!({"type": "object"}),
            Arc::new(SlowRunner),
        )
        .unwrap();

        let obs = set
            .invoke("slow.tool", &serde_json::json!({}), Duration::from_secs(20), MAX_BYTES)
            .await;
        assert!(obs.is_error);
        assert_eq!(obs.content, "ERROR: timeout after 20s");
    }

    #[tokio::test]
    async fn transient_failure_is_upstream_unavailable() {
        let mut set = ToolSet::default();
        set.register(
            "flaky.tool",
            "fails",
            serde_json::json!({"type": "object"}),
            Arc::new(FailingRunner),
        )
        .unwrap();

        let obs = set
            .invoke("flaky.tool", &serde_json::json!({}), TIMEOUT, MAX_BYTES)
            .await;
        assert!(obs.is_error);
        assert!(obs.content.contains("upstream unavailable"));
    }

    #[test]
    fn truncation_appends_marker() {
        let long = "x".repeat(10_000);
        let out = truncate_observation(long, 8 * 1024);
        assert!(out.ends_with("…<truncated>"));
        assert!(out.len() < 10_000);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(5000); // 2 bytes each
        let out = truncate_observation(s, 8 * 1024 + 1); // odd cut point
        assert!(out.ends_with("…<truncated>"));
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let mut set = ToolSet::default();
        set.register("b.tool", "b", serde_json::json!({"type": "object"}), Arc::new(EchoRunner))
            .unwrap();
        set.register("a.tool", "a", serde_json::json!({"type": "object"}), Arc::new(EchoRunner))
            .unwrap();
        let names: Vec<String> = set.definitions().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["a.tool", "b.tool"]);
    }

    #[test]
    fn every_capability_schema_compiles() {
        for cap in Capability::ALL {
            jsonschema::validator_for(&schema_for(cap)).unwrap();
        }
    }

    struct TwoLogProviders;

    impl fl_integrations::IntegrationSource for TwoLogProviders {
        fn integrations(
            &self,
            _workspace_id: &str,
        ) -> Result<Vec<fl_integrations::IntegrationRecord>> {
            Ok(vec![
                fl_integrations::IntegrationRecord {
                    provider: "loki".into(),
                    capabilities: vec![Capability::LogsSearch, Capability::LogsErrors],
                    credentials_json: r#"{"base_url":"http://loki:3100"}"#.into(),
                    healthy: true,
                },
                fl_integrations::IntegrationRecord {
                    provider: "datadog".into(),
                    capabilities: vec![Capability::LogsSearch, Capability::MetricsLatency],
                    credentials_json: r#"{"token":"k","app_key":"a"}"#.into(),
                    healthy: true,
                },
            ])
        }
        fn mark_unhealthy(&self, _workspace_id: &str, _provider: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn same_capability_from_two_providers_yields_distinct_tools() {
        let registry = Arc::new(IntegrationRegistry::new(Arc::new(TwoLogProviders)));
        let set = build_tool_set(&registry, "ws").unwrap();

        let names: Vec<String> = set.definitions().iter().map(|d| d.name.clone()).collect();
        assert!(names.contains(&"logs.search.loki".to_string()));
        assert!(names.contains(&"logs.search.datadog".to_string()));
        assert!(names.contains(&"logs.errors.loki".to_string()));
        assert!(names.contains(&"metrics.latency.datadog".to_string()));
        assert_eq!(set.len(), 4);
    }
}
