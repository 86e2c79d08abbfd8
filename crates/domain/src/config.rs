use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm: PlatformLlmConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub plans: PlanConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_8080")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
    /// Per-IP admission rate limit (requests per second).
    #[serde(default = "d_rate_per_sec")]
    pub rate_limit_per_sec: u32,
    #[serde(default = "d_rate_burst")]
    pub rate_limit_burst: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".into(),
            allowed_origins: d_cors_origins(),
            rate_limit_per_sec: 5,
            rate_limit_burst: 20,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Static bearer-token identity. Each entry binds a token (read from the
/// named env var at startup, then hashed) to a user and the workspaces
/// that user may act in. An empty list enables dev mode: every request
/// resolves to the `dev_workspace` with a fixed user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenBinding>,
    #[serde(default = "d_dev_workspace")]
    pub dev_workspace: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            dev_workspace: d_dev_workspace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBinding {
    /// Env var holding the bearer token value.
    pub token_env: String,
    pub user_id: String,
    pub workspace_ids: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "d_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: d_db_path() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Platform LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The platform-default model, used whenever a workspace has not
/// configured its own provider. The key is read from the named env var
/// once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformLlmConfig {
    #[serde(default = "d_llm_base_url")]
    pub base_url: String,
    #[serde(default = "d_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_llm_model")]
    pub model: String,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
}

impl Default for PlatformLlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_llm_base_url(),
            api_key_env: d_llm_key_env(),
            model: d_llm_model(),
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// When true, a degraded (unavailable) guard rejects the message
    /// instead of admitting it.
    #[serde(default)]
    pub fail_closed: bool,
    /// Additional deny patterns on top of the built-in rule set.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
    /// When true, messages that pass the rule set are also classified by
    /// the platform model.
    #[serde(default)]
    pub use_model: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_closed: false,
            extra_patterns: Vec::new(),
            use_model: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plans & quotas
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Daily analysis admission limits. Workspaces on a BYO LLM config bypass
/// these entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default = "d_daily_limit")]
    pub default_daily_rca_limit: u32,
    /// Per-workspace overrides (key = workspace id).
    #[serde(default)]
    pub per_workspace: HashMap<String, u32>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            default_daily_rca_limit: 10,
            per_workspace: HashMap::new(),
        }
    }
}

impl PlanConfig {
    pub fn daily_rca_limit(&self, workspace_id: &str) -> u32 {
        self.per_workspace
            .get(workspace_id)
            .copied()
            .unwrap_or(self.default_daily_rca_limit)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue / worker / retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Above this depth, admission is refused with a capacity error.
    #[serde(default = "d_backpressure")]
    pub backpressure_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backpressure_threshold: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "d_workers")]
    pub count: usize,
    /// Total wall-clock budget for one turn execution, seconds.
    #[serde(default = "d_turn_secs")]
    pub max_turn_duration_secs: u64,
    /// Per-tool-call deadline, seconds.
    #[serde(default = "d_tool_secs")]
    pub tool_timeout_secs: u64,
    /// Maximum tool invocations per turn before a final answer is forced.
    #[serde(default = "d_max_steps")]
    pub max_steps: u32,
    /// Observation payload cap per tool call, bytes.
    #[serde(default = "d_obs_bytes")]
    pub max_observation_bytes: usize,
    /// Interval for the stale-running-job reconciler, seconds.
    #[serde(default = "d_reconcile_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            max_turn_duration_secs: 120,
            tool_timeout_secs: 20,
            max_steps: 10,
            max_observation_bytes: 8 * 1024,
            reconcile_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_3")]
    pub max_retries: u32,
    /// First-retry backoff, seconds; doubles per retry.
    #[serde(default = "d_60")]
    pub base_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 60,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Sanity-check the loaded configuration. Errors abort startup;
    /// warnings are logged and ignored.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        fn err(issues: &mut Vec<ConfigIssue>, message: String) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message,
            });
        }

        let mut issues = Vec::new();

        if self.worker.count == 0 {
            err(&mut issues, "worker.count must be at least 1".into());
        }
        if self.worker.max_steps == 0 {
            err(&mut issues, "worker.max_steps must be at least 1".into());
        }
        if self.worker.max_turn_duration_secs < self.worker.tool_timeout_secs {
            err(
                &mut issues,
                format!(
                    "worker.max_turn_duration_secs ({}) must cover at least one tool call ({})",
                    self.worker.max_turn_duration_secs, self.worker.tool_timeout_secs
                ),
            );
        }
        if self.retry.base_delay_secs == 0 {
            err(&mut issues, "retry.base_delay_secs must be non-zero".into());
        }

        if self.auth.tokens.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: format!(
                    "no auth tokens configured; running in dev mode (workspace '{}')",
                    self.auth.dev_workspace
                ),
            });
        }
        for (i, t) in self.auth.tokens.iter().enumerate() {
            if t.workspace_ids.is_empty() {
                err(&mut issues, format!("auth.tokens[{i}] grants no workspaces"));
            }
        }

        if self.guard.enabled {
            for p in &self.guard.extra_patterns {
                if p.trim().is_empty() {
                    err(
                        &mut issues,
                        "guard.extra_patterns contains an empty pattern".into(),
                    );
                }
            }
        }

        issues
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_8080() -> u16 {
    8080
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into(), "http://127.0.0.1:*".into()]
}
fn d_rate_per_sec() -> u32 {
    5
}
fn d_rate_burst() -> u32 {
    20
}
fn d_dev_workspace() -> String {
    "dev".into()
}
fn d_db_path() -> PathBuf {
    PathBuf::from("./data/faultline.db")
}
fn d_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_llm_key_env() -> String {
    "FL_PLATFORM_LLM_KEY".into()
}
fn d_llm_model() -> String {
    "gpt-4o".into()
}
fn d_temperature() -> f32 {
    0.1
}
fn d_max_tokens() -> u32 {
    4096
}
fn d_true() -> bool {
    true
}
fn d_daily_limit() -> u32 {
    10
}
fn d_backpressure() -> usize {
    500
}
fn d_workers() -> usize {
    4
}
fn d_turn_secs() -> u64 {
    120
}
fn d_tool_secs() -> u64 {
    20
}
fn d_max_steps() -> u32 {
    10
}
fn d_obs_bytes() -> usize {
    8 * 1024
}
fn d_reconcile_secs() -> u64 {
    60
}
fn d_3() -> u32 {
    3
}
fn d_60() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        let issues = config.validate();
        assert!(issues.iter().all(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn parses_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [plans]
            default_daily_rca_limit = 25

            [plans.per_workspace]
            "ws-enterprise" = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.plans.daily_rca_limit("ws-enterprise"), 500);
        assert_eq!(config.plans.daily_rca_limit("ws-other"), 25);
        assert_eq!(config.worker.max_steps, 10);
    }

    #[test]
    fn zero_workers_is_an_error() {
        let mut config = Config::default();
        config.worker.count = 0;
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }
}
