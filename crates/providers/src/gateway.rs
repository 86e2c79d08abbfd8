//! Workspace-aware model selection.
//!
//! The gateway owns provider credentials end to end: BYO keys are decoded
//! from the workspace's stored config here and never leave this module.
//! Health is checked upstream (admission refuses a workspace with an
//! unhealthy BYO config); the gateway assumes the handle it builds is
//! usable.

use std::sync::Arc;

use serde::Deserialize;

use fl_domain::config::PlatformLlmConfig;
use fl_domain::{Error, Result};

use crate::gemini::GeminiModel;
use crate::openai::OpenAiModel;
use crate::retry::RetryingModel;
use crate::traits::ChatModel;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace LLM selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmKind {
    Platform,
    OpenAi,
    AzureOpenAi,
    Gemini,
}

/// Decrypted BYO credentials. `base_url` overrides the provider default
/// (required for Azure, optional elsewhere).
#[derive(Debug, Clone, Deserialize)]
pub struct ByoCredentials {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// One workspace's model selection, as resolved from the store.
#[derive(Debug, Clone)]
pub struct WorkspaceLlm {
    pub kind: LlmKind,
    pub model: String,
    /// Raw credentials blob for BYO providers.
    pub credentials_json: Option<String>,
}

/// Seam the worker uses to obtain a model handle; lets tests substitute
/// scripted models.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, workspace_llm: Option<&WorkspaceLlm>) -> Result<Arc<dyn ChatModel>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LlmGateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LlmGateway {
    platform: PlatformLlmConfig,
    /// Platform API key, read once at startup from the configured env var.
    platform_key: Option<String>,
}

impl LlmGateway {
    pub fn new(platform: PlatformLlmConfig) -> Self {
        let platform_key = std::env::var(&platform.api_key_env).ok().filter(|k| !k.is_empty());
        if platform_key.is_none() {
            tracing::warn!(
                env = %platform.api_key_env,
                "platform LLM key not set; platform-model workspaces will fail"
            );
        }
        Self {
            platform,
            platform_key,
        }
    }

    fn platform_model(&self) -> Result<Arc<dyn ChatModel>> {
        let key = self
            .platform_key
            .clone()
            .ok_or_else(|| Error::LlmProtocol("platform LLM key not configured".into()))?;
        let model = OpenAiModel::new(&self.platform.base_url, key, self.platform.model.clone())?;
        Ok(RetryingModel::wrap(Arc::new(model)))
    }

    fn byo_model(&self, cfg: &WorkspaceLlm) -> Result<Arc<dyn ChatModel>> {
        if !model_allowed(cfg.kind, &cfg.model) {
            return Err(Error::Validation {
                field: "model",
                message: format!("model '{}' is not allowed for this provider", cfg.model),
            });
        }
        let raw = cfg.credentials_json.as_deref().ok_or_else(|| {
            Error::Config("BYO LLM config has no credentials".into())
        })?;
        let creds: ByoCredentials = serde_json::from_str(raw)
            .map_err(|_| Error::Config("BYO LLM credentials are malformed".into()))?;

        let inner: Arc<dyn ChatModel> = match cfg.kind {
            LlmKind::OpenAi => {
                let base = creds.base_url.as_deref().unwrap_or("https://api.openai.com/v1");
                Arc::new(OpenAiModel::new(base, creds.api_key, cfg.model.clone())?)
            }
            LlmKind::AzureOpenAi => {
                let base = creds.base_url.as_deref().ok_or_else(|| {
                    Error::Config("azure-openai config requires base_url".into())
                })?;
                Arc::new(OpenAiModel::azure(base, creds.api_key, cfg.model.clone())?)
            }
            LlmKind::Gemini => {
                let base = creds
                    .base_url
                    .as_deref()
                    .unwrap_or("https://generativelanguage.googleapis.com");
                Arc::new(GeminiModel::new(base, creds.api_key, cfg.model.clone())?)
            }
            LlmKind::Platform => return self.platform_model(),
        };
        Ok(RetryingModel::wrap(inner))
    }
}

impl ModelResolver for LlmGateway {
    fn resolve(&self, workspace_llm: Option<&WorkspaceLlm>) -> Result<Arc<dyn ChatModel>> {
        match workspace_llm {
            None => self.platform_model(),
            Some(cfg) if cfg.kind == LlmKind::Platform => self.platform_model(),
            Some(cfg) => self.byo_model(cfg),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model allow-lists
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Provider-specific model name checks. Azure deployments are customer
/// named, so any non-empty name passes there.
pub fn model_allowed(kind: LlmKind, model: &str) -> bool {
    if model.is_empty() || model.len() > 128 {
        return false;
    }
    match kind {
        LlmKind::Platform => true,
        LlmKind::OpenAi => {
            ["gpt-", "o1", "o3", "o4"].iter().any(|p| model.starts_with(p))
        }
        LlmKind::AzureOpenAi => model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'),
        LlmKind::Gemini => model.starts_with("gemini-"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_per_provider() {
        assert!(model_allowed(LlmKind::OpenAi, "gpt-4o"));
        assert!(model_allowed(LlmKind::OpenAi, "o3-mini"));
        assert!(!model_allowed(LlmKind::OpenAi, "claude-3"));
        assert!(model_allowed(LlmKind::Gemini, "gemini-2.0-flash"));
        assert!(!model_allowed(LlmKind::Gemini, "gpt-4o"));
        assert!(model_allowed(LlmKind::AzureOpenAi, "my-gpt4-deployment"));
        assert!(!model_allowed(LlmKind::AzureOpenAi, "bad name with spaces"));
        assert!(!model_allowed(LlmKind::OpenAi, ""));
    }

    #[test]
    fn byo_with_disallowed_model_is_rejected() {
        let gw = LlmGateway::new(PlatformLlmConfig::default());
        let cfg = WorkspaceLlm {
            kind: LlmKind::Gemini,
            model: "gpt-4o".into(),
            credentials_json: Some(r#"{"api_key":"k"}"#.into()),
        };
        let err = match gw.resolve(Some(&cfg)) {
            Err(e) => e,
            Ok(_) => panic!("expected resolve to fail"),
        };
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn byo_openai_builds() {
        let gw = LlmGateway::new(PlatformLlmConfig::default());
        let cfg = WorkspaceLlm {
            kind: LlmKind::OpenAi,
            model: "gpt-4o".into(),
            credentials_json: Some(r#"{"api_key":"sk-test"}"#.into()),
        };
        let model = gw.resolve(Some(&cfg)).unwrap();
        assert_eq!(model.model_id(), "gpt-4o");
    }

    #[test]
    fn azure_requires_base_url() {
        let gw = LlmGateway::new(PlatformLlmConfig::default());
        let cfg = WorkspaceLlm {
            kind: LlmKind::AzureOpenAi,
            model: "prod-gpt4".into(),
            credentials_json: Some(r#"{"api_key":"k"}"#.into()),
        };
        assert!(gw.resolve(Some(&cfg)).is_err());
    }
}
