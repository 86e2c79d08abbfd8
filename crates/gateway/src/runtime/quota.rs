//! Admission quota gate.
//!
//! Counts one `rca_request` per admission against the workspace's daily
//! plan limit. Workspaces on a healthy BYO LLM config bypass the counter
//! entirely; an unhealthy BYO config refuses admission outright (the
//! turn would only fail later in the worker).

use std::sync::Arc;

use chrono::Utc;

use fl_domain::config::PlanConfig;
use fl_domain::{Error, Result};
use fl_store::{next_reset, window_key, LlmProviderKind, QuotaDecision, Store, RESOURCE_RCA};

pub struct QuotaGate {
    store: Arc<Store>,
    plans: PlanConfig,
}

impl QuotaGate {
    pub fn new(store: Arc<Store>, plans: PlanConfig) -> Self {
        Self { store, plans }
    }

    /// Admit one analysis request for the workspace, or explain why not.
    pub fn admit(&self, workspace_id: &str) -> Result<()> {
        // BYO LLM workspaces pay their own tokens; no platform quota.
        if let Some(cfg) = self.store.get_llm_config(workspace_id)? {
            if cfg.provider != LlmProviderKind::Platform {
                if !cfg.healthy {
                    return Err(Error::Validation {
                        field: "llm_config",
                        message: "workspace LLM configuration is unhealthy; fix it before \
                                  sending messages"
                            .into(),
                    });
                }
                return Ok(());
            }
        }

        let now = Utc::now();
        let limit = self.plans.daily_rca_limit(workspace_id);
        let decision =
            self.store
                .quota_try_admit(workspace_id, RESOURCE_RCA, &window_key(now), limit)?;
        match decision {
            QuotaDecision::Admitted => Ok(()),
            QuotaDecision::Exceeded => Err(Error::QuotaExceeded {
                limit,
                reset_at: next_reset(now),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with_limit(limit: u32) -> (QuotaGate, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let plans = PlanConfig {
            default_daily_rca_limit: limit,
            per_workspace: Default::default(),
        };
        (QuotaGate::new(store.clone(), plans), store)
    }

    #[test]
    fn admits_until_limit_with_reset_at_midnight() {
        let (gate, _store) = gate_with_limit(2);
        gate.admit("ws").unwrap();
        gate.admit("ws").unwrap();

        match gate.admit("ws").unwrap_err() {
            Error::QuotaExceeded { limit, reset_at } => {
                assert_eq!(limit, 2);
                assert!(reset_at > Utc::now());
                assert_eq!(reset_at.format("%H:%M:%S").to_string(), "00:00:00");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn byo_workspace_bypasses_quota() {
        let (gate, store) = gate_with_limit(0);
        store
            .upsert_llm_config("ws", LlmProviderKind::OpenAi, "gpt-4o",
                Some(r#"{"api_key":"k"}"#))
            .unwrap();

        // Limit 0 would refuse a platform workspace; BYO sails through.
        gate.admit("ws").unwrap();
        gate.admit("ws").unwrap();
    }

    #[test]
    fn unhealthy_byo_config_refuses_admission() {
        let (gate, store) = gate_with_limit(10);
        store
            .upsert_llm_config("ws", LlmProviderKind::Gemini, "gemini-2.0-flash",
                Some(r#"{"api_key":"k"}"#))
            .unwrap();
        store.set_llm_config_health("ws", false).unwrap();

        let err = gate.admit("ws").unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn platform_config_rows_still_count_quota() {
        let (gate, store) = gate_with_limit(1);
        store
            .upsert_llm_config("ws", LlmProviderKind::Platform, "gpt-4o", None)
            .unwrap();

        gate.admit("ws").unwrap();
        assert!(gate.admit("ws").is_err());
    }
}
