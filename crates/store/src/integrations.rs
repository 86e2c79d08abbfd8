//! Integration credential rows and per-workspace LLM configs.
//!
//! These tables are written by the (out-of-scope) settings surface; the
//! core only reads them. Upserts exist so bootstrap and tests can seed
//! workspaces.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use fl_domain::{Error, Result};

use crate::{parse_ts, parse_uuid, storage, ts, Store};

/// One configured observability/code integration for a workspace.
///
/// `credentials_json` is an opaque blob; the integration registry is the
/// only component that decodes it, and decoded material never outlives a
/// single tool invocation.
#[derive(Debug, Clone)]
pub struct IntegrationRow {
    pub id: Uuid,
    pub workspace_id: String,
    /// Provider slug, e.g. `loki`, `prometheus`, `github`.
    pub provider: String,
    /// Capability names this integration serves.
    pub capabilities: Vec<String>,
    pub credentials_json: String,
    pub healthy: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProviderKind {
    Platform,
    OpenAi,
    AzureOpenAi,
    Gemini,
}

impl LlmProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmProviderKind::Platform => "platform",
            LlmProviderKind::OpenAi => "openai",
            LlmProviderKind::AzureOpenAi => "azure-openai",
            LlmProviderKind::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "platform" => Some(LlmProviderKind::Platform),
            "openai" => Some(LlmProviderKind::OpenAi),
            "azure-openai" => Some(LlmProviderKind::AzureOpenAi),
            "gemini" => Some(LlmProviderKind::Gemini),
            _ => None,
        }
    }
}

/// Per-workspace model selection. `platform` rows carry no credentials.
#[derive(Debug, Clone)]
pub struct LlmConfigRow {
    pub workspace_id: String,
    pub provider: LlmProviderKind,
    pub model: String,
    pub credentials_json: Option<String>,
    pub healthy: bool,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    pub fn upsert_integration(
        &self,
        workspace_id: &str,
        provider: &str,
        capabilities: &[String],
        credentials_json: &str,
    ) -> Result<IntegrationRow> {
        let now = Utc::now();
        let caps = serde_json::to_string(capabilities)?;
        self.with(|conn| {
            conn.execute(
                "INSERT INTO integrations
                   (id, workspace_id, provider, capabilities, credentials_json, healthy,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
                 ON CONFLICT(workspace_id, provider) DO UPDATE SET
                    capabilities = excluded.capabilities,
                    credentials_json = excluded.credentials_json,
                    healthy = 1,
                    updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    workspace_id,
                    provider,
                    caps,
                    credentials_json,
                    ts(now),
                ],
            )
            .map_err(storage)?;
            Ok(())
        })?;
        self.get_integration(workspace_id, provider)?
            .ok_or_else(|| Error::Storage("integration upsert did not persist".into()))
    }

    pub fn get_integration(
        &self,
        workspace_id: &str,
        provider: &str,
    ) -> Result<Option<IntegrationRow>> {
        self.with(|conn| {
            conn.query_row(
                &format!("{INTEGRATION_SELECT} WHERE workspace_id = ?1 AND provider = ?2"),
                params![workspace_id, provider],
                integration_from_row,
            )
            .optional()
            .map_err(storage)?
            .transpose()
        })
    }

    pub fn list_integrations(&self, workspace_id: &str) -> Result<Vec<IntegrationRow>> {
        self.with(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{INTEGRATION_SELECT} WHERE workspace_id = ?1 ORDER BY provider"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![workspace_id], integration_from_row)
                .map_err(storage)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage)??);
            }
            Ok(out)
        })
    }

    /// Flip an integration's health flag (e.g. after an auth failure).
    pub fn set_integration_health(
        &self,
        workspace_id: &str,
        provider: &str,
        healthy: bool,
    ) -> Result<bool> {
        self.with(|conn| {
            let n = conn
                .execute(
                    "UPDATE integrations SET healthy = ?1, updated_at = ?2
                     WHERE workspace_id = ?3 AND provider = ?4",
                    params![healthy as i64, ts(Utc::now()), workspace_id, provider],
                )
                .map_err(storage)?;
            Ok(n > 0)
        })
    }

    // ── LLM configs ─────────────────────────────────────────────────

    pub fn upsert_llm_config(
        &self,
        workspace_id: &str,
        provider: LlmProviderKind,
        model: &str,
        credentials_json: Option<&str>,
    ) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO llm_configs
                   (workspace_id, provider, model, credentials_json, healthy, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)
                 ON CONFLICT(workspace_id) DO UPDATE SET
                    provider = excluded.provider,
                    model = excluded.model,
                    credentials_json = excluded.credentials_json,
                    healthy = 1,
                    updated_at = excluded.updated_at",
                params![
                    workspace_id,
                    provider.as_str(),
                    model,
                    credentials_json,
                    ts(Utc::now()),
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    pub fn get_llm_config(&self, workspace_id: &str) -> Result<Option<LlmConfigRow>> {
        self.with(|conn| {
            conn.query_row(
                "SELECT workspace_id, provider, model, credentials_json, healthy, updated_at
                 FROM llm_configs WHERE workspace_id = ?1",
                params![workspace_id],
                llm_config_from_row,
            )
            .optional()
            .map_err(storage)?
            .transpose()
        })
    }

    pub fn set_llm_config_health(&self, workspace_id: &str, healthy: bool) -> Result<bool> {
        self.with(|conn| {
            let n = conn
                .execute(
                    "UPDATE llm_configs SET healthy = ?1, updated_at = ?2 WHERE workspace_id = ?3",
                    params![healthy as i64, ts(Utc::now()), workspace_id],
                )
                .map_err(storage)?;
            Ok(n > 0)
        })
    }
}

const INTEGRATION_SELECT: &str = "SELECT id, workspace_id, provider, capabilities,
        credentials_json, healthy, created_at, updated_at FROM integrations";

fn integration_from_row(row: &Row<'_>) -> rusqlite::Result<Result<IntegrationRow>> {
    Ok(build_integration(row))
}

fn build_integration(row: &Row<'_>) -> Result<IntegrationRow> {
    let id: String = row.get(0).map_err(storage)?;
    let caps: String = row.get(3).map_err(storage)?;
    let healthy: i64 = row.get(5).map_err(storage)?;
    let created: String = row.get(6).map_err(storage)?;
    let updated: String = row.get(7).map_err(storage)?;
    Ok(IntegrationRow {
        id: parse_uuid(&id)?,
        workspace_id: row.get(1).map_err(storage)?,
        provider: row.get(2).map_err(storage)?,
        capabilities: serde_json::from_str(&caps)?,
        credentials_json: row.get(4).map_err(storage)?,
        healthy: healthy != 0,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

fn llm_config_from_row(row: &Row<'_>) -> rusqlite::Result<Result<LlmConfigRow>> {
    Ok(build_llm_config(row))
}

fn build_llm_config(row: &Row<'_>) -> Result<LlmConfigRow> {
    let provider: String = row.get(1).map_err(storage)?;
    let healthy: i64 = row.get(4).map_err(storage)?;
    let updated: String = row.get(5).map_err(storage)?;
    Ok(LlmConfigRow {
        workspace_id: row.get(0).map_err(storage)?,
        provider: LlmProviderKind::parse(&provider)
            .ok_or_else(|| Error::Storage(format!("bad llm provider '{provider}'")))?,
        model: row.get(2).map_err(storage)?,
        credentials_json: row.get(3).map_err(storage)?,
        healthy: healthy != 0,
        updated_at: parse_ts(&updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_credentials_and_restores_health() {
        let store = Store::open_in_memory().unwrap();
        let caps = vec!["logs.search".to_string(), "logs.errors".to_string()];

        store
            .upsert_integration("ws", "loki", &caps, r#"{"base_url":"http://loki"}"#)
            .unwrap();
        store.set_integration_health("ws", "loki", false).unwrap();

        let row = store
            .upsert_integration("ws", "loki", &caps, r#"{"base_url":"http://loki2"}"#)
            .unwrap();
        assert!(row.healthy);
        assert!(row.credentials_json.contains("loki2"));
        assert_eq!(store.list_integrations("ws").unwrap().len(), 1);
    }

    #[test]
    fn llm_config_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_llm_config("ws", LlmProviderKind::Gemini, "gemini-2.0-flash",
                Some(r#"{"api_key":"k"}"#))
            .unwrap();

        let row = store.get_llm_config("ws").unwrap().unwrap();
        assert_eq!(row.provider, LlmProviderKind::Gemini);
        assert_eq!(row.model, "gemini-2.0-flash");

        assert!(store.get_llm_config("other").unwrap().is_none());
    }

    #[test]
    fn health_flag_flips() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_llm_config("ws", LlmProviderKind::OpenAi, "gpt-4o", None)
            .unwrap();
        store.set_llm_config_health("ws", false).unwrap();
        assert!(!store.get_llm_config("ws").unwrap().unwrap().healthy);
    }
}
