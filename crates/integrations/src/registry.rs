//! Per-workspace integration resolution.
//!
//! The registry sits between the tool layer and the credential store.
//! It caches the (small) integration list per workspace for up to 60 s,
//! filters out unhealthy entries, and constructs adapter handles on
//! demand. Decrypted credentials live inside the handle and are dropped
//! with it at the end of the tool call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use fl_domain::{Error, Result};

use crate::adapter::{AdapterHandle, Credentials};
use crate::capability::{Capability, CapabilityGroup};
use crate::datadog::DatadogAdapter;
use crate::github::GithubAdapter;
use crate::loki::LokiAdapter;
use crate::prometheus::PrometheusAdapter;

pub const CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Source seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One integration row as the registry sees it.
#[derive(Debug, Clone)]
pub struct IntegrationRecord {
    pub provider: String,
    pub capabilities: Vec<Capability>,
    pub credentials_json: String,
    pub healthy: bool,
}

/// Where integration rows come from (the store, in production).
pub trait IntegrationSource: Send + Sync {
    fn integrations(&self, workspace_id: &str) -> Result<Vec<IntegrationRecord>>;
    /// Called when an adapter reports an auth failure.
    fn mark_unhealthy(&self, workspace_id: &str, provider: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CachedWorkspace {
    records: Vec<IntegrationRecord>,
    fetched_at: Instant,
}

pub struct IntegrationRegistry {
    source: Arc<dyn IntegrationSource>,
    cache: RwLock<HashMap<String, CachedWorkspace>>,
    ttl: Duration,
}

impl IntegrationRegistry {
    pub fn new(source: Arc<dyn IntegrationSource>) -> Self {
        Self::with_ttl(source, CREDENTIAL_CACHE_TTL)
    }

    pub fn with_ttl(source: Arc<dyn IntegrationSource>, ttl: Duration) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Healthy (provider, capability) pairs for a workspace.
    pub fn list_capabilities(&self, workspace_id: &str) -> Result<Vec<(String, Capability)>> {
        let records = self.records(workspace_id)?;
        let mut out = Vec::new();
        for record in records.iter().filter(|r| r.healthy) {
            for cap in &record.capabilities {
                out.push((record.provider.clone(), *cap));
            }
        }
        Ok(out)
    }

    /// Open an adapter handle for one tool invocation.
    ///
    /// The capability's group must match the adapter family the provider
    /// implements; a mismatch is a configuration error, not an agent
    /// error.
    pub fn open(
        &self,
        workspace_id: &str,
        provider: &str,
        capability: Capability,
    ) -> Result<AdapterHandle> {
        let records = self.records(workspace_id)?;
        let record = records
            .iter()
            .find(|r| r.provider == provider && r.healthy)
            .ok_or(Error::NotFound("integration"))?;
        if !record.capabilities.contains(&capability) {
            return Err(Error::Config(format!(
                "integration '{provider}' does not serve {}",
                capability.as_str()
            )));
        }

        let creds = Credentials::from_json(&record.credentials_json)?;
        build_adapter(provider, capability.group(), &creds)
    }

    /// Record an auth failure: flip the row unhealthy and drop the cache
    /// so the next turn sees the change immediately.
    pub fn mark_unhealthy(&self, workspace_id: &str, provider: &str) {
        if let Err(e) = self.source.mark_unhealthy(workspace_id, provider) {
            tracing::warn!(workspace_id, provider, error = %e, "failed to mark integration unhealthy");
        }
        self.invalidate(workspace_id);
    }

    /// Drop the cached rows for a workspace (called on integration
    /// updates).
    pub fn invalidate(&self, workspace_id: &str) {
        self.cache.write().remove(workspace_id);
    }

    fn records(&self, workspace_id: &str) -> Result<Vec<IntegrationRecord>> {
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(workspace_id) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.records.clone());
                }
            }
        }

        let records = self.source.integrations(workspace_id)?;
        self.cache.write().insert(
            workspace_id.to_owned(),
            CachedWorkspace {
                records: records.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(records)
    }
}

fn build_adapter(
    provider: &str,
    group: CapabilityGroup,
    creds: &Credentials,
) -> Result<AdapterHandle> {
    match (provider, group) {
        ("loki", CapabilityGroup::Logs) => {
            Ok(AdapterHandle::Logs(Arc::new(LokiAdapter::new(creds)?)))
        }
        ("prometheus", CapabilityGroup::Metrics) => Ok(AdapterHandle::Metrics(Arc::new(
            PrometheusAdapter::new(creds)?,
        ))),
        // Datadog serves two capability groups off one credential set.
        ("datadog", CapabilityGroup::Logs) => {
            Ok(AdapterHandle::Logs(Arc::new(DatadogAdapter::new(creds)?)))
        }
        ("datadog", CapabilityGroup::Metrics) => Ok(AdapterHandle::Metrics(Arc::new(
            DatadogAdapter::new(creds)?,
        ))),
        ("github", CapabilityGroup::Code) => {
            Ok(AdapterHandle::Code(Arc::new(GithubAdapter::new(creds)?)))
        }
        _ => Err(Error::Config(format!(
            "no adapter for provider '{provider}' in this capability group"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeSource {
        rows: Mutex<Vec<IntegrationRecord>>,
        fetches: Mutex<u32>,
    }

    impl FakeSource {
        fn new(rows: Vec<IntegrationRecord>) -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(rows),
                fetches: Mutex::new(0),
            })
        }
    }

    impl IntegrationSource for FakeSource {
        fn integrations(&self, _workspace_id: &str) -> Result<Vec<IntegrationRecord>> {
            *self.fetches.lock() += 1;
            Ok(self.rows.lock().clone())
        }

        fn mark_unhealthy(&self, _workspace_id: &str, provider: &str) -> Result<()> {
            for row in self.rows.lock().iter_mut() {
                if row.provider == provider {
                    row.healthy = false;
                }
            }
            Ok(())
        }
    }

    fn loki_record(healthy: bool) -> IntegrationRecord {
        IntegrationRecord {
            provider: "loki".into(),
            capabilities: vec![Capability::LogsSearch, Capability::LogsErrors],
            credentials_json: r#"{"base_url":"http://loki:3100"}"#.into(),
            healthy,
        }
    }

    #[test]
    fn lists_only_healthy_capabilities() {
        let source = FakeSource::new(vec![
            loki_record(true),
            IntegrationRecord {
                provider: "prometheus".into(),
                capabilities: vec![Capability::MetricsQuery],
                credentials_json: r#"{"base_url":"http://prom:9090"}"#.into(),
                healthy: false,
            },
        ]);
        let registry = IntegrationRegistry::new(source);

        let caps = registry.list_capabilities("ws").unwrap();
        assert_eq!(caps.len(), 2);
        assert!(caps.iter().all(|(p, _)| p == "loki"));
    }

    #[test]
    fn open_checks_capability_membership() {
        let registry = IntegrationRegistry::new(FakeSource::new(vec![loki_record(true)]));

        assert!(registry.open("ws", "loki", Capability::LogsSearch).is_ok());
        let err = match registry.open("ws", "loki", Capability::MetricsQuery) {
            Err(e) => e,
            Ok(_) => panic!("expected open to fail"),
        };
        assert_eq!(err.kind(), "internal"); // config error, not agent-visible
    }

    #[test]
    fn open_unknown_provider_is_not_found() {
        let registry = IntegrationRegistry::new(FakeSource::new(vec![]));
        let err = match registry.open("ws", "loki", Capability::LogsSearch) {
            Err(e) => e,
            Ok(_) => panic!("expected open to fail"),
        };
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn cache_serves_within_ttl_and_invalidate_refreshes() {
        let source = FakeSource::new(vec![loki_record(true)]);
        let registry = IntegrationRegistry::with_ttl(source.clone(), Duration::from_secs(300));

        registry.list_capabilities("ws").unwrap();
        registry.list_capabilities("ws").unwrap();
        assert_eq!(*source.fetches.lock(), 1);

        registry.invalidate("ws");
        registry.list_capabilities("ws").unwrap();
        assert_eq!(*source.fetches.lock(), 2);
    }

    #[test]
    fn mark_unhealthy_takes_effect_immediately() {
        let source = FakeSource::new(vec![loki_record(true)]);
        let registry = IntegrationRegistry::with_ttl(source, Duration::from_secs(300));

        registry.list_capabilities("ws").unwrap();
        registry.mark_unhealthy("ws", "loki");
        assert!(registry.list_capabilities("ws").unwrap().is_empty());
    }
}
