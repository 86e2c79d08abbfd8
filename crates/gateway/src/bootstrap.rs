//! Process wiring: build the application state once, spawn the worker
//! pool and reconciler, and serve the API.

use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, CorsLayer};

use fl_domain::config::Config;
use fl_domain::Result;
use fl_integrations::{Capability, IntegrationRecord, IntegrationRegistry, IntegrationSource};
use fl_providers::{LlmGateway, ModelResolver};
use fl_store::Store;

use crate::api;
use crate::api::auth::StaticTokenVerifier;
use crate::runtime::bus::EventBus;
use crate::runtime::guard::PromptGuard;
use crate::runtime::queue::InProcessQueue;
use crate::runtime::quota::QuotaGate;
use crate::runtime::session_lock::SessionLockMap;
use crate::runtime::worker::{run_reconciler, run_worker_loop, WorkerRegistry};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store-backed integration source
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StoreIntegrationSource(Arc<Store>);

impl IntegrationSource for StoreIntegrationSource {
    fn integrations(&self, workspace_id: &str) -> Result<Vec<IntegrationRecord>> {
        let rows = self.0.list_integrations(workspace_id)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let capabilities = row
                    .capabilities
                    .iter()
                    .filter_map(|name| {
                        let cap = Capability::parse(name);
                        if cap.is_none() {
                            tracing::warn!(
                                provider = %row.provider,
                                capability = %name,
                                "unknown capability on integration; skipping"
                            );
                        }
                        cap
                    })
                    .collect();
                IntegrationRecord {
                    provider: row.provider,
                    capabilities,
                    credentials_json: row.credentials_json,
                    healthy: row.healthy,
                }
            })
            .collect())
    }

    fn mark_unhealthy(&self, workspace_id: &str, provider: &str) -> Result<()> {
        self.0
            .set_integration_health(workspace_id, provider, false)
            .map(|_| ())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn build_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let store = Arc::new(Store::open(&config.database.path).context("opening database")?);
    tracing::info!(path = %config.database.path.display(), "store ready");

    let gateway: Arc<LlmGateway> = Arc::new(LlmGateway::new(config.llm.clone()));
    let models: Arc<dyn ModelResolver> = gateway.clone();

    // The guard classifier reuses the platform model when enabled; a
    // missing platform key degrades the guard instead of failing boot.
    let classifier = if config.guard.use_model {
        match models.resolve(None) {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::warn!(error = %e, "guard classifier unavailable; rules only");
                None
            }
        }
    } else {
        None
    };
    let guard = Arc::new(PromptGuard::new(&config.guard, classifier).context("building guard")?);

    let integrations = Arc::new(IntegrationRegistry::new(Arc::new(StoreIntegrationSource(
        store.clone(),
    ))));
    let quota = Arc::new(QuotaGate::new(store.clone(), config.plans.clone()));
    let verifier = Arc::new(StaticTokenVerifier::from_config(&config.auth));

    Ok(AppState {
        config,
        store,
        queue: Arc::new(InProcessQueue::new()),
        bus: Arc::new(EventBus::new()),
        integrations,
        models,
        guard,
        quota,
        session_locks: Arc::new(SessionLockMap::new()),
        verifier,
        workers: Arc::new(WorkerRegistry::new()),
    })
}

/// Spawn the worker pool and the stale-job reconciler.
pub fn spawn_workers(state: &AppState) {
    for worker_id in 0..state.config.worker.count {
        tokio::spawn(run_worker_loop(state.clone(), worker_id));
    }
    tokio::spawn(run_reconciler(state.clone()));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_CONCURRENT_REQUESTS: usize = 256;

pub async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let state = build_state(config.clone())?;
    spawn_workers(&state);

    // ── CORS ─────────────────────────────────────────────────────────
    let cors = if config.server.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config
            .server
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    // ── Rate-limit layer (per-IP token bucket) ───────────────────────
    let governor_config = tower_governor::governor::GovernorConfigBuilder::default()
        .per_second(config.server.rate_limit_per_sec as u64)
        .burst_size(config.server.rate_limit_burst)
        .finish()
        .context("rate limit config")?;
    let governor = tower_governor::GovernorLayer {
        config: Arc::new(governor_config),
    };

    let app = api::router(state.clone())
        .layer(cors)
        .layer(tower::limit::ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(governor)
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(%addr, workers = config.worker.count, "faultline listening");

    axum::serve(listener, app).await.context("server error")
}
