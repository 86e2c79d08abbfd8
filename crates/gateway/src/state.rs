use std::sync::Arc;

use fl_domain::config::Config;
use fl_integrations::IntegrationRegistry;
use fl_providers::ModelResolver;
use fl_store::Store;

use crate::api::auth::IdentityVerifier;
use crate::runtime::bus::EventBus;
use crate::runtime::guard::PromptGuard;
use crate::runtime::queue::QueueTransport;
use crate::runtime::quota::QuotaGate;
use crate::runtime::session_lock::SessionLockMap;
use crate::runtime::worker::WorkerRegistry;

/// Shared application state passed to all API handlers and workers.
///
/// Built once in [`crate::bootstrap`]; everything here is either
/// immutable config or an interior-mutability service, so cloning is
/// cheap and handlers never need globals.
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub store: Arc<Store>,

    // ── Transport & fan-out ───────────────────────────────────────────
    pub queue: Arc<dyn QueueTransport>,
    pub bus: Arc<EventBus>,

    // ── Providers ─────────────────────────────────────────────────────
    pub integrations: Arc<IntegrationRegistry>,
    pub models: Arc<dyn ModelResolver>,

    // ── Admission ─────────────────────────────────────────────────────
    pub guard: Arc<PromptGuard>,
    pub quota: Arc<QuotaGate>,
    pub session_locks: Arc<SessionLockMap>,
    pub verifier: Arc<dyn IdentityVerifier>,

    // ── Workers ───────────────────────────────────────────────────────
    pub workers: Arc<WorkerRegistry>,
}
