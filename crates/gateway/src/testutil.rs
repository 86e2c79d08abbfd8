//! Shared fixtures for gateway tests: a scripted model resolver and a
//! fully in-memory [`AppState`].

use std::sync::Arc;

use parking_lot::Mutex;

use fl_domain::config::Config;
use fl_domain::job::{Job, RequestedContext};
use fl_domain::session::{SessionOrigin, ThreadCoords};
use fl_domain::turn::NewStep;
use fl_domain::Result;
use fl_integrations::{IntegrationRecord, IntegrationRegistry, IntegrationSource};
use fl_providers::{ChatModel, ChatRequest, ChatResponse, ModelResolver, WorkspaceLlm};
use fl_store::{NewSession, Store};

use crate::api::auth::StaticTokenVerifier;
use crate::runtime::bus::EventBus;
use crate::runtime::guard::PromptGuard;
use crate::runtime::queue::InProcessQueue;
use crate::runtime::quota::QuotaGate;
use crate::runtime::session_lock::SessionLockMap;
use crate::runtime::worker::WorkerRegistry;
use crate::state::AppState;

/// The workspace all test fixtures live in (dev-mode auth resolves here).
pub const TEST_WORKSPACE: &str = "ws-test";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScriptedModel {
    responses: Mutex<Vec<Result<ChatResponse>>>,
}

#[async_trait::async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        self.responses
            .lock()
            .pop()
            .unwrap_or_else(|| Err(fl_domain::Error::LlmProtocol("script exhausted".into())))
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Resolver that hands every workspace the same scripted model.
pub struct ScriptedResolver {
    model: Arc<ScriptedModel>,
}

impl ScriptedResolver {
    pub fn new(mut responses: Vec<Result<ChatResponse>>) -> Arc<Self> {
        responses.reverse();
        Arc::new(Self {
            model: Arc::new(ScriptedModel {
                responses: Mutex::new(responses),
            }),
        })
    }
}

impl ModelResolver for ScriptedResolver {
    fn resolve(&self, _workspace_llm: Option<&WorkspaceLlm>) -> Result<Arc<dyn ChatModel>> {
        Ok(self.model.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Empty integration source
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct NoIntegrations;

impl IntegrationSource for NoIntegrations {
    fn integrations(&self, _workspace_id: &str) -> Result<Vec<IntegrationRecord>> {
        Ok(Vec::new())
    }
    fn mark_unhealthy(&self, _workspace_id: &str, _provider: &str) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State & seeding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fully in-memory AppState with a scripted model and no integrations.
pub fn test_state(models: Arc<dyn ModelResolver>) -> AppState {
    let mut config = Config::default();
    config.auth.dev_workspace = TEST_WORKSPACE.into();

    let config = Arc::new(config);
    let store = Arc::new(Store::open_in_memory().unwrap());
    let guard = Arc::new(PromptGuard::new(&config.guard, None).unwrap());
    let quota = Arc::new(QuotaGate::new(store.clone(), config.plans.clone()));
    let verifier = Arc::new(StaticTokenVerifier::from_config(&config.auth));

    AppState {
        config,
        store: store.clone(),
        queue: Arc::new(InProcessQueue::new()),
        bus: Arc::new(EventBus::new()),
        integrations: Arc::new(IntegrationRegistry::new(Arc::new(NoIntegrations))),
        models,
        guard,
        quota,
        session_locks: Arc::new(SessionLockMap::new()),
        verifier,
        workers: Arc::new(WorkerRegistry::new()),
    }
}

/// Replicate the admission write path: session + pending turn + step 1
/// ("Queued") + queued job + enqueued message.
pub async fn seed_admitted_job(state: &AppState, message: &str) -> Job {
    let session = state
        .store
        .create_session(NewSession {
            workspace_id: TEST_WORKSPACE.into(),
            origin: SessionOrigin::Web,
            user_id: Some("u-test".into()),
            thread: ThreadCoords::default(),
            title: fl_domain::session::default_title(message),
        })
        .unwrap();
    let turn = state.store.create_turn(session.id, message).unwrap();
    state
        .store
        .append_step(turn.id, NewStep::status("Queued"))
        .unwrap();
    let context = RequestedContext {
        query: message.to_owned(),
        user_id: Some("u-test".into()),
        hints: serde_json::Value::Null,
    };
    let job = state
        .store
        .create_job(
            TEST_WORKSPACE,
            turn.id,
            &context,
            state.config.retry.max_retries,
        )
        .unwrap();
    state.queue.send(job.id.to_string(), None).await.unwrap();
    job
}
