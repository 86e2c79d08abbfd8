//! Transparent retry for transient provider failures.

use std::sync::Arc;
use std::time::Duration;

use fl_domain::Result;

use crate::traits::{ChatModel, ChatRequest, ChatResponse};

/// Total attempts (first call + retries) per completion.
const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 500;

/// Wraps a [`ChatModel`] and retries 429/5xx/network failures with
/// exponential backoff. Protocol failures pass through immediately.
pub struct RetryingModel {
    inner: Arc<dyn ChatModel>,
}

impl RetryingModel {
    pub fn wrap(inner: Arc<dyn ChatModel>) -> Arc<dyn ChatModel> {
        Arc::new(Self { inner })
    }
}

#[async_trait::async_trait]
impl ChatModel for RetryingModel {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(BASE_DELAY_MS << attempt);
                    tracing::warn!(
                        model = self.inner.model_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient provider failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}
