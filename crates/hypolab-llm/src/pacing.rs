//! Request pacing.
//!
//! Concurrent hypotheses share one provider, so spacing is enforced at the
//! provider: a request waits until `min_interval` has passed since the
//! previous one started.

use crate::{CompletionRequest, CompletionResponse, LLMError, LLMProvider, ModelInfo};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct PacedProvider {
    inner: Arc<dyn LLMProvider>,
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl PacedProvider {
    pub fn new(inner: Arc<dyn LLMProvider>, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            last_start: Mutex::new(None),
        }
    }

    /// Hold the slot lock while sleeping so waiters start one interval apart.
    async fn wait_turn(&self) {
        let mut last_start = self.last_start.lock().await;
        if let Some(previous) = *last_start {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                tracing::trace!(wait_ms = wait.as_millis() as u64, "pacing llm request");
                tokio::time::sleep(wait).await;
            }
        }
        *last_start = Some(Instant::now());
    }
}

#[async_trait]
impl LLMProvider for PacedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if !self.min_interval.is_zero() {
            self.wait_turn().await;
        }
        self.inner.complete(request).await
    }

    fn model_info(&self) -> ModelInfo {
        self.inner.model_info()
    }
}
