use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use holocron_provider::{LlmProvider, LlmRequest, LlmResponse};
use holocron_schema::{RetryPolicy, RETRYABLE_MARKER};

use crate::config::ModelConfig;

/// Sends requests to the primary model, retrying transient failures, then
/// walks the fallback list.
pub struct LlmRouter {
    provider: Arc<dyn LlmProvider>,
    primary: String,
    fallbacks: Vec<String>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl LlmRouter {
    pub fn new(provider: Arc<dyn LlmProvider>, primary: impl Into<String>) -> Self {
        Self {
            provider,
            primary: primary.into(),
            fallbacks: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(
        provider: Arc<dyn LlmProvider>,
        model: &ModelConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self::new(provider, model.primary.clone())
            .with_fallbacks(model.fallbacks.clone())
            .with_retry(retry)
            .with_timeout(Duration::from_secs(model.timeout_secs.max(1)))
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// `request.model` is ignored; the router picks the model.
    pub async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.chat_with(&self.primary, &self.fallbacks, request).await
    }

    /// Same as [`chat`](Self::chat) with an explicit model chain.
    pub async fn chat_with(
        &self,
        primary: &str,
        fallbacks: &[String],
        request: LlmRequest,
    ) -> Result<LlmResponse> {
        let mut candidates = vec![primary.to_string()];
        candidates.extend(fallbacks.iter().filter(|f| f.as_str() != primary).cloned());

        let mut last_err: Option<anyhow::Error> = None;

        for candidate in candidates {
            let attempt = self
                .retry
                .run(&format!("model {candidate}"), || {
                    let mut req = request.clone();
                    req.model = candidate.clone();
                    self.attempt(req)
                })
                .await;

            match attempt {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    tracing::warn!("model {candidate} failed: {err:#}");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no model candidate available")))
    }

    async fn attempt(&self, request: LlmRequest) -> Result<LlmResponse> {
        let model = request.model.clone();
        match tokio::time::timeout(self.timeout, self.provider.chat(request)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "model {model} timed out after {}s {RETRYABLE_MARKER}",
                self.timeout.as_secs()
            )),
        }
    }
}
