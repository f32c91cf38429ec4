pub mod gemini;
pub mod types;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use gemini::GeminiProvider;
pub use types::*;

/// Opaque language-model capability: a prompt plus callable tool signatures
/// in, either free text or structured tool calls out.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse>;
}

// ============================================================
// Provider Configuration
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Gemini,
    /// Offline echo provider, useful for smoke-testing the pipeline.
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(provider_type: ProviderType) -> Self {
        Self {
            provider_type,
            api_key: None,
            base_url: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider_type {
        ProviderType::Gemini => {
            let key = config
                .api_key
                .as_ref()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| anyhow!("gemini requires api_key"))?;
            let mut provider = GeminiProvider::new(key.clone());
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(provider)
        }
        ProviderType::Stub => Arc::new(StubProvider),
    };
    Ok(provider)
}

pub struct StubProvider;

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.text())
            .unwrap_or_default();
        Ok(LlmResponse::from_text(format!(
            "[stub:{}] {}",
            request.model, user_text
        )))
    }
}

/// Replays canned responses in order and records every request it receives.
///
/// Once the script runs out, the last response is repeated if `repeat_last`
/// is set, otherwise the call fails.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<LlmResponse, String>>>,
    last: Mutex<Option<LlmResponse>>,
    repeat_last: bool,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            last: Mutex::new(None),
            repeat_last: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with the same response.
    pub fn repeating(response: LlmResponse) -> Self {
        let mut provider = Self::new(vec![response]);
        provider.repeat_last = true;
        provider
    }

    /// Inserts a failure at the end of the current script.
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(message.into()));
        }
        self
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("scripted provider lock poisoned"))?
            .push(request);

        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("scripted provider lock poisoned"))?
            .pop_front();

        match next {
            Some(Ok(resp)) => {
                if let Ok(mut last) = self.last.lock() {
                    *last = Some(resp.clone());
                }
                Ok(resp)
            }
            Some(Err(message)) => Err(anyhow!(message)),
            None if self.repeat_last => self
                .last
                .lock()
                .map_err(|_| anyhow!("scripted provider lock poisoned"))?
                .clone()
                .ok_or_else(|| anyhow!("scripted provider has no response to repeat")),
            None => Err(anyhow!("scripted provider exhausted")),
        }
    }
}
