use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use holocron_memory::AbilitySummarizer;
use holocron_provider::{LlmProvider, LlmRequest};

const SUMMARY_INSTRUCTIONS: &str = "You compress Star Wars: Galaxy of Heroes ability \
descriptions for a search index. Reply with 1 to 3 plain sentences and nothing else. Keep \
the effects, status names, targets and conditions; drop flavour text and exact numbers \
unless they define the ability.";

/// Summarizes ability text with a single model call. Retries are left to
/// the index builder.
pub struct LlmAbilitySummarizer {
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_tokens: u32,
}

impl LlmAbilitySummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: 256,
        }
    }
}

#[async_trait]
impl AbilitySummarizer for LlmAbilitySummarizer {
    async fn summarize(&self, ability_name: &str, description: &str) -> Result<String> {
        let mut request = LlmRequest::simple(
            self.model.clone(),
            Some(SUMMARY_INSTRUCTIONS.to_string()),
            format!("Ability: {ability_name}\nDescription: {description}"),
        );
        request.max_tokens = self.max_tokens;
        request.temperature = Some(0.0);
        let resp = self.provider.chat(request).await?;
        Ok(resp.text.trim().to_string())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holocron_provider::{LlmResponse, ScriptedProvider};

    #[tokio::test]
    async fn summary_request_carries_ability_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![LlmResponse::from_text(
            "  Deals damage and Expose.  ",
        )]));
        let summarizer = LlmAbilitySummarizer::new(provider.clone(), "gemini-3-flash-preview");
        let summary = summarizer
            .summarize("Shatterpoint", "Deal Special damage to target enemy and Expose them.")
            .await
            .unwrap();
        assert_eq!(summary, "Deals damage and Expose.");
        assert_eq!(summarizer.model_id(), "gemini-3-flash-preview");

        let request = &provider.requests()[0];
        assert!(request.tools.is_empty());
        assert_eq!(request.temperature, Some(0.0));
        assert!(request.messages[0].text().contains("Shatterpoint"));
    }
}
