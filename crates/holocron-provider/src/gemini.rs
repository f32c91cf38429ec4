//! Gemini `generateContent` client.
//!
//! Gemini has no function-call ids: responses are matched to calls by
//! function name. Ids are minted on decode and resolved back to names on
//! encode, so callers can keep a strict id-based pairing.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;

use crate::{ContentBlock, LlmMessage, LlmProvider, LlmRequest, LlmResponse, ToolDef};

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            base_url: GEMINI_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/models/{model}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.api_key
        )
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let body = encode_request(&request);
        let sent = self
            .http
            .post(self.endpoint(&request.model))
            .json(&body)
            .send()
            .await;

        let resp = match sent {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!("gemini request to {} timed out [retryable]", request.model))
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("gemini connection failed [retryable]: {e}"))
            }
            Err(e) => return Err(anyhow!(e).context("gemini request failed")),
        };

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &detail));
        }

        let decoded: wire::GenerateResponse = resp
            .json()
            .await
            .context("gemini returned an unreadable body")?;
        decode_response(decoded)
    }
}

fn encode_request(request: &LlmRequest) -> wire::GenerateRequest {
    wire::GenerateRequest {
        contents: encode_history(&request.messages),
        system_instruction: request.system.as_ref().map(|system| wire::Content {
            role: "user".to_string(),
            parts: vec![wire::Part::Text {
                text: system.clone(),
            }],
        }),
        generation_config: Some(wire::GenerationConfig {
            max_output_tokens: Some(request.max_tokens),
            temperature: request.temperature,
        }),
        tools: encode_tools(&request.tools),
    }
}

fn encode_history(messages: &[LlmMessage]) -> Vec<wire::Content> {
    let names_by_id: HashMap<&str, &str> = messages
        .iter()
        .flat_map(|m| m.tool_uses())
        .map(|(id, name, _)| (id, name))
        .collect();

    messages
        .iter()
        .filter_map(|message| {
            let parts: Vec<wire::Part> = message
                .content
                .iter()
                .map(|block| encode_block(block, &names_by_id))
                .collect();
            if parts.is_empty() {
                return None;
            }
            let role = if message.role == "assistant" {
                "model"
            } else {
                "user"
            };
            Some(wire::Content {
                role: role.to_string(),
                parts,
            })
        })
        .collect()
}

fn encode_block(block: &ContentBlock, names_by_id: &HashMap<&str, &str>) -> wire::Part {
    match block {
        ContentBlock::Text { text } => wire::Part::Text { text: text.clone() },
        ContentBlock::ToolUse {
            name,
            input,
            signature,
            ..
        } => wire::Part::FunctionCall {
            function_call: wire::FunctionCall {
                name: name.clone(),
                args: input.clone(),
            },
            thought_signature: signature.clone(),
        },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let name = names_by_id
                .get(tool_use_id.as_str())
                .copied()
                .unwrap_or(tool_use_id.as_str());
            let key = if *is_error { "error" } else { "result" };
            wire::Part::FunctionResponse {
                function_response: wire::FunctionResponse {
                    name: name.to_string(),
                    response: serde_json::json!({ key: content }),
                },
            }
        }
    }
}

fn encode_tools(tools: &[ToolDef]) -> Option<Vec<wire::Tool>> {
    if tools.is_empty() {
        return None;
    }
    let function_declarations = tools
        .iter()
        .map(|tool| wire::FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        })
        .collect();
    Some(vec![wire::Tool {
        function_declarations,
    }])
}

fn decode_response(response: wire::GenerateResponse) -> Result<LlmResponse> {
    let usage = response.usage_metadata;
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("gemini returned no candidates"))?;

    let mut text = String::new();
    let mut content = Vec::with_capacity(candidate.content.parts.len());
    for part in candidate.content.parts {
        match part {
            wire::Part::Text { text: chunk } if chunk.is_empty() => {}
            wire::Part::Text { text: chunk } => {
                text.push_str(&chunk);
                content.push(ContentBlock::Text { text: chunk });
            }
            wire::Part::FunctionCall {
                function_call,
                thought_signature,
            } => content.push(ContentBlock::ToolUse {
                id: format!("gemini_{}", uuid::Uuid::new_v4().simple()),
                name: function_call.name,
                input: function_call.args,
                signature: thought_signature,
            }),
            wire::Part::FunctionResponse { .. } => {}
        }
    }

    let calls_tools = content
        .iter()
        .any(|block| matches!(block, ContentBlock::ToolUse { .. }));
    let stop_reason = if calls_tools {
        Some("tool_use".to_string())
    } else {
        candidate.finish_reason.as_deref().map(map_finish_reason)
    };

    Ok(LlmResponse {
        text,
        content,
        input_tokens: usage.as_ref().map(|u| u.prompt_token_count),
        output_tokens: usage.as_ref().map(|u| u.candidates_token_count),
        stop_reason,
    })
}

fn map_finish_reason(finish_reason: &str) -> String {
    match finish_reason {
        "STOP" => "end_turn".to_string(),
        "MAX_TOKENS" => "max_tokens".to_string(),
        other => other.to_lowercase(),
    }
}

/// 429 and 5xx are transient; everything else is the caller's fault.
fn status_error(status: StatusCode, detail: &str) -> anyhow::Error {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        anyhow!("gemini returned {status} [retryable]: {detail}")
    } else {
        anyhow!("gemini returned {status}: {detail}")
    }
}

mod wire {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GenerateRequest {
        pub contents: Vec<Content>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub system_instruction: Option<Content>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub generation_config: Option<GenerationConfig>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub tools: Option<Vec<Tool>>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub(super) struct Content {
        #[serde(default)]
        pub role: String,
        #[serde(default)]
        pub parts: Vec<Part>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(untagged)]
    pub(super) enum Part {
        Text {
            text: String,
        },
        /// Gemini 3 attaches `thoughtSignature` to function calls and
        /// rejects a history that does not return it.
        FunctionCall {
            #[serde(rename = "functionCall")]
            function_call: FunctionCall,
            #[serde(
                rename = "thoughtSignature",
                default,
                skip_serializing_if = "Option::is_none"
            )]
            thought_signature: Option<String>,
        },
        FunctionResponse {
            #[serde(rename = "functionResponse")]
            function_response: FunctionResponse,
        },
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub(super) struct FunctionCall {
        pub name: String,
        #[serde(default)]
        pub args: serde_json::Value,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub(super) struct FunctionResponse {
        pub name: String,
        pub response: serde_json::Value,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GenerationConfig {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_output_tokens: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub temperature: Option<f32>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Tool {
        pub function_declarations: Vec<FunctionDeclaration>,
    }

    #[derive(Debug, Serialize)]
    pub(super) struct FunctionDeclaration {
        pub name: String,
        pub description: String,
        pub parameters: serde_json::Value,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GenerateResponse {
        #[serde(default)]
        pub candidates: Vec<Candidate>,
        #[serde(default)]
        pub usage_metadata: Option<UsageMetadata>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Candidate {
        pub content: Content,
        #[serde(default)]
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct UsageMetadata {
        #[serde(default)]
        pub prompt_token_count: u32,
        #[serde(default)]
        pub candidates_token_count: u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(raw: serde_json::Value) -> LlmResponse {
        decode_response(serde_json::from_value(raw).unwrap()).unwrap()
    }

    #[test]
    fn directive_goes_to_system_instruction() {
        let req = LlmRequest::simple(
            "gemini-3-flash-preview".into(),
            Some("You are a tactical droid.".into()),
            "Who leads the Republic?".into(),
        );
        let body = serde_json::to_value(encode_request(&req)).unwrap();

        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "You are a tactical droid."
        );
        assert_eq!(body["contents"].as_array().unwrap().len(), 1);
        assert_eq!(body["contents"][0]["role"], "user");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn tools_become_function_declarations() {
        let req = LlmRequest {
            model: "gemini-3-flash-preview".into(),
            system: None,
            messages: vec![LlmMessage::user("Who counters Darth Vader?")],
            max_tokens: 1000,
            temperature: Some(0.0),
            tools: vec![ToolDef {
                name: "find_relevant_units".into(),
                description: "Search units".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } }
                }),
            }],
        };
        let body = serde_json::to_value(encode_request(&req)).unwrap();

        let declarations = body["tools"][0]["functionDeclarations"].as_array().unwrap();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0]["name"], "find_relevant_units");
        assert_eq!(body["generationConfig"]["temperature"], 0.0);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1000);
    }

    #[test]
    fn tool_results_are_sent_under_the_function_name() {
        let messages = vec![
            LlmMessage::user("Tell me about Mace"),
            LlmMessage {
                role: "assistant".into(),
                content: vec![ContentBlock::ToolUse {
                    id: "gemini_abc".into(),
                    name: "get_character_data".into(),
                    input: json!({"character_url": "mace"}),
                    signature: None,
                }],
            },
            LlmMessage {
                role: "user".into(),
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: "gemini_abc".into(),
                    content: "Tool execution error: timed out".into(),
                    is_error: true,
                }],
            },
        ];
        let contents = serde_json::to_value(encode_history(&messages)).unwrap();

        assert_eq!(contents[1]["role"], "model");
        assert_eq!(
            contents[1]["parts"][0]["functionCall"]["args"]["character_url"],
            "mace"
        );
        let response = &contents[2]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "get_character_data");
        assert_eq!(response["response"]["error"], "Tool execution error: timed out");
    }

    #[test]
    fn text_answer_reports_usage_and_end_turn() {
        let resp = decode(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Roger roger."}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2}
        }));

        assert_eq!(resp.text, "Roger roger.");
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(resp.input_tokens, Some(5));
        assert_eq!(resp.output_tokens, Some(2));
    }

    #[test]
    fn repeated_function_calls_get_distinct_ids() {
        let resp = decode(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "get_character_data", "args": {"character_url": "a"}}},
                    {"functionCall": {"name": "get_character_data", "args": {"character_url": "b"}}}
                ]},
                "finishReason": "STOP"
            }]
        }));

        let uses = resp.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_ne!(uses[0].0, uses[1].0);
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn thought_signature_is_returned_with_its_function_call() {
        let resp = decode(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {
                        "functionCall": {"name": "find_relevant_units", "args": {"query": "Mace"}},
                        "thoughtSignature": "SIG123"
                    },
                    {"functionCall": {"name": "find_relevant_units", "args": {"query": "Yoda"}}}
                ]},
                "finishReason": "STOP"
            }]
        }));
        assert!(matches!(
            &resp.content[0],
            ContentBlock::ToolUse { signature: Some(s), .. } if s == "SIG123"
        ));

        let history = vec![
            LlmMessage::user("Who pairs with Mace?"),
            LlmMessage {
                role: "assistant".into(),
                content: resp.content.clone(),
            },
        ];
        let contents = serde_json::to_value(encode_history(&history)).unwrap();
        let parts = &contents[1]["parts"];
        assert_eq!(parts[0]["thoughtSignature"], "SIG123");
        assert_eq!(parts[0]["functionCall"]["args"]["query"], "Mace");
        assert!(parts[1].get("thoughtSignature").is_none());
    }

    #[test]
    fn empty_candidate_list_is_an_error() {
        let err = decode_response(serde_json::from_value(json!({"candidates": []})).unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("no candidates"));
    }

    #[test]
    fn only_throttling_and_server_errors_are_retryable() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "slow down")
            .to_string()
            .contains("[retryable]"));
        assert!(status_error(StatusCode::BAD_GATEWAY, "")
            .to_string()
            .contains("[retryable]"));
        assert!(!status_error(StatusCode::BAD_REQUEST, "bad")
            .to_string()
            .contains("[retryable]"));
    }
}
