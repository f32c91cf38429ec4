use std::collections::HashSet;

use anyhow::{anyhow, bail, Result};
use holocron_provider::{ContentBlock, LlmMessage, LlmResponse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    /// Provider token echoed back with the call on later turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls,
            tool_call_id: None,
            is_error: false,
        }
    }

    pub fn from_response(resp: &LlmResponse) -> Self {
        let calls = resp
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse {
                    id,
                    name,
                    input,
                    signature,
                } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                    signature: signature.clone(),
                }),
                _ => None,
            })
            .collect();
        Self::assistant(resp.text.clone(), calls)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::ToolResult,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            is_error,
        }
    }
}

/// Ordered, append-only history of one conversation.
///
/// Every tool result answers a tool call issued by an earlier assistant
/// message, and no call is answered twice. The system directive is never
/// stored here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl ConversationState {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(question)],
        }
    }

    /// Rebuild a state from stored messages, checking the call/result pairing.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self> {
        let mut state = Self::default();
        for message in messages {
            state.push(message)?;
        }
        Ok(state)
    }

    pub fn push(&mut self, message: Message) -> Result<()> {
        if message.role == Role::ToolResult {
            let id = message
                .tool_call_id
                .as_deref()
                .ok_or_else(|| anyhow!("tool result without a tool call id"))?;
            if !self.issued_call_ids().contains(id) {
                bail!("tool result {id} does not answer any earlier tool call");
            }
            if self.answered_call_ids().contains(id) {
                bail!("tool call {id} already has a result");
            }
        } else if message.tool_call_id.is_some() {
            bail!("only tool results may carry a tool call id");
        }
        if message.role != Role::Assistant && !message.tool_calls.is_empty() {
            bail!("only assistant messages may request tool calls");
        }
        if message.role == Role::Assistant {
            if let Some(open) = self.pending_tool_calls().first() {
                bail!("tool call {} has no result yet", open.id);
            }
            let issued = self.issued_call_ids();
            let mut seen = HashSet::new();
            for call in &message.tool_calls {
                if issued.contains(call.id.as_str()) || !seen.insert(call.id.as_str()) {
                    bail!("duplicate tool call id {}", call.id);
                }
            }
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Calls of the latest assistant message that have no result yet.
    pub fn pending_tool_calls(&self) -> Vec<ToolCall> {
        let Some(pos) = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)
        else {
            return Vec::new();
        };
        let answered = self.answered_call_ids();
        self.messages[pos]
            .tool_calls
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .cloned()
            .collect()
    }

    /// Text of the last assistant message, if it requested no tools.
    pub fn final_answer(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant && m.tool_calls.is_empty())
            .map(|m| m.content.as_str())
    }

    /// Wire form. Consecutive tool results share one user turn.
    pub fn to_llm_messages(&self) -> Vec<LlmMessage> {
        let mut out: Vec<LlmMessage> = Vec::new();
        let mut pending_results: Vec<ContentBlock> = Vec::new();

        for message in &self.messages {
            if message.role == Role::ToolResult {
                pending_results.push(ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: message.content.clone(),
                    is_error: message.is_error,
                });
                continue;
            }
            if !pending_results.is_empty() {
                out.push(LlmMessage {
                    role: "user".into(),
                    content: std::mem::take(&mut pending_results),
                });
            }
            match message.role {
                Role::User => out.push(LlmMessage::user(message.content.clone())),
                Role::Assistant => {
                    let mut content = Vec::new();
                    if !message.content.is_empty() {
                        content.push(ContentBlock::Text {
                            text: message.content.clone(),
                        });
                    }
                    content.extend(message.tool_calls.iter().map(|c| ContentBlock::ToolUse {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        input: c.arguments.clone(),
                        signature: c.signature.clone(),
                    }));
                    out.push(LlmMessage {
                        role: "assistant".into(),
                        content,
                    });
                }
                Role::ToolResult => {}
            }
        }
        if !pending_results.is_empty() {
            out.push(LlmMessage {
                role: "user".into(),
                content: pending_results,
            });
        }
        out
    }

    fn issued_call_ids(&self) -> HashSet<&str> {
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.as_str()))
            .collect()
    }

    fn answered_call_ids(&self) -> HashSet<&str> {
        self.messages
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: serde_json::json!({"query": "jedi"}),
            signature: None,
        }
    }

    fn with_two_calls() -> ConversationState {
        let mut state = ConversationState::new("Who leads Jedi?");
        state
            .push(Message::assistant(
                "",
                vec![call("c1", "find_relevant_units"), call("c2", "find_relevant_units")],
            ))
            .unwrap();
        state
    }

    #[test]
    fn tool_result_must_answer_an_issued_call() {
        let mut state = with_two_calls();
        let err = state
            .push(Message::tool_result("c9", "nope", false))
            .unwrap_err();
        assert!(err.to_string().contains("c9"));
        state.push(Message::tool_result("c1", "ok", false)).unwrap();
        assert!(state.push(Message::tool_result("c1", "again", false)).is_err());
    }

    #[test]
    fn pending_calls_shrink_as_results_arrive() {
        let mut state = with_two_calls();
        assert_eq!(state.pending_tool_calls().len(), 2);
        state.push(Message::tool_result("c2", "ok", false)).unwrap();
        let pending = state.pending_tool_calls();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "c1");
    }

    #[test]
    fn duplicate_call_ids_are_rejected() {
        let mut state = ConversationState::new("q");
        let err = state
            .push(Message::assistant("", vec![call("c1", "a"), call("c1", "b")]))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate tool call id"));
    }

    #[test]
    fn final_answer_requires_plain_assistant_turn() {
        let mut state = with_two_calls();
        assert_eq!(state.final_answer(), None);
        state.push(Message::tool_result("c1", "a", false)).unwrap();
        state.push(Message::tool_result("c2", "b", false)).unwrap();
        state
            .push(Message::assistant("Yoda leads Jedi.", vec![]))
            .unwrap();
        assert_eq!(state.final_answer(), Some("Yoda leads Jedi."));
    }

    #[test]
    fn wire_form_groups_consecutive_tool_results() {
        let mut state = with_two_calls();
        state.push(Message::tool_result("c1", "a", false)).unwrap();
        state.push(Message::tool_result("c2", "b", true)).unwrap();

        let wire = state.to_llm_messages();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].role, "user");
        assert_eq!(wire[1].role, "assistant");
        assert_eq!(wire[1].tool_uses().len(), 2);
        assert_eq!(wire[2].role, "user");
        assert_eq!(wire[2].content.len(), 2);
        assert!(matches!(
            &wire[2].content[1],
            ContentBlock::ToolResult { tool_use_id, is_error: true, .. } if tool_use_id == "c2"
        ));
    }

    #[test]
    fn serialized_state_round_trips_through_validation() {
        let mut state = with_two_calls();
        state.push(Message::tool_result("c1", "a", false)).unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let restored: ConversationState = serde_json::from_str(&json).unwrap();
        let revalidated = ConversationState::from_messages(restored.messages().to_vec()).unwrap();
        assert_eq!(revalidated, state);
        assert_eq!(revalidated.pending_tool_calls().len(), 1);
    }

    #[test]
    fn assistant_turn_waits_for_every_pending_result() {
        let mut state = with_two_calls();
        state.push(Message::tool_result("c1", "a", false)).unwrap();
        let err = state
            .push(Message::assistant("Yoda leads Jedi.", vec![]))
            .unwrap_err();
        assert!(err.to_string().contains("c2"));

        let restored = ConversationState::from_messages(vec![
            Message::user("q"),
            Message::assistant("", vec![call("c1", "find_relevant_units")]),
            Message::assistant("x", vec![]),
        ]);
        assert!(restored.is_err());
    }

    #[test]
    fn call_signature_reaches_the_wire_form() {
        let resp = LlmResponse {
            text: String::new(),
            content: vec![ContentBlock::ToolUse {
                id: "g1".into(),
                name: "find_relevant_units".into(),
                input: serde_json::json!({"query": "Mace"}),
                signature: Some("SIG123".into()),
            }],
            input_tokens: None,
            output_tokens: None,
            stop_reason: Some("tool_use".into()),
        };
        let mut state = ConversationState::new("Who pairs with Mace?");
        state.push(Message::from_response(&resp)).unwrap();
        assert_eq!(state.messages()[1].tool_calls[0].signature.as_deref(), Some("SIG123"));

        let wire = state.to_llm_messages();
        assert!(matches!(
            &wire[1].content[0],
            ContentBlock::ToolUse { signature: Some(s), .. } if s == "SIG123"
        ));
    }
}
