//! The question-answering state machine.
//!
//! ```text
//! AWAIT_MODEL --tool calls--> DISPATCH_TOOLS --results--> AWAIT_MODEL
//! AWAIT_MODEL --text only---> DONE
//! ```
//!
//! Every model invocation counts as one cycle. The invocation in the last
//! permitted cycle carries no tool definitions, so a conversation always ends
//! after at most `max_cycles` model calls.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use holocron_provider::LlmRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AgentSettings, ModelConfig};
use crate::conversation::{ConversationState, Message, Role};
use crate::observer::{SessionEvent, SessionObserver};
use crate::prompt::system_directive;
use crate::router::LlmRouter;
use crate::tool::ToolRegistry;

/// Answer used when the cycle limit is hit and the model produced no text.
pub const CYCLE_LIMIT_ANSWER: &str =
    "I could not gather enough data to answer that in time. Try asking a narrower question.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    AwaitModel,
    DispatchTools,
    Done,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitModel => "AWAIT_MODEL",
            Self::DispatchTools => "DISPATCH_TOOLS",
            Self::Done => "DONE",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopOutcome {
    /// The model answered in text.
    Answered,
    /// The cycle budget ran out; any tool calls in the last turn were dropped.
    CycleLimitReached,
}

impl LoopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::CycleLimitReached => "cycle_limit_reached",
        }
    }
}

#[derive(Debug, Error)]
pub enum LoopError {
    /// The model could not be reached after retries and fallbacks.
    #[error("model invocation failed: {0:#}")]
    Model(anyhow::Error),

    #[error("conversation invariant violated: {0:#}")]
    Conversation(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub max_cycles: usize,
    pub tool_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_cycles: 10,
            tool_timeout: Duration::from_secs(30),
            max_tokens: 2048,
            temperature: 0.0,
        }
    }
}

impl LoopSettings {
    pub fn from_config(agent: &AgentSettings, model: &ModelConfig) -> Self {
        Self {
            max_cycles: agent.max_cycles.max(1),
            tool_timeout: Duration::from_secs(agent.tool_timeout_secs.max(1)),
            max_tokens: model.max_tokens,
            temperature: model.temperature,
        }
    }
}

/// One conversation in progress.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    state: LoopState,
    conversation: ConversationState,
    model_calls: usize,
    outcome: Option<LoopOutcome>,
    answer: Option<String>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    pub fn model_calls(&self) -> usize {
        self.model_calls
    }

    pub fn outcome(&self) -> Option<LoopOutcome> {
        self.outcome
    }

    fn finish(&mut self, outcome: LoopOutcome, answer: String) {
        self.outcome = Some(outcome);
        self.answer = Some(answer);
    }

    fn into_result(self) -> LoopResult {
        LoopResult {
            session_id: self.id,
            answer: self.answer.unwrap_or_default(),
            outcome: self.outcome.unwrap_or(LoopOutcome::Answered),
            model_calls: self.model_calls,
            conversation: self.conversation,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopResult {
    pub session_id: String,
    pub answer: String,
    pub outcome: LoopOutcome,
    pub model_calls: usize,
    pub conversation: ConversationState,
}

pub struct ReasoningLoop {
    router: Arc<LlmRouter>,
    tools: Arc<ToolRegistry>,
    settings: LoopSettings,
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl ReasoningLoop {
    pub fn new(router: Arc<LlmRouter>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            router,
            tools,
            settings: LoopSettings::default(),
            observers: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Answer `question` in a fresh conversation.
    pub async fn run(&self, question: &str) -> Result<LoopResult, LoopError> {
        let session = self.start(question);
        self.drive(session).await
    }

    /// Continue a checkpointed conversation.
    pub async fn resume(&self, conversation: ConversationState) -> Result<LoopResult, LoopError> {
        let session = self.restore(conversation)?;
        self.drive(session).await
    }

    pub fn start(&self, question: &str) -> Session {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            state: LoopState::AwaitModel,
            conversation: ConversationState::new(question),
            model_calls: 0,
            outcome: None,
            answer: None,
        };
        self.emit(&SessionEvent::SessionStarted {
            session_id: session.id.clone(),
            question: question.to_string(),
        });
        session
    }

    /// Rebuild a session from stored messages, re-checking their pairing.
    pub fn restore(&self, conversation: ConversationState) -> Result<Session, LoopError> {
        let conversation = ConversationState::from_messages(conversation.messages().to_vec())
            .map_err(LoopError::Conversation)?;
        let question = conversation
            .messages()
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .ok_or_else(|| {
                LoopError::Conversation(anyhow::anyhow!("checkpoint has no user question"))
            })?;
        let model_calls = conversation
            .messages()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();

        let mut session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            state: LoopState::AwaitModel,
            conversation,
            model_calls,
            outcome: None,
            answer: None,
        };
        if !session.conversation.pending_tool_calls().is_empty() {
            session.state = LoopState::DispatchTools;
        } else if let Some(answer) = session.conversation.final_answer() {
            let answer = answer.to_string();
            session.finish(LoopOutcome::Answered, answer);
            session.state = LoopState::Done;
        }

        self.emit(&SessionEvent::SessionStarted {
            session_id: session.id.clone(),
            question,
        });
        Ok(session)
    }

    /// Advance `session` by one state. Calling this on a finished session
    /// does nothing.
    pub async fn step(&self, session: &mut Session) -> Result<LoopState, LoopError> {
        match session.state {
            LoopState::AwaitModel => self.await_model(session).await?,
            LoopState::DispatchTools => self.dispatch_tools(session).await?,
            LoopState::Done => {}
        }
        Ok(session.state)
    }

    async fn drive(&self, mut session: Session) -> Result<LoopResult, LoopError> {
        while session.state != LoopState::Done {
            if let Err(e) = self.step(&mut session).await {
                tracing::error!(session_id = %session.id, "reasoning session failed: {e}");
                self.emit(&SessionEvent::SessionEnded {
                    session_id: session.id.clone(),
                    outcome: None,
                    model_calls: session.model_calls,
                });
                return Err(e);
            }
        }
        self.emit(&SessionEvent::SessionEnded {
            session_id: session.id.clone(),
            outcome: session.outcome,
            model_calls: session.model_calls,
        });
        Ok(session.into_result())
    }

    async fn await_model(&self, session: &mut Session) -> Result<(), LoopError> {
        session.model_calls += 1;
        let final_cycle = session.model_calls >= self.settings.max_cycles;
        let tools = if final_cycle {
            Vec::new()
        } else {
            self.tools.tool_defs()
        };

        let request = LlmRequest {
            model: self.router.primary().to_string(),
            system: Some(system_directive()),
            messages: session.conversation.to_llm_messages(),
            max_tokens: self.settings.max_tokens,
            temperature: Some(self.settings.temperature),
            tools,
        };
        let resp = self.router.chat(request).await.map_err(LoopError::Model)?;

        if !resp.text.trim().is_empty() {
            self.emit(&SessionEvent::Reasoning {
                text: resp.text.clone(),
            });
        }

        let mut message = Message::from_response(&resp);
        assign_unique_call_ids(&session.conversation, &mut message);
        if message.tool_calls.is_empty() {
            let answer = message.content.clone();
            self.append(session, message)?;
            session.finish(LoopOutcome::Answered, answer);
            self.transition(session, LoopState::Done);
        } else if final_cycle {
            tracing::warn!(
                session_id = %session.id,
                dropped = message.tool_calls.len(),
                "cycle limit reached, dropping tool calls"
            );
            message.tool_calls.clear();
            if message.content.trim().is_empty() {
                message.content = CYCLE_LIMIT_ANSWER.to_string();
            }
            let answer = message.content.clone();
            self.append(session, message)?;
            session.finish(LoopOutcome::CycleLimitReached, answer);
            self.transition(session, LoopState::Done);
        } else {
            self.append(session, message)?;
            self.transition(session, LoopState::DispatchTools);
        }
        Ok(())
    }

    async fn dispatch_tools(&self, session: &mut Session) -> Result<(), LoopError> {
        let calls = session.conversation.pending_tool_calls();
        for call in &calls {
            self.emit(&SessionEvent::ToolCall {
                call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }

        let timeout = self.settings.tool_timeout;
        let futures: Vec<_> = calls
            .iter()
            .map(|call| self.tools.dispatch(&call.name, call.arguments.clone(), timeout))
            .collect();
        let outputs = futures::future::join_all(futures).await;

        for (call, output) in calls.iter().zip(outputs) {
            self.emit(&SessionEvent::tool_result(
                &call.id,
                &call.name,
                &output.content,
                output.is_error,
            ));
            self.append(
                session,
                Message::tool_result(call.id.clone(), output.content, output.is_error),
            )?;
        }

        self.transition(session, LoopState::AwaitModel);
        Ok(())
    }

    fn append(&self, session: &mut Session, message: Message) -> Result<(), LoopError> {
        session
            .conversation
            .push(message)
            .context("model turn rejected")
            .map_err(LoopError::Conversation)
    }

    fn transition(&self, session: &mut Session, to: LoopState) {
        self.emit(&SessionEvent::Transition {
            from: session.state,
            to,
        });
        session.state = to;
    }

    fn emit(&self, event: &SessionEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

/// Give every call in `message` an id not used anywhere in `conversation`.
/// Ids from the provider are kept unless empty or already taken.
fn assign_unique_call_ids(conversation: &ConversationState, message: &mut Message) {
    let mut taken: HashSet<String> = conversation
        .messages()
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
        .collect();
    for call in &mut message.tool_calls {
        if call.id.is_empty() || taken.contains(&call.id) {
            let fresh = format!("call_{}", uuid::Uuid::new_v4().simple());
            tracing::debug!(old = %call.id, new = %fresh, "reassigned tool call id");
            call.id = fresh;
        }
        taken.insert(call.id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::Result;
    use async_trait::async_trait;
    use holocron_provider::{LlmResponse, ScriptedProvider, ToolDef};
    use holocron_schema::RetryPolicy;

    use crate::conversation::ToolCall;
    use crate::observer::RecordingObserver;
    use crate::tool::{ToolExecutor, ToolOutput};

    struct LookupTool;

    #[async_trait]
    impl ToolExecutor for LookupTool {
        fn definition(&self) -> ToolDef {
            ToolDef {
                name: "lookup".into(),
                description: "Look something up".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"key": {"type": "string"}},
                    "required": ["key"]
                }),
            }
        }

        async fn execute(&self, input: serde_json::Value) -> Result<ToolOutput> {
            Ok(ToolOutput::ok(format!("value of {}", input["key"])))
        }
    }

    fn lookup_call(id: &str) -> (String, String, serde_json::Value) {
        (id.into(), "lookup".into(), serde_json::json!({"key": id}))
    }

    fn build(provider: Arc<ScriptedProvider>, max_cycles: usize) -> ReasoningLoop {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(LookupTool)).unwrap();
        let router = LlmRouter::new(provider, "test-model").with_retry(RetryPolicy::none());
        ReasoningLoop::new(Arc::new(router), Arc::new(registry)).with_settings(LoopSettings {
            max_cycles,
            ..LoopSettings::default()
        })
    }

    #[tokio::test]
    async fn text_reply_finishes_in_one_cycle() {
        let provider = Arc::new(ScriptedProvider::new(vec![LlmResponse::from_text(
            "Roger roger.",
        )]));
        let result = build(provider.clone(), 10).run("hello").await.unwrap();
        assert_eq!(result.answer, "Roger roger.");
        assert_eq!(result.outcome, LoopOutcome::Answered);
        assert_eq!(result.model_calls, 1);

        let request = &provider.requests()[0];
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.temperature, Some(0.0));
        assert!(request.system.as_deref().unwrap().contains("tactical droid"));
    }

    #[tokio::test]
    async fn tool_results_follow_calls_in_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls("", vec![lookup_call("a"), lookup_call("b")]),
            LlmResponse::from_text("done"),
        ]));
        let result = build(provider.clone(), 10).run("q").await.unwrap();

        let messages = result.conversation.messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("a"));
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("b"));
        assert_eq!(messages[3].content, "value of \"b\"");

        let second = &provider.requests()[1];
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.messages[2].content.len(), 2);
    }

    #[tokio::test]
    async fn final_cycle_offers_no_tools_and_drops_calls() {
        let provider = Arc::new(ScriptedProvider::repeating(LlmResponse::with_tool_calls(
            "",
            vec![lookup_call("x")],
        )));
        let result = build(provider.clone(), 1).run("q").await.unwrap();
        assert_eq!(result.outcome, LoopOutcome::CycleLimitReached);
        assert_eq!(result.answer, CYCLE_LIMIT_ANSWER);
        assert_eq!(provider.call_count(), 1);
        assert!(provider.requests()[0].tools.is_empty());
        assert_eq!(result.conversation.final_answer(), Some(CYCLE_LIMIT_ANSWER));
    }

    #[tokio::test]
    async fn repeated_call_ids_are_reassigned() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls("", vec![lookup_call("same")]),
            LlmResponse::with_tool_calls("", vec![lookup_call("same"), lookup_call("same")]),
            LlmResponse::from_text("done"),
        ]));
        let result = build(provider, 10).run("q").await.unwrap();
        let ids: Vec<&str> = result
            .conversation
            .messages()
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.as_str()))
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "same");
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 3);
        assert!(result.conversation.pending_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn model_failure_surfaces_as_loop_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![]).then_fail("api error (400): bad key"));
        let recorder = Arc::new(RecordingObserver::new());
        let reasoning = build(provider, 10).with_observer(recorder.clone());
        let err = reasoning.run("q").await.unwrap_err();
        assert!(matches!(err, LoopError::Model(_)));
        assert!(err.to_string().contains("bad key"));
        assert!(matches!(
            recorder.events().last(),
            Some(SessionEvent::SessionEnded { outcome: None, .. })
        ));
    }

    #[tokio::test]
    async fn stepping_exposes_each_state() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls("Checking.", vec![lookup_call("a")]),
            LlmResponse::from_text("ok"),
        ]));
        let reasoning = build(provider, 10);
        let mut session = reasoning.start("q");
        assert_eq!(session.state(), LoopState::AwaitModel);
        assert_eq!(
            reasoning.step(&mut session).await.unwrap(),
            LoopState::DispatchTools
        );
        assert_eq!(
            reasoning.step(&mut session).await.unwrap(),
            LoopState::AwaitModel
        );
        assert_eq!(reasoning.step(&mut session).await.unwrap(), LoopState::Done);
        assert_eq!(reasoning.step(&mut session).await.unwrap(), LoopState::Done);
        assert_eq!(session.model_calls(), 2);
        assert_eq!(session.outcome(), Some(LoopOutcome::Answered));
    }

    #[tokio::test]
    async fn resume_dispatches_pending_calls_first() {
        let mut checkpoint = ConversationState::new("q");
        checkpoint
            .push(Message::assistant(
                "",
                vec![ToolCall {
                    id: "c1".into(),
                    name: "lookup".into(),
                    arguments: serde_json::json!({"key": "k"}),
                    signature: None,
                }],
            ))
            .unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![LlmResponse::from_text("resumed")]));
        let result = build(provider.clone(), 10).resume(checkpoint).await.unwrap();
        assert_eq!(result.answer, "resumed");
        assert_eq!(result.model_calls, 2);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(result.conversation.messages()[2].tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn resume_of_answered_conversation_calls_nothing() {
        let mut checkpoint = ConversationState::new("q");
        checkpoint.push(Message::assistant("already", vec![])).unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let result = build(provider.clone(), 10).resume(checkpoint).await.unwrap();
        assert_eq!(result.answer, "already");
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn resume_rejects_assistant_turn_over_unanswered_call() {
        let checkpoint: ConversationState = serde_json::from_value(serde_json::json!({
            "messages": [
                {"role": "user", "content": "q"},
                {"role": "assistant", "content": "", "tool_calls": [
                    {"id": "c1", "name": "lookup", "arguments": {"key": "k"}}
                ]},
                {"role": "assistant", "content": "x"}
            ]
        }))
        .unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let err = build(provider.clone(), 10).resume(checkpoint).await.unwrap_err();
        assert!(matches!(err, LoopError::Conversation(_)));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn observer_sees_transitions_in_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls("", vec![lookup_call("a")]),
            LlmResponse::from_text("ok"),
        ]));
        let recorder = Arc::new(RecordingObserver::new());
        build(provider, 10)
            .with_observer(recorder.clone())
            .run("q")
            .await
            .unwrap();

        let transitions: Vec<(LoopState, LoopState)> = recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Transition { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (LoopState::AwaitModel, LoopState::DispatchTools),
                (LoopState::DispatchTools, LoopState::AwaitModel),
                (LoopState::AwaitModel, LoopState::Done),
            ]
        );
    }
}
