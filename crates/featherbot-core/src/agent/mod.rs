//! Agent loop: drives one multi-turn language-model conversation.
//!
//! Grounded on the teacher's `AgentLoop` (system prompt + history + user
//! text → provider call → dispatch tool calls → repeat), generalized to
//! the new [`ConversationHistory`]/[`ConversationMessage`] types instead
//! of the teacher's JSONL-backed `SessionManager`, and to the two entry
//! points the spec draws (`process_message` from the bus path,
//! `process_direct` for programmatic/sub-agent/memory-extraction calls).
//! Unlike the teacher, a turn never throws: provider failures surface as
//! a `"[LLM Error] "`-prefixed reply instead of a propagated `Result::Err`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::events::{InboundMessage, SessionKey};
use crate::history::{ConversationHistory, ConversationMessage};
use crate::provider::types::{ChatMessage, FunctionCall, ToolCallMessage, Usage};
use crate::provider::LlmProvider;
use crate::tools::ToolRegistry;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are FeatherBot, a helpful assistant with access to tools. Use them when they help you answer accurately.";

/// Tunables for a single [`AgentLoop`] instance.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_tool_iterations: u32,
    pub max_history_messages: usize,
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 4096,
            temperature: 0.7,
            max_tool_iterations: 10,
            max_history_messages: crate::history::DEFAULT_MAX_MESSAGES,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// One tool call the model requested this turn.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// The text result of dispatching a [`ToolCallRecord`] through the registry.
#[derive(Debug, Clone)]
pub struct ToolResultRecord {
    pub id: String,
    pub name: String,
    pub result: String,
}

/// The outcome of one turn — returned from `process_message`/`process_direct`
/// and handed to the `onStepFinish` callback.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub text: String,
    pub usage: Usage,
    pub step_count: u32,
    pub finish_reason: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_results: Vec<ToolResultRecord>,
}

/// Optional overrides for [`AgentLoop::process_direct`].
#[derive(Default)]
pub struct ProcessOptions {
    pub system_prompt: Option<String>,
    pub session_key: Option<SessionKey>,
    pub cancel: Option<CancellationToken>,
    /// Skip persisting this turn's user/assistant pair into history.
    /// Used by memory extraction turns so the extraction prompt itself
    /// never pollutes the conversation it is summarizing.
    pub skip_history: bool,
}

/// Callback invoked once a turn resolves, with the same shape returned
/// to the caller. Any failure it returns is caught and discarded — it
/// must never interrupt the turn it's reporting on.
pub type StepFinishCallback = Arc<dyn Fn(&TurnResult) -> anyhow::Result<()> + Send + Sync>;

/// Drives turns for every session this process handles. Owns one
/// [`ConversationHistory`] per session key.
pub struct AgentLoop {
    provider: Box<dyn LlmProvider>,
    tools: ToolRegistry,
    config: AgentConfig,
    histories: HashMap<SessionKey, ConversationHistory>,
    on_step_finish: Option<StepFinishCallback>,
}

impl AgentLoop {
    pub fn new(provider: Box<dyn LlmProvider>, tools: ToolRegistry, config: AgentConfig) -> Self {
        Self {
            provider,
            tools,
            config,
            histories: HashMap::new(),
            on_step_finish: None,
        }
    }

    pub fn with_step_finish(mut self, callback: StepFinishCallback) -> Self {
        self.on_step_finish = Some(callback);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Mutable access to the tool registry, for callers that need to
    /// register additional tools after construction (e.g. the sub-agent
    /// spawn tools, which need a handle to the already-constructed
    /// `AgentLoop` they'll post follow-up turns through).
    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    /// Process an inbound bus event: derive the session key from the
    /// event and run the turn with the default system prompt.
    pub async fn process_message(&mut self, inbound: &InboundMessage) -> TurnResult {
        let session_key = inbound.session_key();
        self.run_turn(&inbound.content, session_key, None, None, false).await
    }

    /// Run a turn outside the bus path — used by the CLI, sub-agents, and
    /// the memory extractor.
    pub async fn process_direct(&mut self, text: &str, options: ProcessOptions) -> TurnResult {
        let session_key = options.session_key.unwrap_or_else(SessionKey::direct_default);
        self.run_turn(text, session_key, options.system_prompt, options.cancel, options.skip_history)
            .await
    }

    async fn run_turn(
        &mut self,
        text: &str,
        session_key: SessionKey,
        system_prompt: Option<String>,
        cancel: Option<CancellationToken>,
        skip_history: bool,
    ) -> TurnResult {
        let system_prompt = system_prompt.unwrap_or_else(|| self.config.system_prompt.clone());

        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Self::cancelled_result();
        }

        let history = self
            .histories
            .entry(session_key.clone())
            .or_insert_with(|| ConversationHistory::new(self.config.max_history_messages));

        let mut messages = vec![ChatMessage::system(&system_prompt)];
        messages.extend(history.get_messages().iter().map(to_chat_message));
        messages.push(ChatMessage::user(text));

        let tool_defs = self.tools.list_definitions();

        let mut step_count = 0u32;
        let mut accumulated_tool_calls: Vec<ToolCallRecord> = Vec::new();
        let mut accumulated_tool_results: Vec<ToolResultRecord> = Vec::new();

        let result = loop {
            step_count += 1;
            if step_count > self.config.max_tool_iterations {
                warn!(session = %session_key, steps = step_count, "max tool iterations exceeded");
                break TurnResult {
                    text: "I've reached the maximum number of tool iterations. Here's what I've done so far.".into(),
                    usage: Usage::default(),
                    step_count,
                    finish_reason: "max_iterations".into(),
                    tool_calls: accumulated_tool_calls.clone(),
                    tool_results: accumulated_tool_results.clone(),
                };
            }

            debug!(session = %session_key, step = step_count, "invoking provider");

            let response = match &cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Self::cancelled_result();
                        }
                        res = self.provider.chat(
                            &messages,
                            &tool_defs,
                            self.config.model.as_deref(),
                            self.config.max_tokens,
                            self.config.temperature,
                        ) => res,
                    }
                }
                None => {
                    self.provider
                        .chat(
                            &messages,
                            &tool_defs,
                            self.config.model.as_deref(),
                            self.config.max_tokens,
                            self.config.temperature,
                        )
                        .await
                }
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(session = %session_key, error = %e, "provider call failed");
                    break TurnResult {
                        text: format!("[LLM Error] {}", e),
                        usage: Usage::default(),
                        step_count,
                        finish_reason: "error".into(),
                        tool_calls: Vec::new(),
                        tool_results: Vec::new(),
                    };
                }
            };

            if response.tool_calls.is_empty() {
                let reply = response.content.unwrap_or_default();
                info!(session = %session_key, steps = step_count, "turn complete");
                break TurnResult {
                    text: reply,
                    usage: response.usage,
                    step_count,
                    finish_reason: response.finish_reason,
                    tool_calls: accumulated_tool_calls.clone(),
                    tool_results: accumulated_tool_results.clone(),
                };
            }

            let tool_call_messages: Vec<ToolCallMessage> = response
                .tool_calls
                .iter()
                .map(|tc| ToolCallMessage {
                    id: tc.id.clone(),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name: tc.name.clone(),
                        arguments: serde_json::to_string(&tc.arguments).unwrap_or_default(),
                    },
                })
                .collect();

            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content.as_deref(),
                tool_call_messages,
            ));

            for tc in &response.tool_calls {
                accumulated_tool_calls.push(ToolCallRecord {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                });

                let args: HashMap<String, serde_json::Value> = tc.arguments.clone().into_iter().collect();
                let result = self.tools.execute(&tc.name, args).await;

                accumulated_tool_results.push(ToolResultRecord {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    result: result.clone(),
                });

                messages.push(ChatMessage::tool_result(&tc.id, &tc.name, &result));
            }
        };

        if !skip_history {
            let history = self
                .histories
                .entry(session_key.clone())
                .or_insert_with(|| ConversationHistory::new(self.config.max_history_messages));
            history.add(ConversationMessage::user(text));
            if !result.text.is_empty() {
                history.add(ConversationMessage::assistant(result.text.clone()));
            }
        }

        if let Some(callback) = &self.on_step_finish {
            if let Err(e) = callback(&result) {
                warn!(error = %e, "onStepFinish callback failed; discarding");
            }
        }

        result
    }

    fn cancelled_result() -> TurnResult {
        TurnResult {
            text: String::new(),
            usage: Usage::default(),
            step_count: 0,
            finish_reason: "cancelled".into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    /// Clear a session's stored history. Used by the `/clear` command.
    pub fn clear_session(&mut self, session_key: &SessionKey) {
        if let Some(history) = self.histories.get_mut(session_key) {
            history.clear();
        }
    }
}

fn to_chat_message(message: &ConversationMessage) -> ChatMessage {
    use crate::history::Role;
    match message.role {
        Role::System => ChatMessage::system(&message.content),
        Role::User => ChatMessage::user(&message.content),
        Role::Assistant => ChatMessage::assistant(&message.content),
        Role::Tool => ChatMessage::tool_result(
            message.tool_call_id.as_deref().unwrap_or_default(),
            "",
            &message.content,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::{LlmResponse, ToolCallRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubProvider {
        responses: Mutex<Vec<anyhow::Result<LlmResponse>>>,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[crate::provider::types::ToolDefinition],
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<LlmResponse> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                anyhow::bail!("no more stubbed responses");
            }
            responses.remove(0)
        }

        fn default_model(&self) -> &str {
            "stub"
        }
    }

    fn plain_response(text: &str) -> anyhow::Result<LlmResponse> {
        Ok(LlmResponse {
            content: Some(text.into()),
            tool_calls: Vec::new(),
            finish_reason: "stop".into(),
            usage: Usage::default(),
        })
    }

    #[tokio::test]
    async fn simple_turn_returns_provider_reply_and_saves_history() {
        let provider = StubProvider { responses: Mutex::new(vec![plain_response("hi there")]) };
        let mut agent = AgentLoop::new(Box::new(provider), ToolRegistry::new(), AgentConfig::default());

        let result = agent.process_direct("hello", ProcessOptions::default()).await;
        assert_eq!(result.text, "hi there");
        assert_eq!(result.finish_reason, "stop");

        let history = agent.histories.get(&SessionKey::direct_default()).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn skip_history_does_not_persist_the_turn() {
        let provider = StubProvider { responses: Mutex::new(vec![plain_response("noted")]) };
        let mut agent = AgentLoop::new(Box::new(provider), ToolRegistry::new(), AgentConfig::default());

        let options = ProcessOptions { skip_history: true, ..Default::default() };
        agent.process_direct("extract", options).await;

        assert!(agent.histories.get(&SessionKey::direct_default()).is_none());
    }

    #[tokio::test]
    async fn provider_error_surfaces_as_llm_error_prefix() {
        let provider = StubProvider { responses: Mutex::new(Vec::new()) };
        let mut agent = AgentLoop::new(Box::new(provider), ToolRegistry::new(), AgentConfig::default());

        let result = agent.process_direct("hello", ProcessOptions::default()).await;
        assert!(result.text.starts_with("[LLM Error] "));
        assert_eq!(result.finish_reason, "error");
        assert!(result.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn tool_calls_dispatch_through_registry_before_final_reply() {
        use crate::tools::Tool;
        use serde_json::{json, Value};

        struct EchoTool;
        #[async_trait]
        impl Tool for EchoTool {
            fn name(&self) -> &str {
                "echo"
            }
            fn description(&self) -> &str {
                "echoes input"
            }
            fn parameters(&self) -> Value {
                json!({"type": "object", "properties": {}})
            }
            async fn execute(&self, _args: HashMap<String, Value>) -> String {
                "echoed!".into()
            }
        }

        let tool_call_response = Ok(LlmResponse {
            content: None,
            tool_calls: vec![ToolCallRequest { id: "call_1".into(), name: "echo".into(), arguments: serde_json::Map::new() }],
            finish_reason: "tool_calls".into(),
            usage: Usage::default(),
        });

        let provider = StubProvider {
            responses: Mutex::new(vec![tool_call_response, plain_response("done")]),
        };

        let mut tools = ToolRegistry::new();
        tools.register(Box::new(EchoTool)).unwrap();

        let mut agent = AgentLoop::new(Box::new(provider), tools, AgentConfig::default());
        let result = agent.process_direct("go", ProcessOptions::default()).await;

        assert_eq!(result.text, "done");
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_results[0].result, "echoed!");
    }

    #[tokio::test]
    async fn max_iterations_produces_fallback_reply() {
        let mut responses = Vec::new();
        for _ in 0..5 {
            responses.push(Ok(LlmResponse {
                content: None,
                tool_calls: vec![ToolCallRequest { id: "x".into(), name: "missing".into(), arguments: serde_json::Map::new() }],
                finish_reason: "tool_calls".into(),
                usage: Usage::default(),
            }));
        }
        let provider = StubProvider { responses: Mutex::new(responses) };
        let mut config = AgentConfig::default();
        config.max_tool_iterations = 2;

        let mut agent = AgentLoop::new(Box::new(provider), ToolRegistry::new(), config);
        let result = agent.process_direct("loop forever", ProcessOptions::default()).await;

        assert_eq!(result.finish_reason, "max_iterations");
        assert!(result.text.contains("maximum number of tool iterations"));
    }

    #[tokio::test]
    async fn cancellation_before_first_call_skips_provider_and_history() {
        let provider = StubProvider { responses: Mutex::new(vec![plain_response("should not be seen")]) };
        let mut agent = AgentLoop::new(Box::new(provider), ToolRegistry::new(), AgentConfig::default());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let options = ProcessOptions { cancel: Some(cancel), ..Default::default() };
        let result = agent.process_direct("hello", options).await;

        assert_eq!(result.finish_reason, "cancelled");
        assert!(agent.histories.get(&SessionKey::direct_default()).is_none());
    }

    #[tokio::test]
    async fn on_step_finish_failure_is_discarded() {
        let provider = StubProvider { responses: Mutex::new(vec![plain_response("hi")]) };
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let mut agent = AgentLoop::new(Box::new(provider), ToolRegistry::new(), AgentConfig::default())
            .with_step_finish(Arc::new(move |_result| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("callback exploded")
            }));

        let result = agent.process_direct("hi", ProcessOptions::default()).await;
        assert_eq!(result.text, "hi");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
