use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn, Instrument};

use crate::event_bus::{EventBus, SessionEvent};
use crate::execution_log::ExecutionLog;
use crate::llm::{Completion, LlmProvider, Message, ToolDefinition, UsageStats};
use crate::memory::ConversationMemory;
use crate::permission::{PermissionGate, PermissionPrompt};
use crate::storage::Storage;
use crate::tool_executor::ToolExecutor;
use crate::tools::{ToolContext, ToolRegistry};
use relayloop_core::config::{AgentConfig, AgentMode};

/// State machine driven by the turn loop. Every transition publishes an
/// `agent_state_change` event carrying the new state's name as `detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Thinking,
    ExecutingTools,
    WaitingForChild,
    Completed,
    Failed,
}

impl AgentState {
    fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Thinking => "thinking",
            AgentState::ExecutingTools => "executing_tools",
            AgentState::WaitingForChild => "waiting_for_child",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
        }
    }
}

/// Live status of a running or finished agent, readable by a UI or by
/// Delegation watching a child from the parent side.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub session_id: String,
    pub mode: AgentMode,
    pub state: AgentState,
    pub current_action: Option<String>,
    pub child_sessions: Vec<String>,
    pub parent_session: Option<String>,
}

/// Orchestrates the thinking/executing-tools state machine for one session.
/// Holds all collaborators an agent needs to run a turn: memory, the
/// mode-filtered tool registry, the LLM provider handle, the tool executor,
/// and (for child-mode agents only) an ExecutionLog.
pub struct Agent {
    config: AgentConfig,
    session_id: String,
    parent_session: Option<String>,
    memory: AsyncMutex<ConversationMemory>,
    registry: ToolRegistry,
    provider: Arc<dyn LlmProvider>,
    tool_ctx: ToolContext,
    executor: ToolExecutor,
    execution_log: Option<AsyncMutex<ExecutionLog>>,
    event_bus: Arc<EventBus>,
    storage: Option<Arc<dyn Storage>>,
    state: AsyncMutex<AgentState>,
    /// Shared with the `sub_agent` tool's `DelegationDeps` when this agent
    /// supports delegation, so a running delegation can record/clear its
    /// child session id without the tool needing a back-reference to this
    /// `Agent`.
    child_sessions: Arc<AsyncMutex<Vec<String>>>,
    echo_whitelist: Vec<String>,
}

impl Agent {
    /// Build an Agent. The registry passed in is filtered internally by
    /// `config.mode` before any tool is exposed to the provider — a child
    /// agent never sees `sub_agent` or `todo` regardless of what the caller
    /// registered. `ExecutionLog` is allocated only for `AgentMode::Child`.
    /// `child_sessions` is the handle the `sub_agent` tool (if registered)
    /// mutates as it starts and finishes delegations; pass a fresh empty
    /// `Arc` when the agent does not support delegation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentConfig,
        memory: ConversationMemory,
        registry: ToolRegistry,
        provider: Arc<dyn LlmProvider>,
        gate: Arc<PermissionGate>,
        prompt: Arc<dyn PermissionPrompt>,
        event_bus: Arc<EventBus>,
        storage: Option<Arc<dyn Storage>>,
        tool_ctx: ToolContext,
        session_id: String,
        parent_session_id: Option<String>,
        child_sessions: Arc<AsyncMutex<Vec<String>>>,
    ) -> Self {
        let registry = registry.filter_by_mode(config.mode);
        let echo_whitelist = registry.list_tools().iter().map(|s| s.to_string()).collect();
        let execution_log = matches!(config.mode, AgentMode::Child).then(|| AsyncMutex::new(ExecutionLog::new()));
        let executor = ToolExecutor::new(gate, prompt, event_bus.clone());

        Self {
            config,
            session_id,
            parent_session: parent_session_id,
            memory: AsyncMutex::new(memory),
            registry,
            provider,
            tool_ctx,
            executor,
            execution_log,
            event_bus,
            storage,
            state: AsyncMutex::new(AgentState::Idle),
            child_sessions,
            echo_whitelist,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn status(&self) -> AgentStatus {
        AgentStatus {
            session_id: self.session_id.clone(),
            mode: self.config.mode,
            state: *self.state.lock().await,
            current_action: None,
            child_sessions: self.child_sessions.lock().await.clone(),
            parent_session: self.parent_session.clone(),
        }
    }

    /// The execution log accumulated so far, if this agent is running in
    /// child mode. `None` for a parent-mode agent.
    pub async fn execution_log_snapshot(&self) -> Option<ExecutionLog> {
        match &self.execution_log {
            Some(log) => Some(log.lock().await.clone()),
            None => None,
        }
    }

    /// Run the turn loop to completion for a single user input, returning
    /// the final assistant text. See §4.9: idle → thinking → executing_tools
    /// → … → completed | failed.
    pub async fn run(&self, user_input: &str) -> Result<String> {
        let span = tracing::info_span!(
            "agent_session",
            session_id = %self.session_id,
            agent_mode = ?self.config.mode,
        );
        self.run_inner(user_input).instrument(span).await
    }

    async fn run_inner(&self, user_input: &str) -> Result<String> {
        self.publish("agent_start", user_input);

        let user_msg = Message::user(user_input);
        self.memory.lock().await.add(user_msg.clone());
        self.persist(&user_msg).await;

        for turn in 1..=self.config.max_turns {
            self.transition(AgentState::Thinking).await;

            let (messages, schemas) = {
                let memory = self.memory.lock().await;
                (memory.get_messages(), self.registry.schemas())
            };

            let completion = match self.call_provider(&messages, &schemas).await {
                Ok(pair) => pair,
                Err(e) => {
                    self.transition(AgentState::Failed).await;
                    self.publish("agent_done", "status=error");
                    return Err(e);
                }
            };

            let assistant_msg = self.finalize_message(completion.0);
            self.memory.lock().await.add(assistant_msg.clone());
            self.persist(&assistant_msg).await;

            let calls = assistant_msg.tool_calls.clone().unwrap_or_default();
            if calls.is_empty() {
                self.transition(AgentState::Completed).await;
                self.publish("agent_done", &format!("status=completed,turns={}", turn));
                return Ok(assistant_msg.content.unwrap_or_default());
            }

            self.transition(AgentState::ExecutingTools).await;
            let results = self
                .executor
                .execute(
                    &self.session_id,
                    &calls,
                    &self.registry,
                    &self.tool_ctx,
                    self.execution_log.as_ref(),
                )
                .await;

            {
                let mut memory = self.memory.lock().await;
                for r in &results {
                    memory.add(r.clone());
                }
            }
            for r in &results {
                self.persist(r).await;
            }
        }

        self.transition(AgentState::Failed).await;
        self.publish("agent_done", "status=max_turns");
        Ok("Max turns exceeded".to_string())
    }

    async fn call_provider(
        &self,
        messages: &[Message],
        schemas: &[ToolDefinition],
    ) -> Result<(Completion, UsageStats)> {
        let timeout = Duration::from_secs_f64(self.config.timeout_secs.max(1.0));
        let call = async {
            if self.config.stream {
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
                // The turn loop only needs the finalized Completion; the wire-level
                // deltas are drained so the streaming provider isn't blocked on a
                // full channel. Live progress is observed through the Event Bus.
                let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
                let result = self.provider.complete_streaming(messages, schemas, tx).await;
                drain.abort();
                result
            } else {
                self.provider.complete(messages, schemas).await
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(session_id = %self.session_id, timeout_secs = self.config.timeout_secs, "provider call timed out");
                anyhow::bail!("LLM call timed out after {:.1}s", self.config.timeout_secs)
            }
        }
    }

    /// Strip self-echoed tool-call transcriptions from assistant text per
    /// §4.8 before the message is handed back to the turn loop.
    fn finalize_message(&self, completion: Completion) -> Message {
        match completion {
            Completion::Text { content, reasoning } => {
                let stripped = strip_echoed_tool_calls(&content, &self.echo_whitelist);
                let mut msg = Message::assistant(&stripped);
                msg.reasoning_content = reasoning;
                msg
            }
            Completion::ToolCalls { calls, reasoning } => Message::assistant_tool_calls(calls, reasoning),
        }
    }

    async fn transition(&self, state: AgentState) {
        *self.state.lock().await = state;
        info!(session_id = %self.session_id, state = state.as_str(), "agent state transition");
        self.publish("agent_state_change", state.as_str());
    }

    fn publish(&self, kind: &str, detail: &str) {
        self.event_bus.publish(SessionEvent::new(&self.session_id, kind, detail));
    }

    async fn persist(&self, message: &Message) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_message(&self.session_id, message).await {
                warn!(session_id = %self.session_id, error = %e, "failed to persist message");
            }
        }
    }
}

/// Remove lines that look like a textual transcription of a call to one of
/// `tool_names` (e.g. `read_file(path="/a")`) from model output. Source LLMs
/// occasionally narrate the call they are about to make as text alongside
/// emitting the structured tool_calls payload; left in place it would be
/// shown to the user as if it were the final answer.
fn strip_echoed_tool_calls(content: &str, tool_names: &[String]) -> String {
    if content.is_empty() || tool_names.is_empty() {
        return content.to_string();
    }
    let alternation = tool_names
        .iter()
        .map(|n| regex::escape(n))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!(r"(?m)^\s*(?:{})\([^\n]*\)\s*$", alternation);
    let Ok(re) = Regex::new(&pattern) else {
        return content.to_string();
    };
    re.replace_all(content, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FunctionCall, ToolCall, UsageStats};
    use crate::permission::AutoApprove;
    use crate::sandbox::SandboxPolicy;
    use async_trait::async_trait;
    use relayloop_core::config::ToolsConfig;

    /// Scripted provider: returns a fixed sequence of completions, one per call.
    struct ScriptedProvider {
        responses: AsyncMutex<Vec<Completion>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Completion>) -> Self {
            Self {
                responses: AsyncMutex::new(responses.into_iter().rev().collect()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _messages: &[Message], _tools: &[ToolDefinition]) -> Result<(Completion, UsageStats)> {
            let mut responses = self.responses.lock().await;
            let next = responses.pop().expect("scripted provider ran out of responses");
            Ok((next, UsageStats::default()))
        }
    }

    fn tool_ctx() -> ToolContext {
        ToolContext {
            workspace_dir: "/tmp".to_string(),
            agent_name: "test".to_string(),
            session_key: "s1".to_string(),
            sandbox: SandboxPolicy::default(),
        }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            model: "test-model".to_string(),
            max_turns: 5,
            timeout_secs: 5.0,
            stream: false,
            mode: AgentMode::Parent,
        }
    }

    fn agent(provider: Arc<dyn LlmProvider>, registry: ToolRegistry) -> Agent {
        Agent::new(
            config(),
            ConversationMemory::new(100_000, None),
            registry,
            provider,
            Arc::new(PermissionGate::new(ToolsConfig::default())),
            Arc::new(AutoApprove),
            Arc::new(EventBus::new()),
            None,
            tool_ctx(),
            "s1".to_string(),
            None,
            Arc::new(AsyncMutex::new(Vec::new())),
        )
    }

    #[tokio::test]
    async fn test_parent_completes_without_tools() {
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new(vec![Completion::Text {
            content: "hi".to_string(),
            reasoning: None,
        }]));
        let a = agent(provider, ToolRegistry::new());
        let result = a.run("hello").await.unwrap();
        assert_eq!(result, "hi");
        assert_eq!(a.status().await.state, AgentState::Completed);
    }

    #[tokio::test]
    async fn test_single_tool_round_trip() {
        let call = ToolCall {
            id: "c1".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "read_file".to_string(),
                arguments: r#"{"path": "/nonexistent-round-trip"}"#.to_string(),
            },
        };
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new(vec![
            Completion::ToolCalls {
                calls: vec![call],
                reasoning: None,
            },
            Completion::Text {
                content: "done".to_string(),
                reasoning: None,
            },
        ]));
        let a = agent(provider, ToolRegistry::with_defaults());
        let result = a.run("read the file").await.unwrap();
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn test_malformed_json_does_not_halt_turn() {
        let call = ToolCall {
            id: "c1".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "read_file".to_string(),
                arguments: "{path:".to_string(),
            },
        };
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new(vec![
            Completion::ToolCalls {
                calls: vec![call],
                reasoning: None,
            },
            Completion::Text {
                content: "recovered".to_string(),
                reasoning: None,
            },
        ]));
        let a = agent(provider, ToolRegistry::with_defaults());
        let result = a.run("go").await.unwrap();
        assert_eq!(result, "recovered");
    }

    #[tokio::test]
    async fn test_max_turns_exceeded() {
        let call = || ToolCall {
            id: "c1".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "read_file".to_string(),
                arguments: r#"{"path": "/nonexistent-loop"}"#.to_string(),
            },
        };
        let responses = (0..10)
            .map(|_| Completion::ToolCalls {
                calls: vec![call()],
                reasoning: None,
            })
            .collect();
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new(responses));
        let mut cfg = config();
        cfg.max_turns = 3;
        let a = Agent::new(
            cfg,
            ConversationMemory::new(100_000, None),
            ToolRegistry::with_defaults(),
            provider,
            Arc::new(PermissionGate::new(ToolsConfig::default())),
            Arc::new(AutoApprove),
            Arc::new(EventBus::new()),
            None,
            tool_ctx(),
            "s1".to_string(),
            None,
            Arc::new(AsyncMutex::new(Vec::new())),
        );
        let result = a.run("loop forever").await.unwrap();
        assert_eq!(result, "Max turns exceeded");
        assert_eq!(a.status().await.state, AgentState::Failed);
    }

    #[test]
    fn test_strip_echoed_tool_calls() {
        let content = "Let me check that.\nread_file(path=\"/a\")\nDone.";
        let stripped = strip_echoed_tool_calls(content, &["read_file".to_string()]);
        assert!(!stripped.contains("read_file(path"));
        assert!(stripped.contains("Let me check that."));
        assert!(stripped.contains("Done."));
    }

    #[test]
    fn test_strip_echoed_tool_calls_noop_without_match() {
        let content = "Plain text response.";
        let stripped = strip_echoed_tool_calls(content, &["read_file".to_string()]);
        assert_eq!(stripped, content);
    }

    #[test]
    fn test_agent_state_as_str() {
        assert_eq!(AgentState::ExecutingTools.as_str(), "executing_tools");
        assert_eq!(AgentState::WaitingForChild.as_str(), "waiting_for_child");
    }
}
