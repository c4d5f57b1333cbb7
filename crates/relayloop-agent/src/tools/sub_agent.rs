use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{Tool, ToolContext};
use crate::subagent::{delegate, DelegationDeps, InvalidTaskError, DEFAULT_DELEGATION_TIMEOUT_SECS};
use relayloop_core::config::AgentMode;

/// Delegates a subtask to an isolated child agent and returns its work
/// report (or, on failure, a `ChildFailure` wire string) as the tool
/// result. Parent-only: `allowed_modes` excludes `AgentMode::Child`, so a
/// child registry built via `ToolRegistry::filter_by_mode` never carries
/// this tool — delegation cannot recurse.
pub struct SubAgentTool {
    deps: Option<Arc<DelegationDeps>>,
}

impl SubAgentTool {
    pub fn new(deps: Arc<DelegationDeps>) -> Self {
        Self { deps: Some(deps) }
    }

    /// A tool instance with no delegation runtime attached — only useful for
    /// exercising registry/mode-filtering logic in tests, never for
    /// executing a real delegation.
    pub fn new_disconnected() -> Self {
        Self { deps: None }
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        "sub_agent"
    }

    fn description(&self) -> &str {
        "Delegate a focused subtask to a child agent running in its own isolated session. \
         The child has the same tools as you, minus sub_agent and todo, and cannot delegate \
         further. Use this to offload a self-contained piece of work (e.g. \"find every caller \
         of this function and summarize them\") and get back a work report. The call blocks \
         until the child finishes or the timeout elapses."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "A self-contained description of the subtask for the child agent"
                },
                "timeout": {
                    "type": "number",
                    "description": "Seconds to wait for the child before giving up (default 180)"
                }
            },
            "required": ["task"]
        })
    }

    fn allowed_modes(&self) -> &[AgentMode] {
        &[AgentMode::Parent]
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let Some(deps) = &self.deps else {
            return Ok("Error: sub_agent tool has no delegation runtime attached".to_string());
        };

        let task = args
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| InvalidTaskError("missing required 'task' parameter".to_string()))?;
        if task.trim().is_empty() {
            return Err(InvalidTaskError("'task' must not be empty".to_string()).into());
        }

        let timeout = args
            .get("timeout")
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_DELEGATION_TIMEOUT_SECS);

        Ok(delegate(deps, ctx, task, timeout).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxPolicy;

    #[test]
    fn test_sub_agent_tool_definition() {
        let tool = SubAgentTool::new_disconnected();
        assert_eq!(tool.name(), "sub_agent");
        assert_eq!(tool.allowed_modes(), &[AgentMode::Parent]);
        let params = tool.parameters();
        assert!(params["properties"]["task"].is_object());
        assert_eq!(params["required"].as_array().unwrap()[0], "task");
    }

    #[tokio::test]
    async fn test_disconnected_tool_reports_error_instead_of_panicking() {
        let tool = SubAgentTool::new_disconnected();
        let ctx = ToolContext {
            workspace_dir: "/tmp".to_string(),
            agent_name: "test".to_string(),
            session_key: "s1".to_string(),
            sandbox: SandboxPolicy::default(),
        };
        let out = tool
            .execute(serde_json::json!({"task": "do something"}), &ctx)
            .await
            .unwrap();
        assert!(out.starts_with("Error:"));
    }

    #[tokio::test]
    async fn test_missing_task_is_invalid_task_error() {
        let tool = SubAgentTool::new(Arc::new(fake_deps()));
        let ctx = ToolContext {
            workspace_dir: "/tmp".to_string(),
            agent_name: "test".to_string(),
            session_key: "s1".to_string(),
            sandbox: SandboxPolicy::default(),
        };
        let err = tool.execute(serde_json::json!({}), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("missing required 'task'"));
    }

    fn fake_deps() -> DelegationDeps {
        use crate::event_bus::EventBus;
        use crate::session_manager::SessionManager;
        use crate::storage::SqliteStorage;
        use crate::tools::ToolRegistry;
        use relayloop_core::config::ToolsConfig;
        use tokio::sync::Mutex as AsyncMutex;

        struct NullProvider;
        #[async_trait]
        impl crate::llm::LlmProvider for NullProvider {
            fn name(&self) -> &str {
                "null"
            }
            async fn complete(
                &self,
                _messages: &[crate::llm::Message],
                _tools: &[crate::llm::ToolDefinition],
            ) -> Result<(crate::llm::Completion, crate::llm::UsageStats)> {
                anyhow::bail!("not connected")
            }
        }

        let storage: Arc<dyn crate::storage::Storage> = Arc::new(SqliteStorage::open_memory().unwrap());
        DelegationDeps {
            session_manager: Arc::new(SessionManager::new(storage.clone())),
            storage,
            event_bus: Arc::new(EventBus::new()),
            provider: Arc::new(NullProvider),
            tools_config: ToolsConfig::default(),
            parent_registry: ToolRegistry::new(),
            model: "test-model".to_string(),
            child_sessions: Arc::new(AsyncMutex::new(Vec::new())),
        }
    }
}
