pub mod edit_file;
pub mod exec;
pub mod read_file;
pub mod sub_agent;
pub mod todo;
pub mod write_file;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::llm::{FunctionDefinition, ToolDefinition};
use crate::sandbox::SandboxPolicy;
use relayloop_core::config::AgentMode;

/// Context passed to every tool execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub workspace_dir: String,
    pub agent_name: String,
    pub session_key: String,
    pub sandbox: SandboxPolicy,
}

/// Trait for all agent tools, matching the OpenAI function-calling shape.
///
/// `execute` returns `Ok(String)` for both success and tool-level semantic
/// failure (a string starting with `"Error:"`); it returns `Err` only for an
/// unexpected infrastructure fault, which the registry converts to the same
/// `"Error: <type>: <message>"` shape so callers never have to distinguish
/// the two once the call has passed through `ToolRegistry::execute`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;
    /// Modes this tool may be exposed in. An empty slice means unrestricted
    /// (available to both parent and child agents).
    fn allowed_modes(&self) -> &[AgentMode] {
        &[]
    }
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String>;
}

fn tool_allowed_in(modes: &[AgentMode], mode: AgentMode) -> bool {
    modes.is_empty() || modes.contains(&mode)
}

/// Mode-filtered catalog of invocable operations, keyed by tool name. Tools
/// are held behind `Arc` so `filter_by_mode`/`merge` can share instances
/// between a parent registry and the restricted copy built for a child.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// A registry carrying the representative tool set, all modes.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(read_file::ReadFileTool));
        registry.register(Arc::new(write_file::WriteFileTool));
        registry.register(Arc::new(edit_file::EditFileTool));
        registry.register(Arc::new(exec::ExecTool));
        registry.register(Arc::new(todo::TodoTool::new(Arc::new(crate::todo::TodoStore::new()))));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn unregister(&mut self, name: &str) {
        self.tools.retain(|t| t.name() != name);
    }

    pub fn list_tools(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool definitions for sending to the LLM, in OpenAI function-calling shape.
    pub fn schemas(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters(),
                },
            })
            .collect()
    }

    pub fn is_tool_allowed(&self, name: &str, mode: AgentMode) -> bool {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| tool_allowed_in(t.allowed_modes(), mode))
            .unwrap_or(false)
    }

    /// A new registry containing only tools whose `allowed_modes` includes
    /// `mode` (unrestricted tools are always included).
    pub fn filter_by_mode(&self, mode: AgentMode) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|t| tool_allowed_in(t.allowed_modes(), mode))
                .cloned()
                .collect(),
        }
    }

    /// Union by name; on collision the tool already present (`self`) wins.
    pub fn merge(self, other: Self) -> Self {
        let mut merged = self;
        for tool in other.tools {
            if !merged.tools.iter().any(|t| t.name() == tool.name()) {
                merged.tools.push(tool);
            }
        }
        merged
    }

    /// Execute a tool by name. Never propagates a handler error: an unknown
    /// tool name or an internal failure both collapse to an `"Error: ..."`
    /// string, matching the contract the Tool Executor relies on.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> String {
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            return format!("Error: unknown tool '{}'", name);
        };
        match tool.execute(args, ctx).await {
            Ok(output) => output,
            Err(e) => format!("Error: {}: {}", e.root_cause(), e),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let registry = ToolRegistry::with_defaults();
        let names = registry.list_tools();
        assert!(names.contains(&"read_file"));
        assert!(names.contains(&"write_file"));
        assert!(names.contains(&"edit_file"));
        assert!(names.contains(&"exec"));
        assert!(names.contains(&"todo"));
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_schemas_format() {
        let registry = ToolRegistry::with_defaults();
        let defs = registry.schemas();
        assert_eq!(defs.len(), 5);
        for def in &defs {
            assert_eq!(def.tool_type, "function");
            assert!(!def.function.name.is_empty());
        }
    }

    #[test]
    fn test_unregister() {
        let mut registry = ToolRegistry::with_defaults();
        registry.unregister("exec");
        assert!(!registry.list_tools().contains(&"exec"));
        assert_eq!(registry.list_tools().len(), 4);
    }

    #[test]
    fn test_filter_by_mode_removes_parent_only_tools() {
        let mut registry = ToolRegistry::with_defaults();
        registry.register(Arc::new(sub_agent::SubAgentTool::new_disconnected()));
        assert!(registry.list_tools().contains(&"sub_agent"));

        let child = registry.filter_by_mode(AgentMode::Child);
        assert!(!child.list_tools().contains(&"sub_agent"));
        assert!(!child.list_tools().contains(&"todo"));
        assert!(child.list_tools().contains(&"read_file"));
    }

    #[test]
    fn test_merge_first_wins_on_collision() {
        let mut a = ToolRegistry::new();
        a.register(Arc::new(read_file::ReadFileTool));
        let mut b = ToolRegistry::new();
        b.register(Arc::new(exec::ExecTool));

        let merged = a.merge(b);
        let names = merged.list_tools();
        assert!(names.contains(&"read_file"));
        assert!(names.contains(&"exec"));
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let ctx = ToolContext {
            workspace_dir: "/tmp".to_string(),
            agent_name: "test".to_string(),
            session_key: "s1".to_string(),
            sandbox: SandboxPolicy::default(),
        };
        let out = registry.execute("nope", serde_json::json!({}), &ctx).await;
        assert!(out.starts_with("Error:"));
    }
}
