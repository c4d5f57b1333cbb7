use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{Tool, ToolContext};
use crate::todo::{TodoDraft, TodoPatch, TodoPriority, TodoStatus, TodoStore};
use relayloop_core::config::AgentMode;

/// Tool-facing surface of the todo store: `write`/`read`/`update`/`complete`/`delete`,
/// restricted to the parent agent per the representative tool set.
pub struct TodoTool {
    store: Arc<TodoStore>,
}

impl TodoTool {
    pub fn new(store: Arc<TodoStore>) -> Self {
        Self { store }
    }
}

fn parse_priority(v: Option<&Value>) -> TodoPriority {
    match v.and_then(|v| v.as_str()) {
        Some("low") => TodoPriority::Low,
        Some("high") => TodoPriority::High,
        _ => TodoPriority::Medium,
    }
}

fn parse_status(v: Option<&Value>) -> Option<TodoStatus> {
    match v.and_then(|v| v.as_str()) {
        Some("pending") => Some(TodoStatus::Pending),
        Some("in_progress") => Some(TodoStatus::InProgress),
        Some("completed") => Some(TodoStatus::Completed),
        Some("cancelled") => Some(TodoStatus::Cancelled),
        _ => None,
    }
}

fn render(items: &[crate::todo::TodoItem]) -> String {
    if items.is_empty() {
        return "(todo list is empty)".to_string();
    }
    items
        .iter()
        .map(|i| format!("[{:?}] {} ({:?}): {}", i.status, i.id, i.priority, i.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Tool for TodoTool {
    fn name(&self) -> &str {
        "todo"
    }

    fn description(&self) -> &str {
        "Manage the session's todo list. Actions: write (replace the whole list), read, update (patch one item), complete (mark one item done), delete (clear the list)."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["write", "read", "update", "complete", "delete"]
                },
                "items": {
                    "type": "array",
                    "description": "For 'write': full replacement list of {id, content, status?, priority?}",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string"},
                            "content": {"type": "string"},
                            "status": {"type": "string", "enum": ["pending", "in_progress", "completed", "cancelled"]},
                            "priority": {"type": "string", "enum": ["low", "medium", "high"]}
                        },
                        "required": ["id", "content"]
                    }
                },
                "id": {"type": "string", "description": "For 'update'/'complete': the item id"},
                "content": {"type": "string", "description": "For 'update': new content"},
                "status": {"type": "string", "description": "For 'update': new status"},
                "priority": {"type": "string", "description": "For 'update': new priority"}
            },
            "required": ["action"]
        })
    }

    fn allowed_modes(&self) -> &[AgentMode] {
        &[AgentMode::Parent]
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let action = args
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("todo: missing 'action' argument"))?;

        match action {
            "write" => {
                let raw_items = args
                    .get("items")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| anyhow::anyhow!("todo: 'write' requires an 'items' array"))?;

                let mut drafts = Vec::with_capacity(raw_items.len());
                for item in raw_items {
                    let id = item
                        .get("id")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("todo: item missing 'id'"))?;
                    let content = item
                        .get("content")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("todo: item missing 'content'"))?;
                    let mut draft = TodoDraft::new(id, content);
                    if let Some(status) = parse_status(item.get("status")) {
                        draft.status = status;
                    }
                    draft.priority = parse_priority(item.get("priority"));
                    drafts.push(draft);
                }

                match self.store.write(drafts) {
                    Ok(items) => Ok(render(&items)),
                    Err(e) => Ok(format!("Error: {}", e)),
                }
            }
            "read" => Ok(render(&self.store.read())),
            "update" => {
                let id = args
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("todo: 'update' requires an 'id'"))?;
                let patch = TodoPatch {
                    status: parse_status(args.get("status")),
                    content: args.get("content").and_then(|v| v.as_str()).map(String::from),
                    priority: args.get("priority").map(|v| parse_priority(Some(v))),
                };
                match self.store.update(id, patch) {
                    Ok(item) => Ok(format!("Updated {}: {:?}", item.id, item.status)),
                    Err(e) => Ok(format!("Error: {}", e)),
                }
            }
            "complete" => {
                let id = args
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("todo: 'complete' requires an 'id'"))?;
                match self.store.complete(id) {
                    Ok(item) => Ok(format!("Completed {}", item.id)),
                    Err(e) => Ok(format!("Error: {}", e)),
                }
            }
            "delete" => {
                self.store.delete();
                Ok("Todo list cleared".to_string())
            }
            other => Ok(format!("Error: unknown todo action '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext {
            workspace_dir: "/tmp".to_string(),
            agent_name: "test".to_string(),
            session_key: "s1".to_string(),
            sandbox: crate::sandbox::SandboxPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let tool = TodoTool::new(Arc::new(TodoStore::new()));
        let args = serde_json::json!({
            "action": "write",
            "items": [{"id": "a", "content": "do the thing"}]
        });
        let result = tool.execute(args, &ctx()).await.unwrap();
        assert!(result.contains("do the thing"));

        let read = tool.execute(serde_json::json!({"action": "read"}), &ctx()).await.unwrap();
        assert!(read.contains("do the thing"));
    }

    #[tokio::test]
    async fn test_update_and_complete() {
        let tool = TodoTool::new(Arc::new(TodoStore::new()));
        tool.execute(
            serde_json::json!({"action": "write", "items": [{"id": "a", "content": "x"}]}),
            &ctx(),
        )
        .await
        .unwrap();

        let updated = tool
            .execute(
                serde_json::json!({"action": "update", "id": "a", "status": "in_progress"}),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(updated.contains("InProgress"));

        let completed = tool
            .execute(serde_json::json!({"action": "complete", "id": "a"}), &ctx())
            .await
            .unwrap();
        assert!(completed.contains("Completed a"));
    }

    #[tokio::test]
    async fn test_delete_clears_list_and_resets_pending_gate() {
        let tool = TodoTool::new(Arc::new(TodoStore::new()));
        tool.execute(
            serde_json::json!({"action": "write", "items": [{"id": "a", "content": "x"}]}),
            &ctx(),
        )
        .await
        .unwrap();

        let deleted = tool.execute(serde_json::json!({"action": "delete"}), &ctx()).await.unwrap();
        assert_eq!(deleted, "Todo list cleared");

        let rewritten = tool
            .execute(
                serde_json::json!({"action": "write", "items": [{"id": "b", "content": "y"}]}),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(rewritten.contains("y"));
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let tool = TodoTool::new(Arc::new(TodoStore::new()));
        let result = tool
            .execute(serde_json::json!({"action": "bogus"}), &ctx())
            .await
            .unwrap();
        assert!(result.starts_with("Error:"));
    }

    #[test]
    fn test_allowed_modes_parent_only() {
        let tool = TodoTool::new(Arc::new(TodoStore::new()));
        assert_eq!(tool.allowed_modes(), &[AgentMode::Parent]);
    }
}
