use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

use super::{Tool, ToolContext};

const MAX_FILE_BYTES: usize = 128 * 1024;

pub struct ReadFileTool;

fn resolve_safe_path(workspace: &str, file_path: &str) -> Result<PathBuf> {
    let workspace = PathBuf::from(workspace).canonicalize()?;
    let target = if file_path.starts_with('/') {
        PathBuf::from(file_path)
    } else {
        workspace.join(file_path)
    };

    let canonical = target
        .canonicalize()
        .map_err(|_| anyhow::anyhow!("File not found: {}", file_path))?;

    let home = dirs::home_dir().unwrap_or_default();
    let allowed_roots = [workspace.clone(), home.clone(), PathBuf::from("/tmp")];

    if allowed_roots.iter().any(|root| canonical.starts_with(root)) {
        Ok(canonical)
    } else {
        anyhow::bail!(
            "Path traversal denied: {} is outside allowed directories",
            file_path
        )
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Returns the file content as text with line numbers. Paths are relative to the workspace directory unless absolute."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read (relative to workspace or absolute)"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let file_path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("read_file: missing 'path' argument"))?;

        let safe_path = match resolve_safe_path(&ctx.workspace_dir, file_path) {
            Ok(p) => p,
            Err(e) => return Ok(format!("Error: {}", e)),
        };

        let content = match tokio::fs::read_to_string(&safe_path).await {
            Ok(c) => c,
            Err(e) => return Ok(format!("Error: Failed to read {}: {}", file_path, e)),
        };

        if content.len() > MAX_FILE_BYTES {
            return Ok(format!(
                "Error: File too large ({} bytes, max {}). Use offset/limit to read a portion.",
                content.len(),
                MAX_FILE_BYTES
            ));
        }

        let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let limit = args.get("limit").and_then(|v| v.as_u64());

        let lines: Vec<&str> = content.lines().collect();
        let start = if offset > 0 { offset - 1 } else { 0 };
        let end = match limit {
            Some(l) => std::cmp::min(start + l as usize, lines.len()),
            None => lines.len(),
        };

        if start >= lines.len() {
            return Ok(format!(
                "(file has {} lines, offset {} is past end)",
                lines.len(),
                offset
            ));
        }

        let selected: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>4}\t{}", start + i + 1, line))
            .collect();

        Ok(selected.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext {
            workspace_dir: "/tmp".to_string(),
            agent_name: "test".to_string(),
            session_key: "test-session".to_string(),
            sandbox: crate::sandbox::SandboxPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_read_file() {
        let tool = ReadFileTool;
        tokio::fs::write("/tmp/relayloop-test-read.txt", "line1\nline2\nline3\n")
            .await
            .unwrap();

        let args = serde_json::json!({"path": "/tmp/relayloop-test-read.txt"});
        let result = tool.execute(args, &ctx()).await.unwrap();
        assert!(!result.starts_with("Error:"));
        assert!(result.contains("line1"));
        assert!(result.contains("line3"));

        tokio::fs::remove_file("/tmp/relayloop-test-read.txt").await.ok();
    }

    #[tokio::test]
    async fn test_read_with_offset_limit() {
        let tool = ReadFileTool;
        tokio::fs::write("/tmp/relayloop-test-read2.txt", "a\nb\nc\nd\ne\n")
            .await
            .unwrap();

        let args =
            serde_json::json!({"path": "/tmp/relayloop-test-read2.txt", "offset": 2, "limit": 2});
        let result = tool.execute(args, &ctx()).await.unwrap();
        assert!(!result.starts_with("Error:"));
        assert!(result.contains("b"));
        assert!(result.contains("c"));
        assert!(!result.contains("a"));
        assert!(!result.contains("d"));

        tokio::fs::remove_file("/tmp/relayloop-test-read2.txt").await.ok();
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let tool = ReadFileTool;
        let args = serde_json::json!({"path": "/tmp/relayloop-does-not-exist.txt"});
        let result = tool.execute(args, &ctx()).await.unwrap();
        assert!(result.starts_with("Error:"));
    }
}
