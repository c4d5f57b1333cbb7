use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

use super::{Tool, ToolContext};

/// Surgical single-occurrence string replacement, per §4.14's representative tool set.
pub struct EditFileTool;

fn resolve_safe_write_path(workspace: &str, file_path: &str) -> Result<PathBuf> {
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
    let allowed_roots = [workspace, home, PathBuf::from("/tmp")];

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
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Apply a surgical edit to a file by replacing an exact string match with new content. More precise than rewriting the entire file. The old_string must match exactly (including whitespace) and must be unique in the file."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact string to find and replace (must be unique in the file)"
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement string"
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let file_path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("edit_file: missing 'path' argument"))?;

        let old_string = args
            .get("old_string")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("edit_file: missing 'old_string' argument"))?;

        let new_string = args
            .get("new_string")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("edit_file: missing 'new_string' argument"))?;

        if old_string == new_string {
            return Ok("Error: old_string and new_string are identical — no change needed".to_string());
        }

        let safe_path = match resolve_safe_write_path(&ctx.workspace_dir, file_path) {
            Ok(p) => p,
            Err(e) => return Ok(format!("Error: {}", e)),
        };

        let content = match tokio::fs::read_to_string(&safe_path).await {
            Ok(c) => c,
            Err(e) => return Ok(format!("Error: Failed to read {}: {}", file_path, e)),
        };

        let match_count = content.matches(old_string).count();

        if match_count == 0 {
            return Ok(format!(
                "Error: old_string not found in {}. Make sure it matches exactly (including whitespace and newlines).",
                file_path
            ));
        }

        if match_count > 1 {
            return Ok(format!(
                "Error: old_string found {} times in {}. It must be unique — provide more surrounding context to disambiguate.",
                match_count, file_path
            ));
        }

        let new_content = content.replacen(old_string, new_string, 1);

        match tokio::fs::write(&safe_path, &new_content).await {
            Ok(()) => {
                let old_lines = old_string.lines().count();
                let new_lines = new_string.lines().count();
                Ok(format!(
                    "Edited {} — replaced {} line(s) with {} line(s)",
                    file_path, old_lines, new_lines
                ))
            }
            Err(e) => Ok(format!("Error: Failed to write {}: {}", file_path, e)),
        }
    }
}
