use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const SUMMARY_MAX_CHARS: usize = 200;

/// A single tool invocation recorded by the executor, child agents only.
#[derive(Debug, Clone)]
pub struct ToolExecutionRecord {
    pub tool_name: String,
    pub args_summary: String,
    pub result_summary: String,
    pub success: bool,
    pub duration: Duration,
    pub timestamp_ms: i64,
}

/// Running record of everything a child agent did during its turn loop.
/// Only constructed for child-mode agents — a parent-mode Tool Executor has
/// nowhere to write and skips recording entirely.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    pub files_read: BTreeSet<String>,
    pub files_written: BTreeSet<String>,
    pub files_edited: BTreeSet<String>,
    pub tool_executions: Vec<ToolExecutionRecord>,
    pub errors: Vec<(String, String)>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one invocation, updating the well-known-tool file sets along
    /// the way so `files_modified`/counts stay derived rather than tracked
    /// twice.
    pub fn record(
        &mut self,
        tool_name: &str,
        args: &serde_json::Value,
        result: &str,
        success: bool,
        duration: Duration,
        timestamp_ms: i64,
    ) {
        if let Some(path) = args.get("path").and_then(|v| v.as_str()) {
            match tool_name {
                "read_file" => {
                    self.files_read.insert(path.to_string());
                }
                "write_file" => {
                    self.files_written.insert(path.to_string());
                }
                "edit_file" => {
                    self.files_edited.insert(path.to_string());
                }
                _ => {}
            }
        }

        let mut result_summary: String = result.chars().take(SUMMARY_MAX_CHARS).collect();
        if result.chars().count() > SUMMARY_MAX_CHARS {
            result_summary.push_str("...");
        }

        if !success {
            self.errors.push((tool_name.to_string(), result_summary.clone()));
        }

        self.tool_executions.push(ToolExecutionRecord {
            tool_name: tool_name.to_string(),
            args_summary: canonical_args(args),
            result_summary,
            success,
            duration,
            timestamp_ms,
        });
    }

    pub fn files_modified(&self) -> BTreeSet<String> {
        self.files_written.union(&self.files_edited).cloned().collect()
    }

    /// 1.0 on an empty log — an agent that made no tool calls didn't fail any either.
    pub fn success_rate(&self) -> f64 {
        if self.tool_executions.is_empty() {
            return 1.0;
        }
        let successes = self.tool_executions.iter().filter(|t| t.success).count();
        successes as f64 / self.tool_executions.len() as f64
    }

    pub fn tool_usage_summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for exec in &self.tool_executions {
            *counts.entry(exec.tool_name.clone()).or_insert(0) += 1;
        }
        counts
    }
}

fn canonical_args(args: &serde_json::Value) -> String {
    serde_json::to_string(args).unwrap_or_default()
}

/// Category a failed delegation is classified into, driving both the
/// retryability default and the suggested-action catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Timeout,
    MissingContext,
    ToolError,
    InvalidTask,
    Partial,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::MissingContext => "missing_context",
            FailureCategory::ToolError => "tool_error",
            FailureCategory::InvalidTask => "invalid_task",
            FailureCategory::Partial => "partial",
        }
    }
}

/// Structured description of a failed delegation, rendered to the wire
/// format the parent LLM sees as the `sub_agent` tool result.
#[derive(Debug, Clone)]
pub struct ChildFailure {
    pub category: FailureCategory,
    pub message: String,
    pub session_id: String,
    pub duration: Duration,
    pub completed_steps: Vec<String>,
    pub files_modified: Vec<String>,
    pub blocked_on: Option<String>,
    pub suggested_retry: bool,
    pub suggested_actions: Vec<String>,
    pub tool_usage: BTreeMap<String, usize>,
    pub last_successful_tool: Option<String>,
}

impl ChildFailure {
    /// Render the wire format defined for the `sub_agent` tool result: a
    /// human-readable summary followed by a machine-parseable
    /// `<task_metadata>` block.
    pub fn to_wire_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Child agent failed: {}\n", self.message));
        out.push_str(&format!("Category: {}\n", self.category.as_str()));
        out.push_str(&format!("Duration: {:.1}s\n", self.duration.as_secs_f64()));
        out.push_str(&format!(
            "Retryable: {}\n",
            if self.suggested_retry { "Yes" } else { "No" }
        ));

        out.push_str("Work completed before failure:\n");
        if self.completed_steps.is_empty() {
            out.push_str("  (none)\n");
        } else {
            for step in &self.completed_steps {
                out.push_str(&format!("  \u{2022} {}\n", step));
            }
        }

        if self.files_modified.is_empty() {
            out.push_str("Files modified: none\n");
        } else {
            out.push_str(&format!("Files modified: {}\n", self.files_modified.join(", ")));
        }

        if let Some(ref blocked) = self.blocked_on {
            out.push_str(&format!("Blocked on: {}\n", blocked));
        }

        out.push_str("Suggested recovery actions:\n");
        for action in &self.suggested_actions {
            out.push_str(&format!("  \u{2022} {}\n", action));
        }

        out.push_str("<task_metadata>\n");
        out.push_str(&format!("  <session_id>{}</session_id>\n", self.session_id));
        out.push_str("  <status>failed</status>\n");
        out.push_str(&format!(
            "  <failure_category>{}</failure_category>\n",
            self.category.as_str()
        ));
        out.push_str(&format!(
            "  <retryable>{}</retryable>\n",
            self.suggested_retry
        ));
        out.push_str("</task_metadata>");

        out
    }
}

/// Render the success-path wire format: the child's final text followed by
/// an `<execution_summary>` block.
pub fn render_work_report(
    session_id: &str,
    final_text: &str,
    duration: Duration,
    log: &ExecutionLog,
) -> String {
    let mut out = String::new();
    out.push_str(final_text);
    out.push_str("\n\n<execution_summary>\n");
    out.push_str(&format!("  <session_id>{}</session_id>\n", session_id));
    out.push_str(&format!("  <duration>{:.1}s</duration>\n", duration.as_secs_f64()));
    out.push_str(&format!("  <success_rate>{:.2}</success_rate>\n", log.success_rate()));

    out.push_str("  <files>\n");
    out.push_str(&format!("    <read_count>{}</read_count>\n", log.files_read.len()));
    let modified = log.files_modified();
    out.push_str(&format!("    <modified_count>{}</modified_count>\n", modified.len()));
    if !modified.is_empty() {
        out.push_str(&format!(
            "    <modified_list>{}</modified_list>\n",
            modified.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    out.push_str("  </files>\n");

    out.push_str("  <tools>\n");
    for (name, count) in log.tool_usage_summary() {
        out.push_str(&format!("    <tool name=\"{}\">{}</tool>\n", name, count));
    }
    out.push_str("  </tools>\n");

    if !log.errors.is_empty() {
        out.push_str("  <errors>\n");
        for (tool_name, msg) in &log.errors {
            out.push_str(&format!("    <error tool=\"{}\">{}</error>\n", tool_name, msg));
        }
        out.push_str("  </errors>\n");
    }

    out.push_str("</execution_summary>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_tracks_file_sets() {
        let mut log = ExecutionLog::new();
        log.record(
            "read_file",
            &serde_json::json!({"path": "/a.txt"}),
            "contents",
            true,
            Duration::from_millis(5),
            1000,
        );
        log.record(
            "write_file",
            &serde_json::json!({"path": "/b.txt"}),
            "wrote /b.txt",
            true,
            Duration::from_millis(5),
            1001,
        );
        assert!(log.files_read.contains("/a.txt"));
        assert!(log.files_written.contains("/b.txt"));
        assert_eq!(log.files_modified().len(), 1);
    }

    #[test]
    fn test_success_rate_empty_log_is_one() {
        let log = ExecutionLog::new();
        assert_eq!(log.success_rate(), 1.0);
    }

    #[test]
    fn test_success_rate_and_tool_usage_law() {
        let mut log = ExecutionLog::new();
        log.record("exec", &serde_json::json!({}), "ok", true, Duration::ZERO, 0);
        log.record("exec", &serde_json::json!({}), "Error: boom", false, Duration::ZERO, 1);
        log.record("read_file", &serde_json::json!({}), "ok", true, Duration::ZERO, 2);

        assert_eq!(log.success_rate(), 2.0 / 3.0);
        let summary = log.tool_usage_summary();
        let total: usize = summary.values().sum();
        assert_eq!(total, log.tool_executions.len());
        assert_eq!(log.errors.len(), 1);
    }

    #[test]
    fn test_result_summary_truncated() {
        let mut log = ExecutionLog::new();
        let long = "x".repeat(500);
        log.record("exec", &serde_json::json!({}), &long, true, Duration::ZERO, 0);
        assert!(log.tool_executions[0].result_summary.len() <= SUMMARY_MAX_CHARS + 3);
    }

    #[test]
    fn test_child_failure_wire_format() {
        let failure = ChildFailure {
            category: FailureCategory::Timeout,
            message: "wall-clock exceeded".to_string(),
            session_id: "child-1".to_string(),
            duration: Duration::from_secs_f64(0.5),
            completed_steps: vec!["Created 2 files".to_string()],
            files_modified: vec!["/a.txt".to_string(), "/b.txt".to_string()],
            blocked_on: None,
            suggested_retry: true,
            suggested_actions: vec!["retry with timeout=1.0s or greater".to_string()],
            tool_usage: BTreeMap::new(),
            last_successful_tool: Some("write_file".to_string()),
        };

        let wire = failure.to_wire_string();
        assert!(wire.contains("<failure_category>timeout</failure_category>"));
        assert!(wire.contains("<retryable>true</retryable>"));
        assert!(wire.contains("Created 2 files"));
        assert!(wire.contains("timeout=1.0s or greater"));
    }

    #[test]
    fn test_work_report_contains_execution_summary() {
        let mut log = ExecutionLog::new();
        log.record(
            "write_file",
            &serde_json::json!({"path": "/out.txt"}),
            "wrote /out.txt",
            true,
            Duration::from_millis(2),
            5,
        );
        let report = render_work_report("child-1", "done", Duration::from_secs_f64(1.2), &log);
        assert!(report.starts_with("done"));
        assert!(report.contains("<execution_summary>"));
        assert!(report.contains("<session_id>child-1</session_id>"));
        assert!(report.contains("write_file"));
    }
}
