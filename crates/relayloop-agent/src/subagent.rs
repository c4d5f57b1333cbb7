//! Delegation — lets a parent-mode agent hand a subtask to an isolated
//! child agent that runs its own turn loop with a restricted tool registry,
//! then folds the child's outcome back into a single tool-result string for
//! the parent. The child never sees the `sub_agent` or `todo` tools
//! (`ToolRegistry::filter_by_mode` enforces this structurally), so recursive
//! delegation is impossible without a runtime check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::event_bus::{EventBus, SessionEvent};
use crate::execution_log::{render_work_report, ChildFailure, ExecutionLog, FailureCategory};
use crate::llm::LlmProvider;
use crate::memory::ConversationMemory;
use crate::permission::{AutoApprove, PermissionGate};
use crate::runtime::Agent;
use crate::session_manager::SessionManager;
use crate::storage::{SessionEventRecord, Storage};
use crate::tools::{ToolContext, ToolRegistry};
use relayloop_core::config::{AgentConfig, AgentMode, ToolsConfig};

pub const DEFAULT_DELEGATION_TIMEOUT_SECS: f64 = 180.0;

/// Raised by a tool (or surfaced from one) when the task description a child
/// was given is unusable on its face — not an infrastructure fault, so it is
/// never treated as retryable.
#[derive(Debug)]
pub struct InvalidTaskError(pub String);

impl std::fmt::Display for InvalidTaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid task: {}", self.0)
    }
}

impl std::error::Error for InvalidTaskError {}

/// Collaborators a `sub_agent` tool needs to run a delegation. Bundled
/// separately from `Agent` itself so the tool can be constructed before its
/// owning parent `Agent` exists.
pub struct DelegationDeps {
    pub session_manager: Arc<SessionManager>,
    pub storage: Arc<dyn Storage>,
    pub event_bus: Arc<EventBus>,
    pub provider: Arc<dyn LlmProvider>,
    pub tools_config: ToolsConfig,
    pub parent_registry: ToolRegistry,
    pub model: String,
    /// Mirrors `Agent::child_sessions` on the owning parent; see its doc comment.
    pub child_sessions: Arc<AsyncMutex<Vec<String>>>,
}

/// Run one delegation end to end: create the child session, run a child
/// `Agent` to completion under `timeout_secs`, and render either a work
/// report or a `ChildFailure` wire string. Never propagates an error — every
/// outcome, including an internal setup failure, is folded into the
/// returned string so the parent's tool-result contract never breaks.
pub async fn delegate(deps: &DelegationDeps, parent_ctx: &ToolContext, task: &str, timeout_secs: f64) -> String {
    let parent_session = parent_ctx.session_key.clone();

    let child_id = match deps
        .session_manager
        .create_child_session(&parent_session, &deps.model, task, None)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            return ChildFailure {
                category: FailureCategory::ToolError,
                message: format!("could not create child session: {}", e),
                session_id: String::new(),
                duration: Duration::ZERO,
                completed_steps: Vec::new(),
                files_modified: Vec::new(),
                blocked_on: None,
                suggested_retry: true,
                suggested_actions: vec!["retry the delegation".to_string()],
                tool_usage: Default::default(),
                last_successful_tool: None,
            }
            .to_wire_string();
        }
    };

    deps.child_sessions.lock().await.push(child_id.clone());
    log_parent_event(deps, &parent_session, "delegation_start", &child_id).await;

    let child_registry = deps.parent_registry.filter_by_mode(AgentMode::Child);
    let mut child_memory = ConversationMemory::new(100_000, None);
    child_memory.set_system_prompt(CHILD_SYSTEM_PROMPT);

    let child_config = AgentConfig {
        model: deps.model.clone(),
        max_turns: 70,
        timeout_secs: 300.0,
        stream: true,
        mode: AgentMode::Child,
    };

    let child_tool_ctx = ToolContext {
        workspace_dir: parent_ctx.workspace_dir.clone(),
        agent_name: parent_ctx.agent_name.clone(),
        session_key: child_id.clone(),
        sandbox: parent_ctx.sandbox.clone(),
    };

    // The child shares the parent's provider handle (and thus its
    // credentials) verbatim rather than re-authenticating — it never holds
    // its own copy of an API key.
    let child = Arc::new(Agent::new(
        child_config,
        child_memory,
        child_registry,
        deps.provider.clone(),
        Arc::new(PermissionGate::new(deps.tools_config.clone())),
        Arc::new(AutoApprove),
        deps.event_bus.clone(),
        Some(deps.storage.clone()),
        child_tool_ctx,
        child_id.clone(),
        Some(parent_session.clone()),
        Arc::new(AsyncMutex::new(Vec::new())),
    ));

    let mut progress_rx = deps.event_bus.subscribe(&child_id);
    let progress_child_id = child_id.clone();
    let progress_task = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            debug!(child_session_id = %progress_child_id, kind = %event.kind, "child progress");
            if event.kind == "agent_done" {
                break;
            }
        }
    });

    let start = Instant::now();
    let run_outcome = tokio::time::timeout(Duration::from_secs_f64(timeout_secs.max(1.0)), {
        let child = child.clone();
        let task = task.to_string();
        async move { child.run(&task).await }
    })
    .await;
    progress_task.abort();
    let duration = start.elapsed();

    let log = child.execution_log_snapshot().await.unwrap_or_default();
    deps.child_sessions.lock().await.retain(|id| id != &child_id);

    match run_outcome {
        Ok(Ok(final_text)) => {
            log_parent_event(deps, &parent_session, "delegation_complete", &child_id).await;
            render_work_report(&child_id, &final_text, duration, &log)
        }
        Ok(Err(e)) => {
            let (category, retryable) = categorize_failure(&e);
            let failure = build_child_failure(&child_id, category, retryable, e.to_string(), duration, &log, None);
            log_parent_event(deps, &parent_session, "delegation_error", &child_id).await;
            failure.to_wire_string()
        }
        Err(_) => {
            let retryable = log.tool_executions.iter().any(|t| t.success);
            let failure = build_child_failure(
                &child_id,
                FailureCategory::Timeout,
                retryable,
                format!("child did not finish within {:.1}s", timeout_secs),
                duration,
                &log,
                Some(format!("retry with timeout={:.1}s or greater", timeout_secs * 2.0)),
            );
            log_parent_event(deps, &parent_session, "delegation_timeout", &child_id).await;
            failure.to_wire_string()
        }
    }
}

const CHILD_SYSTEM_PROMPT: &str = "You are a focused child agent working on a single delegated task. \
Complete it directly and return a clear final answer. You cannot delegate further and have no todo list \
of your own — just do the work and report back.";

async fn log_parent_event(deps: &DelegationDeps, parent_session: &str, kind: &str, child_id: &str) {
    deps.event_bus.publish(SessionEvent::new(parent_session, kind, child_id));
    let record = SessionEventRecord {
        session_id: parent_session.to_string(),
        event_type: kind.to_string(),
        tool_name: Some("sub_agent".to_string()),
        agent_state: None,
        message: None,
        metadata: serde_json::json!({ "child_session_id": child_id }),
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
    };
    if let Err(e) = deps.storage.log_session_event(&record).await {
        debug!(parent_session, error = %e, "failed to persist delegation event");
    }
}

fn build_child_failure(
    child_id: &str,
    category: FailureCategory,
    retryable: bool,
    message: String,
    duration: Duration,
    log: &ExecutionLog,
    extra_action: Option<String>,
) -> ChildFailure {
    let mut completed_steps = Vec::new();
    if !log.files_written.is_empty() {
        completed_steps.push(format!("Created {} files", log.files_written.len()));
    }
    if !log.files_edited.is_empty() {
        completed_steps.push(format!("Modified {} files", log.files_edited.len()));
    }

    let mut suggested_actions = extra_action.into_iter().collect::<Vec<_>>();
    suggested_actions.extend(suggested_actions_for(category));

    ChildFailure {
        category,
        message,
        session_id: child_id.to_string(),
        duration,
        completed_steps,
        files_modified: log.files_modified().into_iter().collect(),
        blocked_on: log.errors.last().map(|(tool, msg)| format!("{}: {}", tool, msg)),
        suggested_retry: retryable,
        suggested_actions,
        tool_usage: log.tool_usage_summary(),
        last_successful_tool: log.tool_executions.iter().rev().find(|t| t.success).map(|t| t.tool_name.clone()),
    }
}

fn suggested_actions_for(category: FailureCategory) -> Vec<String> {
    match category {
        FailureCategory::Timeout => vec![],
        FailureCategory::MissingContext => vec!["provide the missing file or value in the task description".to_string()],
        FailureCategory::ToolError => vec!["check tool permissions and retry".to_string()],
        FailureCategory::InvalidTask => vec!["rewrite the task with a concrete, well-scoped goal".to_string()],
        FailureCategory::Partial => vec!["resume from the last completed step".to_string()],
    }
}

/// Classify a child's terminal error. Typed errors are checked first
/// (`std::io::Error` and `InvalidTaskError`), then the message is scanned for
/// a fixed set of substrings in order; anything else falls back to a
/// retryable `tool_error`.
fn categorize_failure(err: &anyhow::Error) -> (FailureCategory, bool) {
    if err.chain().any(|c| c.downcast_ref::<std::io::Error>().is_some()) {
        return (FailureCategory::ToolError, true);
    }
    if err.chain().any(|c| c.downcast_ref::<InvalidTaskError>().is_some()) {
        return (FailureCategory::InvalidTask, false);
    }

    let message = err.to_string().to_lowercase();
    if message.contains("authentication") || message.contains("api_key") {
        return (FailureCategory::ToolError, false);
    }
    if message.contains("permission denied") {
        return (FailureCategory::ToolError, false);
    }
    if message.contains("not found") {
        return (FailureCategory::MissingContext, true);
    }
    if message.contains("invalid") {
        return (FailureCategory::InvalidTask, false);
    }
    (FailureCategory::ToolError, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_io_permission_denied_is_retryable_tool_error() {
        let err = anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"));
        let (category, retryable) = categorize_failure(&err);
        assert_eq!(category, FailureCategory::ToolError);
        assert!(retryable);
    }

    #[test]
    fn test_categorize_invalid_task_error_not_retryable() {
        let err = anyhow::Error::new(InvalidTaskError("no goal given".to_string()));
        let (category, retryable) = categorize_failure(&err);
        assert_eq!(category, FailureCategory::InvalidTask);
        assert!(!retryable);
    }

    #[test]
    fn test_categorize_message_substrings_in_order() {
        let auth = anyhow::anyhow!("authentication failed against upstream");
        assert_eq!(categorize_failure(&auth).0, FailureCategory::ToolError);
        assert!(!categorize_failure(&auth).1);

        let missing = anyhow::anyhow!("file /tmp/x not found on disk");
        assert_eq!(categorize_failure(&missing).0, FailureCategory::MissingContext);
        assert!(categorize_failure(&missing).1);

        let invalid = anyhow::anyhow!("invalid task description");
        assert_eq!(categorize_failure(&invalid).0, FailureCategory::InvalidTask);
    }

    #[test]
    fn test_categorize_unmatched_falls_back_to_retryable_tool_error() {
        let err = anyhow::anyhow!("something odd happened");
        let (category, retryable) = categorize_failure(&err);
        assert_eq!(category, FailureCategory::ToolError);
        assert!(retryable);
    }

    #[test]
    fn test_suggested_actions_timeout_is_caller_supplied_only() {
        assert!(suggested_actions_for(FailureCategory::Timeout).is_empty());
    }
}
