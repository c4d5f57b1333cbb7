use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::event_bus::{EventBus, SessionEvent};
use crate::execution_log::ExecutionLog;
use crate::llm::{Message, ToolCall};
use crate::permission::{PermissionDecision, PermissionGate, PermissionPrompt};
use crate::tools::{ToolContext, ToolRegistry};

/// Sum-type view of how a single call resolved, kept around long enough to
/// decide event kind and ExecutionLog bookkeeping uniformly regardless of
/// which path (parse failure, denial, prompt, auto) produced it.
enum ToolOutcome {
    Ok(String),
    Denied(String),
}

impl ToolOutcome {
    fn into_content(self) -> String {
        match self {
            ToolOutcome::Ok(s) => s,
            ToolOutcome::Denied(reason) => format!("Error: Tool execution denied: {}", reason),
        }
    }
}

/// Gates, dispatches, and logs a batch of tool calls from one assistant
/// message. Needs-prompt calls run sequentially (deterministic prompt
/// order); auto-resolved calls run concurrently.
pub struct ToolExecutor {
    gate: Arc<PermissionGate>,
    prompt: Arc<dyn PermissionPrompt>,
    event_bus: Arc<EventBus>,
}

impl ToolExecutor {
    pub fn new(gate: Arc<PermissionGate>, prompt: Arc<dyn PermissionPrompt>, event_bus: Arc<EventBus>) -> Self {
        Self { gate, prompt, event_bus }
    }

    /// Execute every call in `calls` against `registry`, returning one Tool
    /// message per input call in the same order. `execution_log` is `None`
    /// for parent-mode agents — recording is then a no-op per §4.7.5.
    pub async fn execute(
        &self,
        session_key: &str,
        calls: &[ToolCall],
        registry: &ToolRegistry,
        tool_ctx: &ToolContext,
        execution_log: Option<&AsyncMutex<ExecutionLog>>,
    ) -> Vec<Message> {
        enum Slot {
            ParseError(String),
            Denied(String),
            NeedsPrompt(serde_json::Value),
            Auto(serde_json::Value),
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(calls.len());
        for call in calls {
            match serde_json::from_str::<serde_json::Value>(&call.function.arguments) {
                Err(e) => slots.push(Slot::ParseError(e.to_string())),
                Ok(args) => {
                    let args_text = canonical_args(&args);
                    match self.gate.evaluate(session_key, &call.function.name, &args_text) {
                        PermissionDecision::Allow => slots.push(Slot::Auto(args)),
                        PermissionDecision::NeedsPrompt => slots.push(Slot::NeedsPrompt(args)),
                        PermissionDecision::Deny(reason) => slots.push(Slot::Denied(reason)),
                    }
                }
            }
        }

        let mut outcomes: Vec<Option<ToolOutcome>> = slots.iter().map(|_| None).collect();

        // Parse errors and policy denials resolve immediately, no dispatch.
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Slot::ParseError(detail) => {
                    self.publish(session_key, "tool_error", &calls[i].function.name);
                    outcomes[i] = Some(ToolOutcome::Ok(format!(
                        "Error: Invalid JSON arguments: {}",
                        detail
                    )));
                }
                Slot::Denied(reason) => {
                    warn!(tool_name = %calls[i].function.name, reason, "tool call denied by permission gate");
                    self.publish(session_key, "tool_error", &calls[i].function.name);
                    outcomes[i] = Some(ToolOutcome::Denied(reason.clone()));
                }
                _ => {}
            }
        }

        // Needs-prompt calls run sequentially to preserve deterministic order.
        for (i, slot) in slots.iter().enumerate() {
            if let Slot::NeedsPrompt(args) = slot {
                let name = &calls[i].function.name;
                self.publish(session_key, "tool_start", name);
                let approved = self.prompt.confirm(name, &canonical_args(args)).await;
                if !approved {
                    self.publish(session_key, "tool_error", name);
                    outcomes[i] = Some(ToolOutcome::Denied("user declined".to_string()));
                    continue;
                }
                let (content, success, duration) =
                    self.dispatch(registry, name, args.clone(), tool_ctx).await;
                self.publish(session_key, if success { "tool_done" } else { "tool_error" }, name);
                if let Some(log) = execution_log {
                    log.lock().await.record(name, args, &content, success, duration, now_ms());
                }
                outcomes[i] = Some(ToolOutcome::Ok(content));
            }
        }

        // Auto-resolved calls run concurrently.
        let auto_futures = slots.iter().enumerate().filter_map(|(i, slot)| {
            if let Slot::Auto(args) = slot {
                let name = calls[i].function.name.clone();
                let args = args.clone();
                self.publish(session_key, "tool_start", &name);
                Some(async move {
                    let (content, success, duration) =
                        self.dispatch(registry, &name, args.clone(), tool_ctx).await;
                    (i, name, args, content, success, duration)
                })
            } else {
                None
            }
        });

        for (i, name, args, content, success, duration) in join_all(auto_futures).await {
            self.publish(session_key, if success { "tool_done" } else { "tool_error" }, &name);
            if let Some(log) = execution_log {
                log.lock().await.record(&name, &args, &content, success, duration, now_ms());
            }
            outcomes[i] = Some(ToolOutcome::Ok(content));
        }

        calls
            .iter()
            .zip(outcomes)
            .map(|(call, outcome)| {
                let content = outcome.expect("every slot resolves exactly once").into_content();
                Message::tool_result(&call.id, &content)
            })
            .collect()
    }

    async fn dispatch(
        &self,
        registry: &ToolRegistry,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> (String, bool, std::time::Duration) {
        let start = Instant::now();
        let result = registry.execute(name, args.clone(), ctx).await;
        let duration = start.elapsed();
        let success = !result.starts_with("Error:");
        debug!(
            tool_name = name,
            args_len = canonical_args(&args).len(),
            success,
            duration_ms = duration.as_millis() as u64,
            "tool dispatched"
        );
        if !success {
            warn!(tool_name = name, "tool returned a semantic failure");
        }
        (result, success, duration)
    }

    fn publish(&self, session_key: &str, kind: &str, tool_name: &str) {
        self.event_bus
            .publish(SessionEvent::new(session_key, kind, tool_name));
    }
}

fn canonical_args(args: &serde_json::Value) -> String {
    serde_json::to_string(args).unwrap_or_default()
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}
