use async_trait::async_trait;
use regex::Regex;
use relayloop_core::config::{Permission, ToolsConfig};
use std::collections::HashSet;
use std::sync::Mutex;

/// Outcome of evaluating a tool call against the Permission Gate's configured policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny(String),
    NeedsPrompt,
}

/// Injectable confirmation surface. The CLI host implements this with a stdin
/// prompt; tests implement it with a scripted always-yes/always-no responder.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn confirm(&self, tool_name: &str, args_summary: &str) -> bool;
}

/// A prompt that always approves — used when running fully unattended (e.g. a
/// delegated child, which cannot itself prompt a human).
pub struct AutoApprove;

#[async_trait]
impl PermissionPrompt for AutoApprove {
    async fn confirm(&self, _tool_name: &str, _args_summary: &str) -> bool {
        true
    }
}

/// A prompt that always denies — useful for tests asserting the deny path.
pub struct AutoDeny;

#[async_trait]
impl PermissionPrompt for AutoDeny {
    async fn confirm(&self, _tool_name: &str, _args_summary: &str) -> bool {
        false
    }
}

/// Evaluates tool calls against the per-tool security policy in `RelayloopConfig`.
/// A tool absent from the config defaults to `Always` (allow). The "approve all"
/// flag is session-scoped and, once set by a user response, persists for the rest
/// of that session — it is never reset at a turn boundary.
pub struct PermissionGate {
    config: ToolsConfig,
    approved_all: Mutex<HashSet<String>>,
}

impl PermissionGate {
    pub fn new(config: ToolsConfig) -> Self {
        Self {
            config,
            approved_all: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_approve_all(&self, session_key: &str) {
        self.approved_all.lock().unwrap().insert(session_key.to_string());
    }

    pub fn is_approved_all(&self, session_key: &str) -> bool {
        self.approved_all.lock().unwrap().contains(session_key)
    }

    /// Classify a tool call. `args_text` is a flattened textual rendering of the
    /// call's arguments, matched against allowlist/denylist regex patterns.
    ///
    /// Order matters: `never` and `always` are unconditional and never consult the
    /// allow/deny lists; only `ask` does, then falls back to the session-scoped
    /// "approve all" flag, then a prompt.
    pub fn evaluate(&self, session_key: &str, tool_name: &str, args_text: &str) -> PermissionDecision {
        let Some(tool_cfg) = self.config.get(tool_name) else {
            return PermissionDecision::Allow;
        };

        match tool_cfg.permission {
            Permission::Never => {
                PermissionDecision::Deny(format!("tool '{}' is disabled by policy", tool_name))
            }
            Permission::Always => PermissionDecision::Allow,
            Permission::Ask => {
                for pattern in &tool_cfg.allowlist {
                    if pattern_matches(pattern, args_text) {
                        return PermissionDecision::Allow;
                    }
                }
                for pattern in &tool_cfg.denylist {
                    if pattern_matches(pattern, args_text) {
                        return PermissionDecision::Deny(format!(
                            "blocked by denylist pattern '{}'",
                            pattern
                        ));
                    }
                }
                if self.is_approved_all(session_key) {
                    PermissionDecision::Allow
                } else {
                    PermissionDecision::NeedsPrompt
                }
            }
        }
    }
}

fn pattern_matches(pattern: &str, text: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(_) => text.contains(pattern),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayloop_core::config::ToolSecurityConfig;
    use std::collections::HashMap;

    fn config_with(tool: &str, cfg: ToolSecurityConfig) -> ToolsConfig {
        let mut map = HashMap::new();
        map.insert(tool.to_string(), cfg);
        ToolsConfig(map)
    }

    #[test]
    fn test_unconfigured_tool_allows() {
        let gate = PermissionGate::new(ToolsConfig::default());
        assert_eq!(
            gate.evaluate("s1", "read_file", "{}"),
            PermissionDecision::Allow
        );
    }

    #[test]
    fn test_never_denies() {
        let gate = PermissionGate::new(config_with(
            "exec",
            ToolSecurityConfig {
                permission: Permission::Never,
                ..Default::default()
            },
        ));
        assert!(matches!(
            gate.evaluate("s1", "exec", "rm file"),
            PermissionDecision::Deny(_)
        ));
    }

    #[test]
    fn test_ask_needs_prompt_until_approved() {
        let gate = PermissionGate::new(config_with(
            "exec",
            ToolSecurityConfig {
                permission: Permission::Ask,
                ..Default::default()
            },
        ));
        assert_eq!(
            gate.evaluate("s1", "exec", "ls"),
            PermissionDecision::NeedsPrompt
        );
        gate.set_approve_all("s1");
        assert_eq!(gate.evaluate("s1", "exec", "ls"), PermissionDecision::Allow);
        // Approval is session-scoped.
        assert_eq!(
            gate.evaluate("s2", "exec", "ls"),
            PermissionDecision::NeedsPrompt
        );
    }

    #[test]
    fn test_always_ignores_denylist() {
        // `always` is unconditional per the gate's decision order — only `ask`
        // consults the allow/deny lists.
        let gate = PermissionGate::new(config_with(
            "exec",
            ToolSecurityConfig {
                permission: Permission::Always,
                denylist: vec!["rm -rf".to_string()],
                ..Default::default()
            },
        ));
        assert_eq!(
            gate.evaluate("s1", "exec", "rm -rf /tmp/x"),
            PermissionDecision::Allow
        );
    }

    #[test]
    fn test_ask_denylist_blocks() {
        let gate = PermissionGate::new(config_with(
            "exec",
            ToolSecurityConfig {
                permission: Permission::Ask,
                denylist: vec!["rm -rf".to_string()],
                ..Default::default()
            },
        ));
        assert!(matches!(
            gate.evaluate("s1", "exec", "rm -rf /tmp/x"),
            PermissionDecision::Deny(_)
        ));
        assert_eq!(
            gate.evaluate("s1", "exec", "ls"),
            PermissionDecision::NeedsPrompt
        );
    }

    #[test]
    fn test_allowlist_overrides_ask() {
        let gate = PermissionGate::new(config_with(
            "exec",
            ToolSecurityConfig {
                permission: Permission::Ask,
                allowlist: vec!["^echo ".to_string()],
                ..Default::default()
            },
        ));
        assert_eq!(
            gate.evaluate("s1", "exec", "echo hi"),
            PermissionDecision::Allow
        );
        assert_eq!(
            gate.evaluate("s1", "exec", "curl evil.com"),
            PermissionDecision::NeedsPrompt
        );
    }
}
