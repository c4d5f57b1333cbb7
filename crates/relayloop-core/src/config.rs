use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Whether a constructed agent runs as a root session or as a delegated child.
/// Children cannot themselves delegate or manage the todo list — see
/// `ToolRegistry::filter_by_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Parent,
    Child,
}

impl Default for AgentMode {
    fn default() -> Self {
        AgentMode::Parent
    }
}

/// Every knob the Agent Turn Loop reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub max_turns: usize,
    pub timeout_secs: f64,
    pub stream: bool,
    pub mode: AgentMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_turns: 70,
            timeout_secs: 300.0,
            stream: true,
            mode: AgentMode::Parent,
        }
    }
}

/// Token-window sizing, keyed off the model name for tokenizer selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_messages: Option<usize>,
    pub max_tokens: usize,
    pub model: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: None,
            max_tokens: 100_000,
            model: String::new(),
        }
    }
}

/// Permission disposition for a single tool, evaluated by the Permission Gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Always,
    Ask,
    Never,
}

impl Default for Permission {
    fn default() -> Self {
        Permission::Ask
    }
}

/// Per-tool security policy: a disposition plus pattern overrides that can
/// short-circuit an `ask` prompt in either direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSecurityConfig {
    pub permission: Permission,
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
}

/// Map of tool name -> security config. Tools absent from the map default to
/// `Permission::Always` (allow), per the Permission Gate's "no config = allow" rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolsConfig(pub HashMap<String, ToolSecurityConfig>);

impl ToolsConfig {
    pub fn get(&self, tool_name: &str) -> Option<&ToolSecurityConfig> {
        self.0.get(tool_name)
    }
}

/// Root configuration object, assembled by layering defaults, an optional
/// on-disk TOML file, then environment variables for secrets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayloopConfig {
    pub agent: AgentConfig,
    pub memory: MemoryConfig,
    pub tools: ToolsConfig,
    #[serde(skip)]
    pub api_key: String,
    #[serde(skip)]
    pub base_url: String,
}

/// Load configuration: compiled-in defaults, overridden by `path` if it
/// exists, overridden by environment variables for secrets.
///
/// File discovery beyond "does this exact path exist" and the browser-based
/// config UI are out of scope for the engine; this function only produces
/// the typed struct the rest of the crate consumes.
pub fn load_config(path: &Path) -> Result<RelayloopConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?
    } else {
        RelayloopConfig::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut RelayloopConfig) {
    if let Ok(key) = std::env::var("RELAYLOOP_API_KEY") {
        config.api_key = key;
    }
    if let Ok(url) = std::env::var("RELAYLOOP_BASE_URL") {
        config.base_url = url;
    }
    if let Ok(model) = std::env::var("RELAYLOOP_MODEL") {
        config.agent.model = model;
    }
}
