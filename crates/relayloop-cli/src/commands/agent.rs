use std::io::Write as _;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use colored::Colorize;
use tokio::sync::Mutex as AsyncMutex;

use relayloop_agent::event_bus::EventBus;
use relayloop_agent::llm::OpenAiCompatibleProvider;
use relayloop_agent::memory::ConversationMemory;
use relayloop_agent::permission::{PermissionGate, PermissionPrompt};
use relayloop_agent::runtime::Agent;
use relayloop_agent::sandbox::SandboxPolicy;
use relayloop_agent::session_manager::SessionManager;
use relayloop_agent::storage::{SqliteStorage, Storage};
use relayloop_agent::subagent::DelegationDeps;
use relayloop_agent::tools::{sub_agent::SubAgentTool, ToolContext, ToolRegistry};
use relayloop_core::config::{load_config, AgentMode};
use relayloop_core::paths;

const PARENT_SYSTEM_PROMPT: &str = "You are a helpful coding agent. Use the available tools to read, \
write, and edit files and to run shell commands. Delegate a self-contained subtask to sub_agent when \
it benefits from focused, isolated reasoning. Keep a todo list for any multi-step task.";

pub struct AgentOptions {
    pub message: String,
    pub agent: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub stream: bool,
    pub continue_session: bool,
    pub session: Option<String>,
}

/// Prompts on stdin for tool calls the Permission Gate can't resolve on its
/// own — the real-world counterpart to `AutoApprove`/`AutoDeny` in tests.
struct StdinPrompt;

#[async_trait]
impl PermissionPrompt for StdinPrompt {
    async fn confirm(&self, tool_name: &str, args_summary: &str) -> bool {
        eprint!(
            "{} Allow {} with {}? [y/N] ",
            "?".yellow(),
            tool_name.bold(),
            args_summary.dimmed()
        );
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

pub async fn run(opts: AgentOptions) -> Result<()> {
    let t_start = Instant::now();

    let config = load_config(&paths::config_path())?;

    let base_url = opts
        .base_url
        .unwrap_or_else(|| config.base_url.clone());
    let api_key = opts
        .api_key
        .unwrap_or_else(|| config.api_key.clone());
    if api_key.is_empty() {
        anyhow::bail!("No API key configured. Pass --api-key or set RELAYLOOP_API_KEY.");
    }
    let model = opts
        .model
        .unwrap_or_else(|| {
            if config.agent.model.is_empty() {
                "gpt-4o-mini".to_string()
            } else {
                config.agent.model.clone()
            }
        });

    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::open(&opts.agent).with_context(|| format!("opening session store for agent '{}'", opts.agent))?,
    );

    let session_id = resolve_session_id(&storage, &opts).await?;

    let provider: Arc<dyn relayloop_agent::llm::LlmProvider> =
        Arc::new(OpenAiCompatibleProvider::new(&base_url, &api_key, &model));
    let event_bus = Arc::new(EventBus::new());
    let gate = Arc::new(PermissionGate::new(config.tools.clone()));
    let session_manager = Arc::new(SessionManager::new(storage.clone()));

    let mut registry = ToolRegistry::with_defaults();
    let child_sessions = Arc::new(AsyncMutex::new(Vec::new()));
    let delegation_deps = Arc::new(DelegationDeps {
        session_manager,
        storage: storage.clone(),
        event_bus: event_bus.clone(),
        provider: provider.clone(),
        tools_config: config.tools.clone(),
        parent_registry: ToolRegistry::with_defaults(),
        model: model.clone(),
        child_sessions: child_sessions.clone(),
    });
    registry.register(Arc::new(SubAgentTool::new(delegation_deps)));

    let mut agent_config = config.agent.clone();
    agent_config.model = model.clone();
    agent_config.stream = opts.stream;
    agent_config.mode = AgentMode::Parent;

    let mut memory = ConversationMemory::new(config.memory.max_tokens, config.memory.max_messages);
    memory.set_system_prompt(PARENT_SYSTEM_PROMPT);
    let existing = storage.load_session(&session_id).await?;
    if let Some(ref loaded) = existing {
        // add_batch trims once after the whole session is loaded, rather than
        // once per message — trimming message-by-message could drop an
        // assistant tool_calls message before its tool results were appended,
        // orphaning them ahead of a sweep that add_batch never triggers mid-load.
        memory.add_batch(loaded.messages.iter().cloned());
    }

    let tool_ctx = ToolContext {
        workspace_dir: std::env::current_dir()?.to_string_lossy().to_string(),
        agent_name: opts.agent.clone(),
        session_key: session_id.clone(),
        sandbox: SandboxPolicy::default(),
    };

    if existing.is_none() {
        storage
            .create_session(&session_id, &opts.message, &model, None, AgentMode::Parent)
            .await?;
    }

    let agent = Agent::new(
        agent_config,
        memory,
        registry,
        provider,
        gate,
        Arc::new(StdinPrompt),
        event_bus,
        Some(storage),
        tool_ctx,
        session_id.clone(),
        None,
        child_sessions,
    );

    eprintln!(
        "{} {} → {} {}",
        "●".green(),
        "Agent turn".bold(),
        model.cyan(),
        format!("({})", base_url).dimmed()
    );

    let response = agent.run(&opts.message).await?;
    println!("{}", response);

    eprintln!();
    eprintln!("{}", "─".repeat(50).dimmed());
    eprintln!(
        "  {} {:.0}ms  {} {}",
        "Time:".dimmed(),
        t_start.elapsed().as_millis(),
        "│".dimmed(),
        format!("session {}", session_id).dimmed(),
    );

    Ok(())
}

async fn resolve_session_id(storage: &Arc<dyn Storage>, opts: &AgentOptions) -> Result<String> {
    if let Some(ref session) = opts.session {
        return Ok(session.clone());
    }
    if opts.continue_session {
        let recent = storage.list_sessions(1).await?;
        if let Some(record) = recent.into_iter().next() {
            return Ok(record.id);
        }
    }
    Ok(format!("session-{}", uuid::Uuid::new_v4()))
}

