use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use relayloop_agent::storage::{SqliteStorage, Storage};

#[derive(Subcommand)]
pub enum SessionAction {
    /// List sessions for an agent, most recently updated first
    List {
        /// Agent whose session store to read
        #[arg(short, long, default_value = "main")]
        agent: String,
        /// Maximum number of sessions to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

pub async fn run(action: SessionAction) -> Result<()> {
    match action {
        SessionAction::List { agent, limit } => list_sessions(&agent, limit).await,
    }
}

async fn list_sessions(agent: &str, limit: usize) -> Result<()> {
    let storage = SqliteStorage::open(agent)?;
    let sessions = storage.list_sessions(limit).await?;

    if sessions.is_empty() {
        println!("{}", format!("No sessions found for agent '{}'.", agent).dimmed());
        return Ok(());
    }

    println!("{} ({} session{})", agent.bold(), sessions.len(), if sessions.len() == 1 { "" } else { "s" });
    for record in sessions {
        let kind = match record.agent_mode {
            relayloop_core::config::AgentMode::Parent => "parent",
            relayloop_core::config::AgentMode::Child => "child",
        };
        println!(
            "  {} {}  {}  {}",
            "→".dimmed(),
            record.id,
            record.title.dimmed(),
            format!("[{} · {}]", record.model, kind).dimmed(),
        );
    }

    Ok(())
}
