use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use relayloop_core::{config, paths};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration (defaults + file + env overrides)
    Show,
    /// Print the config file path
    Path,
}

pub fn run(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => show_config(),
        ConfigAction::Path => {
            println!("{}", paths::config_path().display());
            Ok(())
        }
    }
}

fn show_config() -> Result<()> {
    let path = paths::config_path();
    let cfg = config::load_config(&path)?;

    println!("{}", "Relayloop Configuration".bold());
    println!("{}", "─".repeat(40).dimmed());
    println!(
        "  {} {}",
        "Config file:".dimmed(),
        if path.exists() { path.display().to_string() } else { format!("{} (not found, using defaults)", path.display()) }
    );

    println!("\n{}", "Agent".bold());
    println!("  {} {}", "Model:".dimmed(), if cfg.agent.model.is_empty() { "(unset)" } else { &cfg.agent.model });
    println!("  {} {}", "Max turns:".dimmed(), cfg.agent.max_turns);
    println!("  {} {:.0}s", "Timeout:".dimmed(), cfg.agent.timeout_secs);
    println!("  {} {}", "Streaming:".dimmed(), cfg.agent.stream);

    println!("\n{}", "Memory".bold());
    println!("  {} {}", "Max tokens:".dimmed(), cfg.memory.max_tokens);
    println!(
        "  {} {}",
        "Max messages:".dimmed(),
        cfg.memory.max_messages.map(|n| n.to_string()).unwrap_or_else(|| "unbounded".to_string())
    );

    if !cfg.tools.0.is_empty() {
        println!("\n{}", "Tool policies".bold());
        for (name, tool_cfg) in &cfg.tools.0 {
            println!("  {} {:?}", format!("{}:", name).dimmed(), tool_cfg.permission);
        }
    }

    Ok(())
}
