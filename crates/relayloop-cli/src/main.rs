mod commands;

use clap::{Parser, Subcommand};

/// Relayloop — a coding-agent execution engine (Rust CLI)
#[derive(Parser)]
#[command(name = "relayloop", version, about = "Relayloop agent turn loop, driven from argv/stdin")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one agent turn with tools (read_file, write_file, edit_file, exec, todo, sub_agent)
    Agent {
        /// The message to send
        #[arg(short, long)]
        message: String,
        /// Agent name — selects which session store under ~/.relayloop/agents/<name> to use
        #[arg(long, default_value = "main")]
        agent: String,
        /// Model override
        #[arg(long)]
        model: Option<String>,
        /// API key override
        #[arg(long, env = "RELAYLOOP_API_KEY")]
        api_key: Option<String>,
        /// Base URL override
        #[arg(long)]
        base_url: Option<String>,
        /// Stream tokens as they arrive
        #[arg(long, default_value_t = false)]
        stream: bool,
        /// Continue the most recently updated session for this agent
        #[arg(long, default_value_t = false, alias = "continue")]
        continue_session: bool,
        /// Resume a specific session by id
        #[arg(long)]
        session: Option<String>,
    },
    /// List and inspect sessions
    Sessions {
        #[command(subcommand)]
        action: commands::sessions::SessionAction,
    },
    /// Show effective configuration
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Agent {
            message,
            agent,
            model,
            api_key,
            base_url,
            stream,
            continue_session,
            session,
        }) => {
            commands::agent::run(commands::agent::AgentOptions {
                message,
                agent,
                model,
                api_key,
                base_url,
                stream,
                continue_session,
                session,
            })
            .await
        }
        Some(Commands::Sessions { action }) => commands::sessions::run(action).await,
        Some(Commands::Config { action }) => commands::config::run(action),
        None => {
            println!("relayloop {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
