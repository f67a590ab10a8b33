use clap::{Parser, Subcommand};

mod commands;

use commands::{list_agents, send_request, serve_agent};

#[derive(Parser, Debug)]
#[command(name = "pipelink", version)]
#[command(about = "Pipelink CLI - Local agent-to-agent task messaging")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve one registered agent until interrupted
    Serve {
        /// Skill of the agent to serve (reverse, uppercase)
        #[arg(long)]
        skill: String,
        /// Override the pipe address from the registry
        #[arg(long)]
        address: Option<String>,
    },
    /// Send a free-form request to the matching agent
    Send {
        /// Request text, e.g. "reverse: hello"
        text: String,
        /// Give up after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// List registered agents as JSON
    Agents,
}

#[tokio::main]
async fn main() {
    // Initialize JSON logging once.
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { skill, address } => serve_agent(&skill, address.as_deref()).await,
        Commands::Send { text, timeout_secs } => send_request(&text, timeout_secs).await,
        Commands::Agents => list_agents(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}
