//! AgentStack CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "agentstack")]
#[command(about = "Deploy agent runtimes as two linked stacks", long_about = None)]
struct Cli {
    /// Directory holding deployment state
    #[arg(long, global = true, env = "AGENTSTACK_STATE_DIR", default_value = ".agentstack")]
    state_dir: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an app configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "agentstack.kdl")]
        path: PathBuf,
    },
    /// Print the rendered stack templates
    Synth {
        #[arg(default_value = "agentstack.kdl")]
        path: PathBuf,
        /// Only render this stack
        #[arg(long)]
        stack: Option<String>,
    },
    /// Show the changes a deploy would make
    Plan {
        #[arg(default_value = "agentstack.kdl")]
        path: PathBuf,
    },
    /// Deploy stacks, producers first
    Deploy {
        #[arg(default_value = "agentstack.kdl")]
        path: PathBuf,
        /// Only deploy this stack
        #[arg(long)]
        stack: Option<String>,
    },
    /// Show outputs of deployed stacks
    Outputs {
        /// Only show this stack
        stack: Option<String>,
    },
    /// Destroy a deployed stack
    Destroy {
        /// Stack name
        stack: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Synth { path, stack } => {
            commands::synth(&path, stack.as_deref())?;
        }
        Commands::Plan { path } => {
            commands::deploy::plan(&path, &cli.state_dir).await?;
        }
        Commands::Deploy { path, stack } => {
            commands::deploy::deploy(&path, &cli.state_dir, stack.as_deref()).await?;
        }
        Commands::Outputs { stack } => {
            commands::deploy::outputs(&cli.state_dir, stack.as_deref())?;
        }
        Commands::Destroy { stack } => {
            commands::deploy::destroy(&cli.state_dir, &stack).await?;
        }
    }

    Ok(())
}
