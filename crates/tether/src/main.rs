//! Tether - serve or probe JSON-RPC protocol endpoints.
//!
//! This is the main entry point for the tether CLI.

mod commands;

use clap::{Parser, Subcommand};
use commands::TransportKind;
use std::path::PathBuf;
use tether_mcp::TetherConfig;
use tether_util::log::{self, LogConfig, LogLevel};

#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about = "Serve or probe JSON-RPC protocol endpoints", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (defaults to tether.jsonc in the current directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the echo endpoint
    Serve {
        /// Transport to listen on
        #[arg(short, long, value_enum, default_value = "stdio")]
        transport: TransportKind,
        /// Address to bind (ws, http)
        #[arg(short, long)]
        bind: Option<String>,
        /// Require this bearer token for tools/call
        #[arg(long)]
        token: Option<String>,
    },
    /// Connect to an endpoint and print the negotiated session
    Connect {
        /// Transport to connect with
        #[arg(short, long, value_enum, default_value = "stdio")]
        transport: TransportKind,
        /// Command line (stdio) or URL (ws, http)
        #[arg(long)]
        target: String,
        /// Bearer token sent with the connection
        #[arg(long)]
        token: Option<String>,
        /// Print the initialize result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TetherConfig::load_file(path).await?,
        None => {
            let cwd = std::env::current_dir()?;
            TetherConfig::load(Some(&cwd)).await?.0
        }
    };

    let level = LogLevel::parse(&config.log_level)
        .unwrap_or_default()
        .raised(cli.verbose);
    log::init(&LogConfig {
        level,
        file: cli.log_file.clone(),
        ..Default::default()
    })?;

    match cli.command {
        Commands::Serve {
            transport,
            bind,
            token,
        } => commands::serve::run(config, transport, bind, token).await,
        Commands::Connect {
            transport,
            target,
            token,
            json,
        } => commands::connect::run(config, transport, &target, token, json).await,
    }
}
