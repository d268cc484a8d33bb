//! Skein - MCP session gateway and client.
//!
//! Main entry point for the Skein CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod gateway;

use commands::{call, config, serve, stdio, tools};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Skein - MCP session gateway and client
#[derive(Parser)]
#[command(name = "skein")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// MCP endpoint used by `tools` and `call` when no other target is given
    #[arg(long, global = true, env = "SKEIN_SERVER_URL")]
    pub server: Option<String>,

    /// User config directory (default: platform config dir)
    #[arg(long, global = true, env = "SKEIN_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the gateway over streamable HTTP
    Serve(serve::ServeArgs),

    /// Serve the gateway over stdin/stdout
    Stdio(stdio::StdioArgs),

    /// List the tools of an MCP server
    Tools(tools::ToolsArgs),

    /// Call a tool on an MCP server
    Call(call::CallArgs),

    /// Show and edit configuration
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console output goes to stderr so `skein stdio` keeps stdout for protocol frames.
    let filter = if cli.verbose {
        "skein=debug,skein_mcp=debug,skein_server=debug,skein_config=debug,info"
    } else {
        "skein=info,skein_mcp=info,skein_server=info,warn"
    };

    let log_dir = cli
        .config_dir
        .as_ref()
        .map(|d| d.join("logs"))
        .or_else(skein_config::log_dir)
        .unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "skein.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "skein=trace,skein_mcp=trace,skein_server=trace,skein_config=trace,info",
                )),
        )
        .init();

    let loaded =
        skein_config::load_config_with_options(None, cli.config_dir.as_deref())?;

    let ctx = commands::Context {
        loaded,
        config_dir: cli.config_dir.or_else(skein_config::config_dir),
        server_url: cli.server,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Serve(args) => serve::run(args, &ctx).await,
        Commands::Stdio(args) => stdio::run(args, &ctx).await,
        Commands::Tools(args) => tools::run(args, &ctx).await,
        Commands::Call(args) => call::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}
