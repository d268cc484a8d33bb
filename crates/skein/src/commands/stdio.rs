//! `skein stdio`: expose the gateway over this process's stdin/stdout.

use anyhow::Result;
use clap::Args;
use skein_mcp::StdioServer;

use super::Context;
use crate::gateway::Gateway;

/// Arguments for `skein stdio`.
#[derive(Args, Debug)]
pub struct StdioArgs {
    /// Serve only the built-in tools, without connecting configured servers
    #[arg(long)]
    pub no_upstream: bool,
}

/// Run `skein stdio` until stdin closes.
pub async fn run(args: StdioArgs, ctx: &Context) -> Result<()> {
    let gateway = Gateway::build(&ctx.loaded.config, !args.no_upstream).await?;
    let server = StdioServer::from_process_stdio(gateway.handler()).await?;
    tracing::info!(tools = gateway.tool_names().len(), "serving gateway over stdio");

    server.run().await;
    gateway.shutdown().await;
    Ok(())
}
