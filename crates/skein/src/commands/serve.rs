//! `skein serve`: expose the gateway over streamable HTTP.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{Context as _, Result};
use clap::Args;
use skein_config::ServerSection;
use skein_server::{McpHttpServer, ServerConfig};
use tracing::info;

use super::Context;
use crate::gateway::Gateway;

/// Arguments for `skein serve`.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind to (overrides `[server].bind`)
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// MCP endpoint path (overrides `[server].path`)
    #[arg(long)]
    pub path: Option<String>,

    /// Serve only the built-in tools, without connecting configured servers
    #[arg(long)]
    pub no_upstream: bool,
}

/// Translate the `[server]` section plus flags into a server config.
pub fn server_config(section: &ServerSection, args: &ServeArgs) -> Result<ServerConfig> {
    let bind = match args.bind {
        Some(addr) => addr,
        None => section
            .bind
            .parse()
            .with_context(|| format!("invalid [server].bind '{}'", section.bind))?,
    };
    let env: HashMap<String, String> = section
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(ServerConfig::new()
        .with_bind_address(bind)
        .with_path(args.path.clone().unwrap_or_else(|| section.path.clone()))
        .with_healthz_path(section.healthz_path.clone())
        .with_health_interval(section.health_interval())
        .with_health_timeouts(section.health_startup_timeout(), section.health_check_timeout())
        .with_env(env))
}

/// Run `skein serve` until interrupted.
pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.loaded.config;
    let server_config = server_config(&config.server_or_default(), &args)?;
    let gateway = Gateway::build(config, !args.no_upstream).await?;

    let server = McpHttpServer::new(gateway.handler(), server_config);
    info!(
        addr = %server.bind_address(),
        tools = gateway.tool_names().len(),
        "serving gateway over HTTP"
    );

    let runner = server.clone();
    let mut handle = tokio::spawn(async move { runner.run().await });
    let outcome = tokio::select! {
        result = &mut handle => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            server.shutdown().await;
            handle.await
        }
    };
    gateway.shutdown().await;
    outcome??;
    Ok(())
}
