//! CLI command handlers.

pub mod call;
pub mod config;
pub mod serve;
pub mod stdio;
pub mod tools;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use skein_config::{ClientSection, LoadedConfig, ServerEntry};
use skein_mcp::protocol::ClientInfo;
use skein_mcp::{ClientOptions, McpClient, McpServerConfig};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration and where it came from.
    pub loaded: LoadedConfig,
    /// User config directory, if one could be determined.
    pub config_dir: Option<PathBuf>,
    /// Default MCP endpoint for client commands.
    pub server_url: Option<String>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    pub fn client_section(&self) -> ClientSection {
        self.loaded.config.client_or_default()
    }
}

/// Which server a client command talks to.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Name of a configured `[[servers]]` entry
    #[arg(long, short = 'n', conflicts_with_all = ["url", "command"])]
    pub name: Option<String>,

    /// Streamable HTTP endpoint
    #[arg(long, conflicts_with = "command")]
    pub url: Option<String>,

    /// Command to spawn as a stdio server
    #[arg(long)]
    pub command: Option<String>,

    /// HTTP header in KEY=VALUE format (with --url)
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Bearer token (with --url)
    #[arg(long)]
    pub token: Option<String>,

    /// Arguments for --command
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl TargetArgs {
    /// Resolve to a server config.
    ///
    /// Explicit flags win, then `--server`/`SKEIN_SERVER_URL`, then the only
    /// enabled configured server.
    pub fn resolve(&self, ctx: &Context) -> Result<McpServerConfig> {
        let client = ctx.client_section();
        let config = &ctx.loaded.config;

        if let Some(name) = &self.name {
            return Ok(entry_to_config(config.server_entry(name)?, &client));
        }
        if let Some(command) = &self.command {
            return Ok(McpServerConfig::new(command.clone(), command.clone())
                .with_args(self.args.clone())
                .with_timeout(client.request_timeout()));
        }
        if let Some(url) = self.url.as_ref().or(ctx.server_url.as_ref()) {
            let mut server = McpServerConfig::http(url.clone(), url.clone())
                .with_timeout(client.request_timeout());
            for header in &self.headers {
                let (key, value) = parse_pair(header, "header")?;
                server = server.with_header(key, value);
            }
            if let Some(token) = &self.token {
                server = server.with_bearer_token(token.clone());
            }
            return Ok(server);
        }

        let mut enabled = config.enabled_servers();
        match (enabled.next(), enabled.next()) {
            (Some(entry), None) => Ok(entry_to_config(entry, &client)),
            (None, _) => anyhow::bail!(
                "no server to talk to: pass --name, --url or --command, or set SKEIN_SERVER_URL"
            ),
            (Some(_), Some(_)) => anyhow::bail!(
                "several servers are configured: pick one with --name"
            ),
        }
    }
}

/// Build a client config from a `[[servers]]` entry.
pub fn entry_to_config(entry: &ServerEntry, client: &ClientSection) -> McpServerConfig {
    let config = if entry.is_http() {
        let mut config = McpServerConfig::http(&entry.name, entry.url.clone().unwrap_or_default());
        for (key, value) in &entry.headers {
            config = config.with_header(key.clone(), value.clone());
        }
        if let Some(token) = &entry.bearer_token {
            config = config.with_bearer_token(token.clone());
        }
        config
    } else {
        let mut config =
            McpServerConfig::new(&entry.name, &entry.command).with_args(entry.args.clone());
        for (key, value) in &entry.env {
            config = config.with_env_var(key.clone(), value.clone());
        }
        config
    };
    config.with_timeout(entry.timeout(client))
}

/// Client options carrying the configured identity.
pub fn client_options(client: &ClientSection) -> ClientOptions {
    let mut options = ClientOptions::default()
        .with_client_info(ClientInfo::new(client.name.clone(), env!("CARGO_PKG_VERSION")));
    if let Some(version) = &client.protocol_version {
        options = options.with_protocol_version(version.clone());
    }
    options
}

/// Connect and initialize a client for `target`.
pub async fn connect(target: &TargetArgs, ctx: &Context) -> Result<McpClient> {
    let server = target.resolve(ctx)?;
    let name = server.name.clone();
    let client = McpClient::connect_with(server, client_options(&ctx.client_section()))
        .await
        .with_context(|| format!("failed to connect to '{}'", name))?;
    if let Err(e) = client.initialize().await {
        client.shutdown().await;
        return Err(e).with_context(|| format!("failed to initialize '{}'", name));
    }
    Ok(client)
}

/// Split `KEY=VALUE`.
pub fn parse_pair(raw: &str, what: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => anyhow::bail!("Invalid {} format: '{}'. Use KEY=VALUE.", what, raw),
    }
}

/// Truncate a string for table output.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
