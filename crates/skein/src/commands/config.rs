//! Config command - configuration management.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use serde_json::json;
use skein_config::{ServerEntry, SkeinConfig, USER_CONFIG_FILE};

use super::{Context, parse_pair};

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Show the user config file path
    Path,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./skein.toml) instead of user config
        #[arg(long)]
        local: bool,
    },

    /// Add a server entry to the user config
    AddServer(AddServerArgs),

    /// Remove a server entry from the user config
    RemoveServer {
        /// Name of the server entry
        name: String,
    },
}

/// Arguments for `skein config add-server`.
#[derive(Args, Debug)]
pub struct AddServerArgs {
    /// Unique name for this server
    pub name: String,

    /// Command to spawn (stdio) or URL (with --http)
    pub target: String,

    /// Use HTTP transport instead of stdio
    #[arg(long)]
    pub http: bool,

    /// Environment variable in KEY=VALUE format (stdio only)
    #[arg(long = "env", short = 'e')]
    pub env_vars: Vec<String>,

    /// HTTP header in KEY=VALUE format (http only)
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Bearer token (http only)
    #[arg(long)]
    pub token: Option<String>,

    /// Request timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Add the entry disabled
    #[arg(long)]
    pub disabled: bool,

    /// Arguments to pass to the command (stdio only)
    #[arg(last = true)]
    pub args: Vec<String>,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Path => cmd_path(ctx),
        ConfigCommand::Init { local } => cmd_init(ctx, local),
        ConfigCommand::AddServer(add) => cmd_add_server(ctx, add),
        ConfigCommand::RemoveServer { name } => cmd_remove_server(ctx, &name),
    }
}

/// Copy of `config` with secrets replaced.
fn redacted(config: &SkeinConfig) -> SkeinConfig {
    let mut config = config.clone();
    for entry in &mut config.servers {
        if entry.bearer_token.is_some() {
            entry.bearer_token = Some("****".to_string());
        }
    }
    config
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.loaded;
    let config = redacted(&loaded.config);

    if ctx.json_output {
        let output = json!({
            "sources": loaded.loaded_from(),
            "warnings": loaded.warnings,
            "config": config,
            "effective": {
                "server": config.server_or_default(),
                "client": config.client_or_default(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("# Skein Configuration\n");
    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("# No config files loaded (using defaults)");
    } else {
        for source in &sources {
            println!("# from {}", source.display());
        }
    }
    for warning in &loaded.warnings {
        println!("# warning: {}", warning);
    }
    println!();

    let effective = SkeinConfig {
        server: Some(config.server_or_default()),
        client: Some(config.client_or_default()),
        servers: config.servers.clone(),
    };
    print!("{}", effective.to_toml()?);
    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    let loaded = &ctx.loaded;
    println!("Config file search order (later overrides earlier):\n");

    for source in &loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} {}", status, source.path.display());
    }

    println!();
    let loaded_count = loaded.loaded_from().len();
    if loaded_count == 0 {
        println!("No config files found. Run 'skein config init' to create one.");
    } else {
        println!("{} config file(s) loaded.", loaded_count);
    }
    Ok(())
}

fn user_config_file(ctx: &Context) -> Result<PathBuf> {
    ctx.config_dir
        .as_ref()
        .map(|dir| dir.join(USER_CONFIG_FILE))
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

fn cmd_path(ctx: &Context) -> Result<()> {
    println!("{}", user_config_file(ctx)?.display());
    Ok(())
}

const TEMPLATE: &str = r#"# Skein Configuration

# HTTP gateway (`skein serve`)
[server]
bind = "127.0.0.1:8099"
path = "/mcp"
healthz_path = "/healthz"

# Base environment for every served session
# [server.env]
# REGION = "eu"

# How skein introduces itself to servers
[client]
name = "skein"
request_timeout_secs = 30

# Servers to connect to. Their tools are re-exported as <name>__<tool>.
# [[servers]]
# name = "files"
# command = "mcp-server-filesystem"
# args = ["/home/user/projects"]
#
# [[servers]]
# name = "remote"
# transport = "http"
# url = "https://mcp.example.com/mcp"
# bearer_token = "..."
"#;

fn cmd_init(ctx: &Context, local: bool) -> Result<()> {
    let path = if local {
        PathBuf::from(skein_config::PROJECT_CONFIG_FILE)
    } else {
        user_config_file(ctx)?
    };

    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, TEMPLATE)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    Ok(())
}

/// Load only the user config file, so edits never copy project-local entries.
fn load_user_file(path: &Path) -> Result<SkeinConfig> {
    if path.is_file() {
        Ok(skein_config::load_config_file(path)?)
    } else {
        Ok(SkeinConfig::new())
    }
}

/// Build the entry described by `args`.
pub fn entry_from_args(args: &AddServerArgs) -> Result<ServerEntry> {
    let mut entry = if args.http {
        let mut entry = ServerEntry::http(&args.name, &args.target);
        for header in &args.headers {
            let (key, value) = parse_pair(header, "header")?;
            entry = entry.with_header(key, value);
        }
        if let Some(token) = &args.token {
            entry = entry.with_bearer_token(token.clone());
        }
        entry
    } else {
        let mut entry = ServerEntry::stdio(&args.name, &args.target);
        entry.args = args.args.clone();
        for var in &args.env_vars {
            let (key, value) = parse_pair(var, "environment variable")?;
            entry = entry.with_env(key, value);
        }
        entry
    };
    entry.timeout_secs = args.timeout;
    entry = entry.with_enabled(!args.disabled);
    entry.validate()?;
    Ok(entry)
}

fn cmd_add_server(ctx: &Context, args: AddServerArgs) -> Result<()> {
    let path = user_config_file(ctx)?;
    let mut config = load_user_file(&path)?;

    if config.server_entry(&args.name).is_ok() {
        anyhow::bail!(
            "Server '{}' already exists. Use 'skein config remove-server {}' first.",
            args.name,
            args.name
        );
    }

    let entry = entry_from_args(&args)?;
    config.servers.push(entry);
    skein_config::save_config(&config, &path)?;

    if ctx.json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": "added",
                "name": args.name,
                "config_path": path.display().to_string(),
            }))?
        );
    } else {
        println!("Added server '{}' to {}", args.name, path.display());
    }
    Ok(())
}

fn cmd_remove_server(ctx: &Context, name: &str) -> Result<()> {
    let path = user_config_file(ctx)?;
    let mut config = load_user_file(&path)?;

    let before = config.servers.len();
    config.servers.retain(|e| e.name != name);
    if config.servers.len() == before {
        anyhow::bail!("Server '{}' not found in {}", name, path.display());
    }
    skein_config::save_config(&config, &path)?;

    if ctx.json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": "removed",
                "name": name,
                "config_path": path.display().to_string(),
            }))?
        );
    } else {
        println!("Removed server '{}' from {}", name, path.display());
    }
    Ok(())
}
