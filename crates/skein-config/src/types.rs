//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [server]                 # HTTP gateway settings
//! [server.env]             # base env for every served session
//! [client]                 # how skein introduces itself to servers
//! [[servers]]              # MCP servers to connect to
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Default bind address for `skein serve`.
pub const DEFAULT_BIND: &str = "127.0.0.1:8099";

/// Default MCP endpoint path.
pub const DEFAULT_PATH: &str = "/mcp";

/// Default liveness endpoint path.
pub const DEFAULT_HEALTHZ_PATH: &str = "/healthz";

/// Default client name announced in `initialize`.
pub const DEFAULT_CLIENT_NAME: &str = "skein";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// Sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeinConfig {
    /// HTTP gateway configuration.
    pub server: Option<ServerSection>,

    /// Client identity and timeouts.
    pub client: Option<ClientSection>,

    /// Configured MCP servers (`[[servers]]`).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerEntry>,
}

impl SkeinConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced whole. Server entries are matched by name: a
    /// later entry replaces an earlier one, new names are appended.
    pub fn merge(&mut self, other: SkeinConfig) {
        if other.server.is_some() {
            self.server = other.server;
        }

        if other.client.is_some() {
            self.client = other.client;
        }

        for entry in other.servers {
            match self.servers.iter_mut().find(|e| e.name == entry.name) {
                Some(existing) => *existing = entry,
                None => self.servers.push(entry),
            }
        }
    }

    /// The `[server]` section, or defaults.
    pub fn server_or_default(&self) -> ServerSection {
        self.server.clone().unwrap_or_default()
    }

    /// The `[client]` section, or defaults.
    pub fn client_or_default(&self) -> ClientSection {
        self.client.clone().unwrap_or_default()
    }

    /// Look up a server entry by name.
    pub fn server_entry(&self, name: &str) -> Result<&ServerEntry> {
        self.servers
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ConfigError::ServerNotFound(name.to_string()))
    }

    /// Entries with `enabled = true`, in file order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerEntry> {
        self.servers.iter().filter(|e| e.enabled)
    }

    /// Check every server entry and reject duplicate names.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.servers {
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "servers.name".to_string(),
                    message: format!("duplicate server name '{}'", entry.name),
                });
            }
            entry.validate()?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Section
// ─────────────────────────────────────────────────────────────────────────────

/// `[server]`: the HTTP gateway started by `skein serve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind to (`host:port`).
    pub bind: String,
    /// MCP endpoint path.
    pub path: String,
    /// Liveness endpoint path.
    pub healthz_path: String,
    /// Seconds between health checks.
    pub health_interval_secs: u64,
    /// Timeout of the first health check.
    pub health_startup_timeout_secs: u64,
    /// Timeout of every later health check.
    pub health_check_timeout_secs: u64,
    /// Base env applied to every served session.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            path: DEFAULT_PATH.to_string(),
            healthz_path: DEFAULT_HEALTHZ_PATH.to_string(),
            health_interval_secs: 60,
            health_startup_timeout_secs: 120,
            health_check_timeout_secs: 30,
            env: BTreeMap::new(),
        }
    }
}

impl ServerSection {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.health_startup_timeout_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client Section
// ─────────────────────────────────────────────────────────────────────────────

/// `[client]`: identity announced to servers and the default request timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Name sent as `clientInfo.name`.
    pub name: String,
    /// Protocol version to request. Unset means the library default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            name: DEFAULT_CLIENT_NAME.to_string(),
            protocol_version: None,
            request_timeout_secs: 30,
        }
    }
}

impl ClientSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Entries
// ─────────────────────────────────────────────────────────────────────────────

/// Transport used to reach a configured server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawn a child process and speak newline-delimited JSON over its pipes.
    #[default]
    Stdio,
    /// Streamable HTTP endpoint.
    Http,
}

/// One `[[servers]]` entry.
///
/// ```toml
/// [[servers]]
/// name = "files"
/// command = "mcp-server-filesystem"
/// args = ["/home/user/projects"]
/// env = { DEBUG = "1" }
///
/// [[servers]]
/// name = "remote"
/// transport = "http"
/// url = "https://mcp.example.com/mcp"
/// bearer_token = "..."
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    /// Unique name, also used to prefix proxied tools.
    pub name: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Command to spawn (stdio).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment for the child process (stdio).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Endpoint URL (http).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Static headers sent with every request (http).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Bearer token sent as `Authorization` (http).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    /// Overrides `[client].request_timeout_secs` for this server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerEntry {
    /// Create an entry that spawns `command`.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            url: None,
            headers: BTreeMap::new(),
            bearer_token: None,
            timeout_secs: None,
            enabled: true,
        }
    }

    /// Create an entry that connects to `url`.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            command: String::new(),
            url: Some(url.into()),
            ..Self::stdio(name, "")
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_http(&self) -> bool {
        self.transport == TransportKind::Http
    }

    /// Request timeout for this server, falling back to the client default.
    pub fn timeout(&self, client: &ClientSection) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| client.request_timeout())
    }

    /// Check that the fields the transport needs are present.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "name".to_string(),
                context: "[[servers]]".to_string(),
            });
        }
        let context = format!("server '{}'", self.name);
        match self.transport {
            TransportKind::Stdio if self.command.trim().is_empty() => {
                Err(ConfigError::MissingField {
                    field: "command".to_string(),
                    context,
                })
            }
            TransportKind::Http => match self.url.as_deref() {
                None | Some("") => Err(ConfigError::MissingField {
                    field: "url".to_string(),
                    context,
                }),
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    Err(ConfigError::InvalidValue {
                        field: format!("{}.url", self.name),
                        message: format!("'{}' is not an http(s) URL", url),
                    })
                }
                Some(_) => Ok(()),
            },
            TransportKind::Stdio => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
