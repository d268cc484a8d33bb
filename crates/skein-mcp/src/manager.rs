//! MCP Manager for multi-server lifecycle management.
//!
//! The [`McpManager`] keeps a set of named server configurations, connects
//! and initializes them, aggregates their tools, and shuts them down together.
//!
//! # Example
//!
//! ```rust,ignore
//! use skein_mcp::{McpManager, McpServerConfig};
//!
//! let mut manager = McpManager::new();
//! manager.add_server(McpServerConfig::new("sqlite", "mcp-server-sqlite")
//!     .with_arg("--db")
//!     .with_arg("/path/to/db.sqlite"));
//!
//! manager.connect_all().await;
//! for (server, tool) in manager.all_tools().await {
//!     println!("{server}: {}", tool.name);
//! }
//! manager.shutdown_all().await;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::{ClientOptions, McpClient, McpServerConfig};
use crate::error::{McpError, Result};
use crate::protocol::ToolInfo;

/// Manager for multiple MCP server connections.
#[derive(Default)]
pub struct McpManager {
    /// Server configurations (before connection).
    configs: BTreeMap<String, McpServerConfig>,
    /// Connected and initialized clients.
    clients: BTreeMap<String, Arc<McpClient>>,
    options: ClientOptions,
}

impl McpManager {
    /// Create a new empty MCP manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager with the given server configurations.
    pub fn with_configs(configs: Vec<McpServerConfig>) -> Self {
        let mut manager = Self::new();
        for config in configs {
            manager.add_server(config);
        }
        manager
    }

    /// Options applied to every client this manager connects.
    pub fn with_client_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Add a server configuration, replacing one with the same name.
    pub fn add_server(&mut self, config: McpServerConfig) {
        tracing::debug!(server = %config.name, "adding MCP server configuration");
        self.configs.insert(config.name.clone(), config);
    }

    /// Get the names of all configured servers.
    pub fn server_names(&self) -> Vec<&str> {
        self.configs.keys().map(String::as_str).collect()
    }

    /// Check if a server is configured.
    pub fn has_server(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    /// Check if a server is connected.
    pub fn is_connected(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    /// Get a connected client by name.
    pub fn get_client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.get(name).cloned()
    }

    /// Connect and initialize every configured server not yet connected.
    ///
    /// Servers that fail to connect are logged and skipped. Returns the
    /// number of newly connected servers.
    pub async fn connect_all(&mut self) -> usize {
        let mut connected = 0;
        let pending: Vec<_> = self
            .configs
            .values()
            .filter(|config| !self.clients.contains_key(&config.name))
            .cloned()
            .collect();

        for config in pending {
            let name = config.name.clone();
            match self.connect_server(config).await {
                Ok(client) => {
                    self.clients.insert(name.clone(), Arc::new(client));
                    connected += 1;
                    tracing::info!(server = %name, "MCP server connected");
                }
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "failed to connect to MCP server");
                }
            }
        }

        tracing::info!(
            connected = connected,
            total = self.configs.len(),
            "MCP server connection complete"
        );
        connected
    }

    async fn connect_server(&self, config: McpServerConfig) -> Result<McpClient> {
        let client = McpClient::connect_with(config, self.options.clone()).await?;
        if let Err(e) = client.initialize().await {
            client.shutdown().await;
            return Err(e);
        }
        Ok(client)
    }

    /// Connect a single server by name. A connected server is left alone.
    pub async fn connect_server_by_name(&mut self, name: &str) -> Result<Arc<McpClient>> {
        if let Some(client) = self.clients.get(name) {
            return Ok(client.clone());
        }
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| McpError::protocol(format!("server '{}' not configured", name)))?
            .clone();

        let client = Arc::new(self.connect_server(config).await?);
        self.clients.insert(name.to_string(), client.clone());
        tracing::info!(server = %name, "MCP server connected");
        Ok(client)
    }

    /// Tools of every connected server as `(server, tool)` pairs.
    ///
    /// A server whose listing fails is logged and left out.
    pub async fn all_tools(&self) -> Vec<(String, ToolInfo)> {
        let mut flat = Vec::new();
        for (name, client) in &self.clients {
            match client.list_tools().await {
                Ok(tools) => {
                    tracing::debug!(server = %name, tool_count = tools.len(), "listed tools");
                    flat.extend(tools.into_iter().map(|tool| (name.clone(), tool)));
                }
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "failed to list tools");
                }
            }
        }
        flat
    }

    /// Shutdown all connected servers. Configurations are kept.
    pub async fn shutdown_all(&mut self) {
        tracing::info!(
            server_count = self.clients.len(),
            "shutting down all MCP servers"
        );
        for (_, client) in std::mem::take(&mut self.clients) {
            client.shutdown().await;
        }
    }

    /// Get the number of configured servers.
    pub fn config_count(&self) -> usize {
        self.configs.len()
    }

    /// Get the number of connected servers.
    pub fn connected_count(&self) -> usize {
        self.clients.len()
    }
}

impl std::fmt::Debug for McpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpManager")
            .field("configured", &self.configs.keys().collect::<Vec<_>>())
            .field("connected", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_manager_empty() {
        let manager = McpManager::new();
        assert_eq!(manager.config_count(), 0);
        assert_eq!(manager.connected_count(), 0);
    }

    #[test]
    fn test_with_configs() {
        let manager = McpManager::with_configs(vec![
            McpServerConfig::new("server1", "cmd1"),
            McpServerConfig::new("server2", "cmd2"),
        ]);
        assert_eq!(manager.config_count(), 2);
        assert!(manager.has_server("server1"));
        assert!(!manager.has_server("server3"));
        assert_eq!(manager.server_names(), vec!["server1", "server2"]);
    }

    #[tokio::test]
    async fn test_connect_all_invalid_command() {
        let mut manager = McpManager::new();
        manager.add_server(McpServerConfig::new("invalid", "nonexistent-command-12345"));

        assert_eq!(manager.connect_all().await, 0);
        assert!(!manager.is_connected("invalid"));
        assert!(manager.all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_unknown_name() {
        let mut manager = McpManager::new();
        assert!(manager.connect_server_by_name("ghost").await.is_err());
    }

    #[test]
    fn test_debug_format() {
        let mut manager = McpManager::new();
        manager.add_server(McpServerConfig::new("test", "cmd"));
        let debug = format!("{:?}", manager);
        assert!(debug.contains("McpManager"));
        assert!(debug.contains("test"));
    }
}
