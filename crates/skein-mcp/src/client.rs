//! MCP client for communicating with MCP servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::Authenticator;
use crate::error::{McpError, Result};
use crate::handler::{ClientDispatcher, ClientHandler, DefaultClientHandler};
use crate::http_wire::{HttpWire, HttpWireConfig};
use crate::message::{Message, methods};
use crate::protocol::{
    CallToolParams, CallToolResult, ClientInfo, GetPromptParams, GetPromptResult,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    MCP_PROTOCOL_VERSION, PromptInfo, ReadResourceParams, ReadResourceResult, ResourceInfo,
    ServerInfo, ToolInfo,
};
use crate::session::{ExchangeOptions, Session, SessionOptions, SessionState};
use crate::stdio::StdioWire;
use crate::wire::Wire;

/// Transport type for MCP server connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TransportType {
    /// Stdio transport - spawns a child process.
    #[default]
    Stdio,
    /// Streamable HTTP transport.
    Http,
}

/// Configuration for an MCP server connection.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Unique name for this server.
    pub name: String,
    /// Transport type.
    pub transport: TransportType,
    /// Command to spawn (for stdio transport).
    pub command: String,
    /// URL for the server (for HTTP transport).
    pub url: Option<String>,
    /// Arguments to pass to the command.
    pub args: Vec<String>,
    /// Environment variables to set.
    pub env: Vec<(String, String)>,
    /// HTTP headers (for HTTP transport).
    pub headers: Vec<(String, String)>,
    /// Bearer token (for HTTP transport).
    pub bearer_token: Option<String>,
    /// Per-request timeout.
    pub timeout: Option<Duration>,
}

impl McpServerConfig {
    /// Create a new server config for stdio transport.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportType::Stdio,
            command: command.into(),
            url: None,
            args: Vec::new(),
            env: Vec::new(),
            headers: Vec::new(),
            bearer_token: None,
            timeout: None,
        }
    }

    /// Create a new server config for HTTP transport.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportType::Http,
            url: Some(url.into()),
            ..Self::new(name, "")
        }
    }

    /// Add arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Add an HTTP header (for HTTP transport).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Set request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Check if this is an HTTP transport config.
    pub fn is_http(&self) -> bool {
        self.transport == TransportType::Http
    }

    /// Check if this is a stdio transport config.
    pub fn is_stdio(&self) -> bool {
        self.transport == TransportType::Stdio
    }

    fn http_wire_config(&self) -> Result<HttpWireConfig> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| McpError::transport("HTTP transport requires a URL"))?;
        let mut config = HttpWireConfig::new(url);
        for (key, value) in &self.headers {
            config = config.with_header(key, value);
        }
        if let Some(token) = &self.bearer_token {
            config = config.with_bearer_token(token);
        }
        if let Some(timeout) = self.timeout {
            config = config.with_request_timeout(timeout);
        }
        Ok(config)
    }
}

/// Everything besides the server config that shapes a client.
#[derive(Clone)]
pub struct ClientOptions {
    /// Answers server-initiated requests.
    pub handler: Arc<dyn ClientHandler>,
    /// Consulted when an HTTP server demands credentials.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub client_info: ClientInfo,
    pub protocol_version: String,
    /// Session to inherit attributes from.
    pub parent: Option<Session>,
    /// Resume a previous session instead of starting fresh.
    pub state: Option<SessionState>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            handler: Arc::new(DefaultClientHandler),
            authenticator: None,
            client_info: ClientInfo::default(),
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            parent: None,
            state: None,
        }
    }
}

impl ClientOptions {
    pub fn with_handler(mut self, handler: Arc<dyn ClientHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_client_info(mut self, info: ClientInfo) -> Self {
        self.client_info = info;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_parent(mut self, parent: Session) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = Some(state);
        self
    }
}

/// An MCP client connected to a single MCP server.
pub struct McpClient {
    name: String,
    session: Session,
    options: ClientOptions,
    timeout: Option<Duration>,
}

impl McpClient {
    /// Connect to an MCP server using the configured transport.
    ///
    /// This does NOT initialize the connection - call `initialize()` after connecting.
    pub async fn connect(config: McpServerConfig) -> Result<Self> {
        Self::connect_with(config, ClientOptions::default()).await
    }

    /// [`connect`](Self::connect) with a handler, authenticator or resumed state.
    pub async fn connect_with(config: McpServerConfig, options: ClientOptions) -> Result<Self> {
        let wire: Arc<dyn Wire> = match config.transport {
            TransportType::Stdio => {
                let wire = StdioWire::spawn(&config.name, &config.command, &config.args, &config.env)?;
                tracing::info!(
                    server = %config.name,
                    command = %config.command,
                    "connected to MCP server via stdio"
                );
                Arc::new(wire)
            }
            TransportType::Http => {
                let mut wire = HttpWire::new(&config.name, config.http_wire_config()?)?;
                if let Some(authenticator) = &options.authenticator {
                    wire = wire.with_authenticator(authenticator.clone());
                }
                tracing::info!(
                    server = %config.name,
                    url = %wire.url(),
                    "connected to MCP server via HTTP"
                );
                Arc::new(wire)
            }
        };
        Self::with_wire(&config.name, wire, options, config.timeout).await
    }

    /// Run a client over an existing wire.
    pub async fn with_wire(
        name: &str,
        wire: Arc<dyn Wire>,
        options: ClientOptions,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut session_options = SessionOptions::default().with_name(name);
        session_options.parent = options.parent.clone();
        session_options.state = options.state.clone();

        let dispatcher = Arc::new(ClientDispatcher::new(options.handler.clone()));
        let session = Session::start(wire, dispatcher, session_options).await?;
        Ok(Self {
            name: name.to_string(),
            session,
            options,
            timeout,
        })
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Get the server info (after initialization).
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.session.initialize_result().map(|r| r.server_info)
    }

    /// Check if the client has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.session.initialize_result().is_some()
    }

    fn exchange_options(&self) -> ExchangeOptions {
        let mut options = ExchangeOptions::default();
        options.timeout = self.timeout;
        options
    }

    async fn request<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.session
            .exchange_with(method, params, self.exchange_options())
            .await
    }

    /// Initialize the connection with the MCP server.
    ///
    /// This performs the MCP handshake, exchanging capabilities and protocol versions.
    /// Must be called before using other methods.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        if let Some(result) = self.session.initialize_result() {
            return Ok(result);
        }

        let params = InitializeParams {
            protocol_version: self.options.protocol_version.clone(),
            capabilities: self.options.handler.capabilities(),
            client_info: self.options.client_info.clone(),
        };
        let init_result: InitializeResult = self.request(methods::INITIALIZE, &params).await?;

        tracing::info!(
            server = %init_result.server_info.name,
            version = %init_result.server_info.version,
            protocol = %init_result.protocol_version,
            "MCP server initialized"
        );

        self.session
            .send(Message::notification(methods::INITIALIZED, &Value::Null)?)
            .await?;
        Ok(init_result)
    }

    pub async fn ping(&self) -> Result<()> {
        let _: Value = self.request(methods::PING, &Value::Null).await?;
        Ok(())
    }

    /// List available tools from the server.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let list_result: ListToolsResult = self.request(methods::TOOLS_LIST, &Value::Null).await?;

        tracing::debug!(
            server = %self.name,
            tool_count = list_result.tools.len(),
            "listed MCP tools"
        );

        Ok(list_result.tools)
    }

    /// Call a tool on the server.
    ///
    /// # Arguments
    /// * `name` - The name of the tool to call
    /// * `arguments` - The arguments to pass to the tool
    /// * `progress_token` - Token the server may report progress under
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        progress_token: Option<Value>,
    ) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let mut options = self.exchange_options();
        options.progress_token = progress_token;

        let call_result: CallToolResult = self
            .session
            .exchange_with(methods::TOOLS_CALL, &params, options)
            .await?;

        if call_result.is_error {
            tracing::warn!(server = %self.name, tool = %name, "tool call returned error");
        } else {
            tracing::debug!(server = %self.name, tool = %name, "tool call succeeded");
        }

        Ok(call_result)
    }

    fn advertised<F>(&self, has: F) -> bool
    where
        F: FnOnce(&InitializeResult) -> bool,
    {
        self.session.initialize_result().as_ref().is_some_and(has)
    }

    /// Resources, or none when the server does not offer them.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>> {
        if !self.advertised(|r| r.capabilities.resources.is_some()) {
            return Ok(Vec::new());
        }
        let result: ListResourcesResult =
            self.request(methods::RESOURCES_LIST, &Value::Null).await?;
        Ok(result.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.request(methods::RESOURCES_READ, &params).await
    }

    /// Prompts, or none when the server does not offer them.
    pub async fn list_prompts(&self) -> Result<Vec<PromptInfo>> {
        if !self.advertised(|r| r.capabilities.prompts.is_some()) {
            return Ok(Vec::new());
        }
        let result: ListPromptsResult = self.request(methods::PROMPTS_LIST, &Value::Null).await?;
        Ok(result.prompts)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResult> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.request(methods::PROMPTS_GET, &params).await
    }

    /// Shutdown the connection, asking the server to forget the session.
    pub async fn shutdown(&self) {
        tracing::info!(server = %self.name, "shutting down MCP client");
        self.session.shutdown(true).await;
    }
}
