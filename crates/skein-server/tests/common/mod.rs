//! Common test utilities for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use serde_json::Value;
use skein_mcp::protocol::{CallToolResult, ListRootsResult, ServerInfo, ToolInfo};
use skein_mcp::{FnTool, MessageHandler, Session, ToolServer, methods};
use skein_server::{McpHttpServer, ServerConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// A test server that runs in the background.
pub struct TestServer {
    /// The server's address.
    pub addr: SocketAddr,
    /// Handle for inspecting state and shutting down.
    pub server: McpHttpServer,
    /// HTTP client for raw requests.
    pub client: Client,
    /// Handle to the server task.
    _handle: JoinHandle<()>,
}

impl TestServer {
    /// Start a server exposing [`demo_tools`].
    pub async fn start() -> Result<Self> {
        Self::start_with(Arc::new(demo_tools()), ServerConfig::default()).await
    }

    /// Start a server with a custom handler and configuration.
    pub async fn start_with(handler: Arc<dyn MessageHandler>, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = McpHttpServer::new(handler, config.with_bind_address(addr));
        let runner = server.clone();
        let handle = tokio::spawn(async move {
            let _ = runner.run_on(listener).await;
        });

        let client = Client::new();
        wait_for_server(&client, addr).await?;

        Ok(Self {
            addr,
            server,
            client,
            _handle: handle,
        })
    }

    /// Get the base URL for the server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// URL of the MCP endpoint.
    pub fn mcp_url(&self) -> String {
        format!("{}{}", self.base_url(), self.server.state().config.path)
    }

    /// Status of the liveness endpoint.
    pub async fn healthz(&self) -> Result<(u16, String)> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url(), self.server.state().config.healthz_path))
            .send()
            .await?;
        let status = resp.status().as_u16();
        Ok((status, resp.text().await?))
    }

    /// Wait until `check` holds, polling every 10 ms for up to 5 s.
    pub async fn wait_until(&self, check: impl Fn(&McpHttpServer) -> bool) -> Result<()> {
        timeout(Duration::from_secs(5), async {
            while !check(&self.server) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("condition not reached"))
    }
}

/// Tools served by the default test server.
pub fn demo_tools() -> ToolServer {
    ToolServer::new(ServerInfo::new("skein-test", "0.1.0"))
        .with_tool(FnTool::new(
            ToolInfo::new("echo").with_description("Echo back the message"),
            |_, args: Value| async move {
                Ok(CallToolResult::text(args["message"].as_str().unwrap_or_default()))
            },
        ))
        .with_tool(FnTool::new(
            ToolInfo::new("env").with_description("Read one session env entry"),
            |session: Session, args: Value| async move {
                let key = args["key"].as_str().unwrap_or_default();
                Ok(CallToolResult::text(session.env().get(key).cloned().unwrap_or_default()))
            },
        ))
        .with_tool(FnTool::new(
            ToolInfo::new("count_roots").with_description("Ask the client for its roots"),
            |session: Session, _| async move {
                let roots: ListRootsResult = session.exchange(methods::ROOTS_LIST, &serde_json::json!({})).await?;
                Ok(CallToolResult::text(format!("{} roots", roots.roots.len())))
            },
        ))
}

/// Wait for the server to accept connections.
async fn wait_for_server(client: &Client, addr: SocketAddr) -> Result<()> {
    let url = format!("http://{}/healthz", addr);

    let result = timeout(Duration::from_secs(5), async {
        loop {
            match client.get(&url).send().await {
                Ok(_) => return,
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(_) => anyhow::bail!("Timeout waiting for server to start"),
    }
}
