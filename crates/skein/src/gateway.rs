//! The tool server `skein serve` and `skein stdio` expose.
//!
//! Two built-in tools are always present. Every enabled `[[servers]]` entry
//! that connects contributes its tools under `<server>__<tool>`, forwarded
//! through a shared client.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use skein_config::SkeinConfig;
use skein_mcp::protocol::{CallToolResult, ServerInfo, ToolInfo};
use skein_mcp::{FnTool, McpClient, McpManager, MessageHandler, ServerTool, Session, ToolServer};

use crate::commands::{client_options, entry_to_config};

/// Joins an upstream server name and its tool name.
pub const PROXY_SEPARATOR: &str = "__";

/// Forwards calls to a tool on an upstream server.
struct ProxyTool {
    info: ToolInfo,
    remote_name: String,
    client: Arc<McpClient>,
}

#[async_trait]
impl ServerTool for ProxyTool {
    fn info(&self) -> ToolInfo {
        self.info.clone()
    }

    async fn call(&self, _session: &Session, arguments: Value) -> skein_mcp::Result<CallToolResult> {
        self.client
            .call_tool(&self.remote_name, Some(arguments), None)
            .await
    }
}

pub struct Gateway {
    tools: Arc<ToolServer>,
    manager: McpManager,
}

impl Gateway {
    /// Build the gateway. With `upstream`, connect every enabled server entry
    /// and register its tools; entries that fail to connect are skipped.
    pub async fn build(config: &SkeinConfig, upstream: bool) -> Result<Self> {
        let mut tools = builtin_tools();
        let client = config.client_or_default();
        let mut manager = McpManager::new().with_client_options(client_options(&client));

        if upstream {
            for entry in config.enabled_servers() {
                match entry.validate() {
                    Ok(()) => manager.add_server(entry_to_config(entry, &client)),
                    Err(e) => tracing::warn!(server = %entry.name, error = %e, "skipping server"),
                }
            }
            manager.connect_all().await;

            for (server, info) in manager.all_tools().await {
                let Some(client) = manager.get_client(&server) else {
                    continue;
                };
                let name = format!("{}{}{}", server, PROXY_SEPARATOR, info.name);
                tracing::debug!(tool = %name, "registering proxied tool");
                tools.register(Arc::new(ProxyTool {
                    remote_name: info.name.clone(),
                    info: ToolInfo { name, ..info },
                    client,
                }));
            }
        }

        tracing::info!(
            tool_count = tools.len(),
            upstream_count = manager.connected_count(),
            "gateway ready"
        );
        Ok(Self {
            tools: Arc::new(tools),
            manager,
        })
    }

    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.tools.clone()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.list().into_iter().map(|t| t.name).collect()
    }

    /// Disconnect every upstream server.
    pub async fn shutdown(mut self) {
        self.manager.shutdown_all().await;
    }
}

fn builtin_tools() -> ToolServer {
    ToolServer::new(ServerInfo::new("skein", env!("CARGO_PKG_VERSION")))
        .with_instructions("Skein gateway. Upstream tools are named <server>__<tool>.")
        .with_tool(FnTool::new(
            ToolInfo::new("echo")
                .with_description("Echo back the message")
                .with_input_schema(serde_json::json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                })),
            |_, args: Value| async move {
                Ok(CallToolResult::text(
                    args["message"].as_str().unwrap_or_default(),
                ))
            },
        ))
        .with_tool(FnTool::new(
            ToolInfo::new("env")
                .with_description("Read a value from the calling session's environment")
                .with_input_schema(serde_json::json!({
                    "type": "object",
                    "properties": {"key": {"type": "string"}},
                    "required": ["key"]
                })),
            |session: Session, args: Value| async move {
                let key = args["key"].as_str().unwrap_or_default();
                Ok(match session.env().get(key) {
                    Some(value) => CallToolResult::text(value.clone()),
                    None => CallToolResult::error(format!("{} is not set", key)),
                })
            },
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_config::ServerEntry;
    use skein_mcp::{Message, ServerSession, SessionOptions, methods};

    #[tokio::test]
    async fn test_builtin_tools_only() {
        let gateway = Gateway::build(&SkeinConfig::default(), true).await.unwrap();
        assert_eq!(gateway.tool_names(), vec!["echo", "env"]);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_skipped() {
        let config = SkeinConfig {
            servers: vec![
                ServerEntry::stdio("missing", "/nonexistent/skein-upstream"),
                ServerEntry::http("broken", ""),
            ],
            ..Default::default()
        };
        let gateway = Gateway::build(&config, true).await.unwrap();
        assert_eq!(gateway.tool_names(), vec!["echo", "env"]);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_env_tool_reads_session_env() {
        let gateway = Gateway::build(&SkeinConfig::default(), false).await.unwrap();
        let session = ServerSession::new(gateway.handler(), SessionOptions::default())
            .await
            .unwrap();
        session.session().merge_env([("REGION", "eu")]).unwrap();

        let mut call = Message::request(
            methods::TOOLS_CALL,
            &serde_json::json!({"name": "env", "arguments": {"key": "REGION"}}),
        )
        .unwrap();
        call.id = Some(skein_mcp::RequestId::from(1));
        let reply = session.exchange(call).await.unwrap();
        let result: CallToolResult = serde_json::from_value(reply.result.unwrap()).unwrap();
        assert_eq!(result.joined_text(), "eu");

        let mut call = Message::request(
            methods::TOOLS_CALL,
            &serde_json::json!({"name": "env", "arguments": {"key": "MISSING"}}),
        )
        .unwrap();
        call.id = Some(skein_mcp::RequestId::from(2));
        let reply = session.exchange(call).await.unwrap();
        let result: CallToolResult = serde_json::from_value(reply.result.unwrap()).unwrap();
        assert!(result.is_error);

        session.close().await;
    }
}
