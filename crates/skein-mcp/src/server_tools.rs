//! Server-side tool registry answering the MCP request set.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Value, json};

use crate::error::{McpError, Result};
use crate::message::{Message, RpcError, methods};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListChangedCapability,
    ListToolsResult, MCP_PROTOCOL_VERSION, ServerCapabilities, ServerInfo, ToolInfo,
};
use crate::session::{MessageHandler, Session};

/// A tool a [`ToolServer`] exposes.
#[async_trait]
pub trait ServerTool: Send + Sync {
    /// Description returned by `tools/list`.
    fn info(&self) -> ToolInfo;

    /// Run the tool. `session` is the caller's session, for progress and
    /// environment lookups.
    async fn call(&self, session: &Session, arguments: Value) -> Result<CallToolResult>;
}

type ToolFn = dyn Fn(Session, Value) -> BoxFuture<'static, Result<CallToolResult>> + Send + Sync;

/// A [`ServerTool`] backed by a closure.
pub struct FnTool {
    info: ToolInfo,
    func: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(info: ToolInfo, func: F) -> Self
    where
        F: Fn(Session, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult>> + Send + 'static,
    {
        Self {
            info,
            func: Box::new(move |session, args| Box::pin(func(session, args))),
        }
    }
}

#[async_trait]
impl ServerTool for FnTool {
    fn info(&self) -> ToolInfo {
        self.info.clone()
    }

    async fn call(&self, session: &Session, arguments: Value) -> Result<CallToolResult> {
        (self.func)(session.clone(), arguments).await
    }
}

/// [`MessageHandler`] serving a fixed set of tools.
pub struct ToolServer {
    info: ServerInfo,
    instructions: Option<String>,
    tools: BTreeMap<String, Arc<dyn ServerTool>>,
}

impl ToolServer {
    pub fn new(info: ServerInfo) -> Self {
        Self {
            info,
            instructions: None,
            tools: BTreeMap::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn with_tool(mut self, tool: impl ServerTool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    pub fn register(&mut self, tool: Arc<dyn ServerTool>) {
        let name = tool.info().name;
        self.tools.insert(name, tool);
    }

    /// Tool descriptions, sorted by name.
    pub fn list(&self) -> Vec<ToolInfo> {
        self.tools.values().map(|tool| tool.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn initialize(&self, msg: &Message) -> Result<InitializeResult> {
        let params: InitializeParams = msg.params_as()?;
        let protocol_version = if params.protocol_version.is_empty() {
            MCP_PROTOCOL_VERSION.to_string()
        } else {
            params.protocol_version
        };
        tracing::debug!(
            client = %params.client_info.name,
            protocol = %protocol_version,
            "client initializing"
        );
        Ok(InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities {
                tools: Some(ListChangedCapability::default()),
                ..Default::default()
            },
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        })
    }

    async fn call(&self, session: &Session, msg: &Message) -> Result<CallToolResult> {
        let params: CallToolParams = msg.params_as()?;
        let tool = self.tools.get(&params.name).ok_or_else(|| {
            McpError::Rpc(RpcError::invalid_params(format!("unknown tool {}", params.name)))
        })?;
        let arguments = params.arguments.unwrap_or_else(|| json!({}));

        match tool.call(session, arguments).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(tool = %params.name, error = %e, "tool failed");
                Ok(CallToolResult::error(e.to_string()))
            }
        }
    }

    async fn respond(&self, session: &Session, msg: &Message) -> Result<Value> {
        match msg.method_name() {
            methods::INITIALIZE => Ok(serde_json::to_value(self.initialize(msg)?)?),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(serde_json::to_value(ListToolsResult {
                tools: self.list(),
            })?),
            methods::TOOLS_CALL => Ok(serde_json::to_value(self.call(session, msg).await?)?),
            other => Err(McpError::Rpc(RpcError::method_not_found(other.to_string()))),
        }
    }
}

#[async_trait]
impl MessageHandler for ToolServer {
    async fn on_message(&self, session: &Session, msg: Message) {
        if !msg.expects_reply() {
            if !msg.method_name().starts_with(methods::NOTIFICATION_PREFIX) {
                tracing::debug!(method = %msg.method_name(), "ignoring message");
            }
            return;
        }

        let sent = match self.respond(session, &msg).await {
            Ok(result) => session.reply(&msg, &result).await,
            Err(e) => session.reply_error(&msg, e.to_rpc_error()).await,
        };
        if let Err(e) = sent {
            tracing::debug!(method = %msg.method_name(), error = %e, "failed to send reply");
        }
    }
}
