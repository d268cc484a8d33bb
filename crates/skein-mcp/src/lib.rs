//! MCP (Model Context Protocol) session and transport engine for Skein.
//!
//! One [`Session`] abstraction runs over any [`Wire`]: a child process's
//! pipes, a streamable HTTP endpoint, or an in-process server wire fed by an
//! HTTP handler. Both roles share the same correlation table, handshake
//! bookkeeping and attribute store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  McpClient / ToolServer / StdioServer                       │
//! │  - initialize, tools/list, tools/call, resources, prompts   │
//! │  - ClientHandler dispatch for server-initiated requests     │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Session                                                    │
//! │  - exchange / send / send_payload                           │
//! │  - PendingRequests (one per connection)                     │
//! │  - handshake snapshots, attributes with parent fallback     │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Wire                                                       │
//! │  - StdioWire: newline-delimited JSON                        │
//! │  - HttpWire: POST + event stream, resumable, re-auth        │
//! │  - ServerWire: in-process, one outbound reader at a time    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use skein_mcp::{McpClient, McpServerConfig};
//!
//! let config = McpServerConfig::http("remote", "http://localhost:8080/mcp");
//! let client = McpClient::connect(config).await?;
//! let init = client.initialize().await?;
//! println!("Connected to: {} v{}", init.server_info.name, init.server_info.version);
//!
//! for tool in client.list_tools().await? {
//!     println!("Tool: {} - {:?}", tool.name, tool.description);
//! }
//!
//! let result = client
//!     .call_tool("query", Some(json!({"sql": "SELECT 1"})), None)
//!     .await?;
//! println!("Result: {}", result.joined_text());
//! ```
//!
//! # Protocol flow
//!
//! 1. Client sends `initialize` with capabilities
//! 2. Server responds with its capabilities (and, over HTTP, `Mcp-Session-Id`)
//! 3. Client sends `notifications/initialized`
//! 4. Either side may now issue requests and notifications

pub mod auth;
pub mod client;
pub mod error;
pub mod handler;
pub mod http_wire;
pub mod manager;
pub mod message;
pub mod pending;
pub mod protocol;
pub mod server_session;
pub mod server_tools;
pub mod session;
pub mod stdio;
pub mod stdio_server;
pub mod wire;

pub use auth::{AuthChallenge, Authenticator, StaticBearer};
pub use client::{ClientOptions, McpClient, McpServerConfig, TransportType};
pub use error::{McpError, Result};
pub use handler::{ClientDispatcher, ClientHandler, DefaultClientHandler, InboundKind};
pub use http_wire::{HttpWire, HttpWireConfig, LAST_EVENT_ID_HEADER, SESSION_ID_HEADER};
pub use manager::McpManager;
pub use message::{Message, MessageKind, RequestId, RpcError, methods};
pub use pending::{Notified, PendingRequests, PendingSlot};
pub use protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsResult,
    MCP_PROTOCOL_VERSION, ProgressNotification, ServerCapabilities, ServerInfo, ToolContent,
    ToolInfo,
};
pub use server_session::{ReadingGuard, ServerSession, ServerWire};
pub use server_tools::{FnTool, ServerTool, ToolServer};
pub use session::{
    ENV_KEY, ExchangeOptions, MessageHandler, NoopHandler, Session, SessionOptions, SessionPhase,
    SessionState,
};
pub use stdio::StdioWire;
pub use stdio_server::StdioServer;
pub use wire::{Wire, WireHandler};
