//! Streamable HTTP server for Skein MCP sessions.
//!
//! One endpoint multiplexes many [`ServerSession`](skein_mcp::ServerSession)s:
//!
//! - `POST` without a session id runs `initialize` and mints the id
//!   (returned in `Mcp-Session-Id`); with an id it exchanges one message,
//!   answering `202` when there is no reply.
//! - `GET` attaches the session's single outbound reader as an event stream.
//! - `DELETE` removes the session and closes it.
//!
//! A background ticker checks the pipeline end to end and backs a liveness
//! endpoint.
//!
//! # Example
//!
//! ```ignore
//! use skein_mcp::{ToolServer, protocol::ServerInfo};
//! use skein_server::{McpHttpServer, ServerConfig};
//!
//! let tools = ToolServer::new(ServerInfo::new("demo", "1.0"));
//! let config = ServerConfig::new().with_bind_address("127.0.0.1:8099".parse()?);
//!
//! let server = McpHttpServer::new(Arc::new(tools), config);
//! server.run().await?;
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod health;
pub mod routes;
pub mod state;
pub mod store;

pub use config::ServerConfig;
pub use env::{BEARER_TOKEN_KEY, extract_env};
pub use error::{Result, ServerError};
pub use health::{HealthMonitor, HealthStatus};
pub use state::AppState;
pub use store::{InMemorySessionStore, SessionStore};

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use skein_mcp::MessageHandler;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::info;

/// The Skein MCP HTTP server.
#[derive(Clone)]
pub struct McpHttpServer {
    /// Application state.
    state: AppState,
    cancel: CancellationToken,
    tasks: TaskTracker,
    ticker_started: Arc<AtomicBool>,
}

impl McpHttpServer {
    /// Create a server whose sessions are handled by `handler`.
    pub fn new(handler: Arc<dyn MessageHandler>, config: ServerConfig) -> Self {
        Self::from_state(AppState::new(handler, config))
    }

    /// Create a server from a pre-built application state.
    pub fn from_state(state: AppState) -> Self {
        Self {
            state,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            ticker_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        let config = &self.state.config;
        Router::new()
            .merge(routes::health_routes(&config.healthz_path))
            .merge(routes::mcp_routes(&config.path))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the health ticker. Later calls do nothing.
    pub fn start_health_checks(&self) {
        if self.ticker_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let config = &self.state.config;
        self.tasks.spawn(health::run_ticker(
            self.state.health.clone(),
            config.health_interval,
            config.health_startup_timeout,
            config.health_check_timeout,
            self.cancel.child_token(),
        ));
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        let addr = self.state.config.bind_address;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener (useful for testing).
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Internal(format!("Failed to read local address: {}", e)))?;
        info!(
            addr = %addr,
            path = %self.state.config.path,
            "Starting MCP server"
        );

        self.start_health_checks();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.cancel.clone().cancelled_owned())
            .await
            .map_err(|e| ServerError::Internal(format!("Server error: {}", e)))?;

        info!("MCP server stopped");
        Ok(())
    }

    /// Get the configured bind address.
    pub fn bind_address(&self) -> SocketAddr {
        self.state.config.bind_address
    }

    /// Stop serving, stop the ticker and close every stored session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();

        let store = &self.state.store;
        let ids = store.ids();
        info!(session_count = ids.len(), "closing MCP sessions");
        for id in ids {
            if let Some(session) = store.load_and_delete(&id) {
                session.close().await;
            }
        }
        self.tasks.wait().await;
    }
}
