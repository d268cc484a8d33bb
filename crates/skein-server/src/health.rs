//! Background health checking.
//!
//! A ticker keeps one internal session against the server's own handler and
//! periodically lists its tools. The outcome backs the liveness endpoint.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use skein_mcp::protocol::{ClientCapabilities, ClientInfo, InitializeParams, ListToolsResult};
use skein_mcp::{
    MCP_PROTOCOL_VERSION, McpError, Message, MessageHandler, RequestId, ServerSession,
    SessionOptions, methods,
};
use tokio_util::sync::CancellationToken;

/// Id of the internal session's `initialize` request.
pub const HEALTHZ_INITIALIZE_ID: &str = "healthz-initialize";

/// Client name the internal session announces.
pub const HEALTHZ_CLIENT_NAME: &str = "skein-internal";

/// Outcome of the most recent health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// No check has finished yet.
    Pending,
    Healthy,
    /// Last check failed with this error text.
    Unhealthy(String),
}

/// Runs health checks and remembers the latest outcome.
pub struct HealthMonitor {
    handler: Arc<dyn MessageHandler>,
    status: RwLock<HealthStatus>,
    session: tokio::sync::Mutex<Option<ServerSession>>,
}

impl HealthMonitor {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handler,
            status: RwLock::new(HealthStatus::Pending),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status.read().clone()
    }

    /// List tools through the internal session. Returns the tool count.
    pub async fn check(&self) -> Result<usize, McpError> {
        let mut slot = self.session.lock().await;
        let session = match slot.as_ref() {
            Some(session) if !session.session().closed_token().is_cancelled() => session.clone(),
            _ => {
                let session = self.open_session().await?;
                *slot = Some(session.clone());
                session
            }
        };

        let mut list = Message::request(methods::TOOLS_LIST, &json!({}))?;
        list.id = Some(RequestId::random());
        let reply = session.exchange(list).await?;
        if let Some(error) = reply.error {
            return Err(McpError::Rpc(error));
        }
        let tools: ListToolsResult = serde_json::from_value(reply.result.unwrap_or_default())?;
        if tools.tools.is_empty() {
            return Err(McpError::protocol("no tools from server"));
        }
        Ok(tools.tools.len())
    }

    async fn open_session(&self) -> Result<ServerSession, McpError> {
        let session = ServerSession::new(
            self.handler.clone(),
            SessionOptions::default().with_name("healthz"),
        )
        .await?;

        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo::new(HEALTHZ_CLIENT_NAME, env!("CARGO_PKG_VERSION")),
        };
        let mut init = Message::request(methods::INITIALIZE, &params)?;
        init.id = Some(RequestId::from(HEALTHZ_INITIALIZE_ID));

        let reply = match session.exchange(init).await {
            Ok(reply) => reply,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        if let Some(error) = reply.error {
            session.close().await;
            return Err(McpError::Rpc(error));
        }
        match session
            .exchange(Message::notification(methods::INITIALIZED, &json!({}))?)
            .await
        {
            Ok(_) | Err(McpError::NoResponse) => {}
            Err(e) => tracing::debug!(error = %e, "initialized notification failed"),
        }
        Ok(session)
    }

    /// Run one check bounded by `timeout` and record the outcome.
    pub async fn run_check(&self, timeout: Duration) -> HealthStatus {
        let status = match tokio::time::timeout(timeout, self.check()).await {
            Ok(Ok(count)) => {
                tracing::debug!(tool_count = count, "health check passed");
                HealthStatus::Healthy
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "health check failed");
                self.reset().await;
                HealthStatus::Unhealthy(e.to_string())
            }
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "health check timed out");
                self.reset().await;
                HealthStatus::Unhealthy(format!("health check timed out after {:?}", timeout))
            }
        };
        *self.status.write() = status.clone();
        status
    }

    /// Drop the internal session so the next check starts fresh.
    pub async fn reset(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }
}

/// First check with `startup_timeout`, then one every `interval` with
/// `check_timeout`, until `cancel` fires.
pub async fn run_ticker(
    monitor: Arc<HealthMonitor>,
    interval: Duration,
    startup_timeout: Duration,
    check_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut timeout = startup_timeout;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = monitor.run_check(timeout) => {}
        }
        timeout = check_timeout;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    monitor.reset().await;
    tracing::debug!("health ticker stopped");
}
