//! Error types for MCP operations.

use thiserror::Error;

use crate::message::RpcError;

/// Result type for MCP operations.
pub type Result<T> = std::result::Result<T, McpError>;

/// Prefix the credential layer puts on errors raised by a token source
/// whose refresh token is no longer accepted.
pub const STALE_CREDENTIAL_PREFIX: &str = "oauth2:";

/// Error type for MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Failed to spawn the MCP server process.
    #[error("failed to spawn MCP server: {0}")]
    SpawnFailed(String),

    /// Failed to communicate with the peer.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer answered with an `error` member.
    #[error("error from server: {0}")]
    Rpc(#[from] RpcError),

    /// Tool execution failed.
    #[error("tool error: {0}")]
    ToolError(String),

    /// A request was attempted before the handshake.
    #[error("cannot send {method} because client is not initialized")]
    NotInitialized {
        /// Method that was refused.
        method: String,
    },

    /// The server demands credentials.
    #[error("authentication required: {challenge}")]
    AuthRequired {
        /// `resource_metadata` URL advertised in the challenge, if any.
        resource_metadata: Option<String>,
        /// Raw `WWW-Authenticate` header value.
        challenge: String,
    },

    /// The server no longer knows our session.
    #[error("session {session_id} not found")]
    SessionNotFound {
        /// Session id the server rejected.
        session_id: String,
    },

    /// Credentials held by the transport can no longer be refreshed.
    #[error("stale credential: {0}")]
    StaleCredential(String),

    /// No response is expected for this message.
    #[error("no response")]
    NoResponse,

    /// No reader is attached to the session's outbound stream.
    #[error("no reader")]
    NoReader,

    /// The waiter was released without a reply.
    #[error("no result in response")]
    NoResult,

    /// An attribute was read as a type it does not hold.
    #[error("attribute {key} does not hold a {expected}")]
    AttributeType {
        /// Attribute name.
        key: String,
        /// Requested type.
        expected: &'static str,
    },

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The caller gave up.
    #[error("operation cancelled")]
    Cancelled,

    /// Timeout waiting for response.
    #[error("timeout waiting for response")]
    Timeout,
}

impl McpError {
    /// Create a spawn failed error.
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a tool error.
    pub fn tool_error(msg: impl Into<String>) -> Self {
        Self::ToolError(msg.into())
    }

    /// Create a not-initialized error for `method`.
    pub fn not_initialized(method: impl Into<String>) -> Self {
        Self::NotInitialized {
            method: method.into(),
        }
    }

    /// Check if this is an authentication challenge.
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Self::AuthRequired { .. })
    }

    /// Check if the server forgot our session.
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound { .. })
    }

    /// Check if this error, or anything in its source chain, carries the
    /// stale-credential marker.
    pub fn is_stale_credential(&self) -> bool {
        if matches!(self, Self::StaleCredential(_)) {
            return true;
        }
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = current {
            if err.to_string().starts_with(STALE_CREDENTIAL_PREFIX) {
                return true;
            }
            current = err.source();
        }
        false
    }

    /// Convert into the RPC error sent back to a peer.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::Rpc(err) => err.clone(),
            Self::Json(err) => RpcError::invalid_params(err.to_string()),
            Self::NoReader => RpcError::method_not_found("no handler"),
            other => RpcError::internal(other.to_string()),
        }
    }
}
