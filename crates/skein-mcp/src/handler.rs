//! Client-side handling of server-initiated traffic.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{McpError, Result};
use crate::message::{Message, MessageKind, RpcError, methods};
use crate::protocol::{
    ClientCapabilities, CreateMessageParams, CreateMessageResult, ElicitParams, ElicitResult,
    ListRootsResult, LoggingMessage, ProgressNotification,
};
use crate::session::{MessageHandler, Session};

/// What an inbound message is, decided once from its shape and method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Sampling,
    Elicitation,
    ListRoots,
    Logging,
    Progress,
    /// Any other notification.
    Notification,
    /// Any other request.
    Request,
    /// A response nobody was waiting for.
    Response,
}

/// Methods with a dedicated handler.
const METHOD_KINDS: &[(&str, InboundKind)] = &[
    (methods::SAMPLING_CREATE_MESSAGE, InboundKind::Sampling),
    (methods::ELICITATION_CREATE, InboundKind::Elicitation),
    (methods::ROOTS_LIST, InboundKind::ListRoots),
    (methods::LOG_MESSAGE, InboundKind::Logging),
    (methods::PROGRESS, InboundKind::Progress),
];

impl InboundKind {
    pub fn of(msg: &Message) -> Self {
        match msg.kind() {
            MessageKind::Response | MessageKind::Invalid => return Self::Response,
            MessageKind::Request | MessageKind::Notification => {}
        }
        let method = msg.method_name();
        METHOD_KINDS
            .iter()
            .find(|(name, _)| *name == method)
            .map(|(_, kind)| *kind)
            .unwrap_or(if msg.expects_reply() {
                Self::Request
            } else {
                Self::Notification
            })
    }
}

/// Callbacks for requests and notifications a server sends to its client.
///
/// Every method has a default: requests are refused with method-not-found,
/// notifications are dropped.
#[async_trait]
pub trait ClientHandler: Send + Sync {
    /// Capabilities advertised in `initialize`. Only advertise what you handle.
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities::default()
    }

    async fn create_message(
        &self,
        _session: &Session,
        _params: CreateMessageParams,
    ) -> Result<CreateMessageResult> {
        Err(McpError::NoReader)
    }

    async fn elicit(&self, _session: &Session, _params: ElicitParams) -> Result<ElicitResult> {
        Err(McpError::NoReader)
    }

    async fn list_roots(&self, _session: &Session) -> Result<ListRootsResult> {
        Err(McpError::NoReader)
    }

    async fn on_log(&self, _session: &Session, message: LoggingMessage) {
        tracing::debug!(level = %message.level, logger = ?message.logger, data = %message.data, "server log");
    }

    async fn on_progress(&self, _session: &Session, _progress: ProgressNotification) {}

    async fn on_notification(&self, _session: &Session, _msg: Message) {}

    /// Requests with no dedicated callback.
    async fn on_request(&self, _session: &Session, msg: &Message) -> Result<Value> {
        Err(McpError::Rpc(RpcError::method_not_found(
            msg.method_name().to_string(),
        )))
    }

    async fn on_response(&self, _session: &Session, msg: Message) {
        tracing::debug!(id = ?msg.id, "dropping unsolicited response");
    }
}

/// Handler that takes every default.
pub struct DefaultClientHandler;

impl ClientHandler for DefaultClientHandler {}

/// Adapts a [`ClientHandler`] to the session's [`MessageHandler`].
pub struct ClientDispatcher {
    handler: Arc<dyn ClientHandler>,
}

impl ClientDispatcher {
    pub fn new(handler: Arc<dyn ClientHandler>) -> Self {
        Self { handler }
    }

    async fn respond<R: Serialize>(session: &Session, msg: &Message, result: Result<R>) {
        let sent = match result {
            Ok(value) => session.reply(msg, &value).await,
            Err(e) => {
                let error = match &e {
                    McpError::NoReader => RpcError::method_not_found(msg.method_name().to_string()),
                    other => other.to_rpc_error(),
                };
                session.reply_error(msg, error).await
            }
        };
        if let Err(e) = sent {
            tracing::warn!(method = %msg.method_name(), error = %e, "failed to reply to server request");
        }
    }

    /// Decode the params of `msg`, answering invalid-params when they do not fit.
    async fn params<T: serde::de::DeserializeOwned>(session: &Session, msg: &Message) -> Option<T> {
        match msg.params_as() {
            Ok(params) => Some(params),
            Err(e) => {
                if msg.expects_reply() {
                    Self::respond::<Value>(session, msg, Err(e)).await;
                } else {
                    tracing::debug!(method = %msg.method_name(), error = %e, "malformed notification");
                }
                None
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ClientDispatcher {
    async fn on_message(&self, session: &Session, msg: Message) {
        let handler = &self.handler;
        match InboundKind::of(&msg) {
            InboundKind::Sampling => {
                if let Some(params) = Self::params(session, &msg).await {
                    let result = handler.create_message(session, params).await;
                    Self::respond(session, &msg, result).await;
                }
            }
            InboundKind::Elicitation => {
                if let Some(params) = Self::params(session, &msg).await {
                    let result = handler.elicit(session, params).await;
                    Self::respond(session, &msg, result).await;
                }
            }
            InboundKind::ListRoots => {
                let result = handler.list_roots(session).await;
                Self::respond(session, &msg, result).await;
            }
            InboundKind::Logging => {
                if let Some(params) = Self::params(session, &msg).await {
                    handler.on_log(session, params).await;
                }
            }
            InboundKind::Progress => {
                if let Some(params) = Self::params(session, &msg).await {
                    handler.on_progress(session, params).await;
                }
            }
            InboundKind::Notification => handler.on_notification(session, msg).await,
            InboundKind::Request => {
                let result = handler.on_request(session, &msg).await;
                Self::respond(session, &msg, result).await;
            }
            InboundKind::Response => handler.on_response(session, msg).await,
        }
    }
}
