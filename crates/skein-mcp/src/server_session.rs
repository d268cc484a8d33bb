//! Server side of a session, driven by an HTTP handler rather than a stream.
//!
//! [`ServerWire`] is the in-process wire: inbound traffic is pushed in by the
//! caller through [`ServerWire::exchange`], and outbound traffic is either the
//! reply to such an exchange or is queued for whichever reader has attached
//! through [`ServerWire::start_reading`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{McpError, Result};
use crate::message::{Message, MessageKind};
use crate::pending::{Notified, PendingRequests};
use crate::session::{MessageHandler, Session, SessionOptions, SessionState};
use crate::wire::{Wire, WireHandler};

/// Outbound messages buffered for a reader before senders block.
const OUTBOUND_BUFFER: usize = 32;

/// In-process wire backing a [`ServerSession`].
pub struct ServerWire {
    id: String,
    handler: Mutex<Option<WireHandler>>,
    /// Replies to inbound exchanges currently being handled.
    replies: PendingRequests,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    /// Present while a reader is attached.
    reader: Mutex<Option<CancellationToken>>,
    closed: CancellationToken,
    tasks: TaskTracker,
}

impl ServerWire {
    pub fn new(id: impl Into<String>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        Self {
            id: id.into(),
            handler: Mutex::new(None),
            replies: PendingRequests::new(),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            reader: Mutex::new(None),
            closed: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Push one inbound message through the session and return its reply.
    ///
    /// Returns [`McpError::NoResponse`] for notifications, for responses to
    /// server-initiated requests, and for requests the handler left unanswered.
    pub async fn exchange(&self, msg: Message) -> Result<Message> {
        if self.closed.is_cancelled() {
            return Err(McpError::ConnectionClosed);
        }
        let handler = self
            .handler
            .lock()
            .clone()
            .ok_or_else(|| McpError::transport("server wire not started"))?;

        let (Some(id), MessageKind::Request) = (msg.id.clone(), msg.kind()) else {
            handler(msg).await;
            return Err(McpError::NoResponse);
        };

        let mut slot = self.replies.wait_for(id);
        tokio::select! {
            _ = handler(msg) => {}
            _ = self.closed.cancelled() => return Err(McpError::ConnectionClosed),
        }
        slot.try_recv().ok_or(McpError::NoResponse)
    }

    /// Hand an inbound message to the session without waiting for it.
    pub fn dispatch(&self, msg: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(McpError::ConnectionClosed);
        }
        let handler = self
            .handler
            .lock()
            .clone()
            .ok_or_else(|| McpError::transport("server wire not started"))?;
        self.tasks.spawn(handler(msg));
        Ok(())
    }

    /// Attach the single outbound reader. `None` if one is already attached.
    pub fn start_reading(self: &Arc<Self>) -> Option<ReadingGuard> {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return None;
        }
        let token = self.closed.child_token();
        *reader = Some(token.clone());
        tracing::debug!(session_id = %self.id, "reader attached");
        Some(ReadingGuard {
            wire: Arc::clone(self),
            token,
        })
    }

    /// Whether a reader is currently attached.
    pub fn has_reader(&self) -> bool {
        self.reader.lock().is_some()
    }

    fn reader_token(&self) -> Option<CancellationToken> {
        self.reader.lock().clone()
    }

    fn stop_reading(&self, token: &CancellationToken) {
        token.cancel();
        let mut reader = self.reader.lock();
        if reader.as_ref().is_some_and(|current| current.is_cancelled()) {
            *reader = None;
        }
        tracing::debug!(session_id = %self.id, "reader detached");
    }
}

#[async_trait]
impl Wire for ServerWire {
    async fn start(&self, handler: WireHandler) -> Result<()> {
        let mut slot = self.handler.lock();
        if slot.is_some() {
            return Err(McpError::transport("server wire already started"));
        }
        *slot = Some(handler);
        Ok(())
    }

    async fn send(&self, msg: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(McpError::ConnectionClosed);
        }
        let msg = if msg.kind() == MessageKind::Response {
            match self.replies.notify(msg) {
                Notified::Delivered => return Ok(()),
                Notified::Unclaimed(msg) => msg,
            }
        } else {
            msg
        };

        let Some(reader) = self.reader_token() else {
            return Err(McpError::NoReader);
        };
        tokio::select! {
            sent = self.outbound_tx.send(msg) => sent.map_err(|_| McpError::ConnectionClosed),
            _ = reader.cancelled() => Err(McpError::NoReader),
        }
    }

    async fn close(&self, _delete_remote: bool) {
        self.closed.cancel();
        self.replies.close();
        self.tasks.close();
    }

    async fn wait(&self) {
        self.closed.cancelled().await;
    }

    fn session_id(&self) -> String {
        self.id.clone()
    }
}

/// Exclusive claim on a wire's outbound stream. Dropping it detaches the reader.
pub struct ReadingGuard {
    wire: Arc<ServerWire>,
    token: CancellationToken,
}

impl ReadingGuard {
    /// Next outbound message; `None` once the wire or this reader is closed.
    pub async fn next(&self) -> Option<Message> {
        let mut rx = tokio::select! {
            rx = self.wire.outbound_rx.lock() => rx,
            _ = self.token.cancelled() => return None,
        };
        tokio::select! {
            msg = rx.recv() => msg,
            _ = self.token.cancelled() => None,
        }
    }

    /// Token cancelled when this reader detaches or the wire closes.
    pub fn cancelled(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for ReadingGuard {
    fn drop(&mut self) {
        self.wire.stop_reading(&self.token);
    }
}

/// A [`Session`] bound to a [`ServerWire`], as kept by the HTTP multiplexer.
#[derive(Clone)]
pub struct ServerSession {
    wire: Arc<ServerWire>,
    session: Session,
}

impl ServerSession {
    /// Create a fresh session with a new random id.
    pub async fn new(handler: Arc<dyn MessageHandler>, options: SessionOptions) -> Result<Self> {
        let id = options
            .state
            .as_ref()
            .map(|state| state.id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let wire = Arc::new(ServerWire::new(id));
        let session = Session::start(wire.clone(), handler, options).await?;
        Ok(Self { wire, session })
    }

    /// Rebuild a session from persisted state, keeping its id and handshake.
    pub async fn restore(
        handler: Arc<dyn MessageHandler>,
        state: SessionState,
        options: SessionOptions,
    ) -> Result<Self> {
        Self::new(handler, options.with_state(state)).await
    }

    pub fn id(&self) -> String {
        self.wire.session_id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn wire(&self) -> &Arc<ServerWire> {
        &self.wire
    }

    /// Handle one inbound message and return the reply, if any.
    pub async fn exchange(&self, msg: Message) -> Result<Message> {
        let is_initialize = msg.is_initialize();
        if is_initialize {
            self.session.record_initialize_request(&msg)?;
        }
        let reply = self.wire.exchange(msg).await?;
        if is_initialize && reply.error.is_none() {
            self.session.record_initialize_result(&reply);
        }
        Ok(reply)
    }

    /// Hand an inbound message to the session one-way.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.wire.dispatch(msg)
    }

    /// Attach the outbound reader. `None` if another reader is attached.
    pub fn start_reading(&self) -> Option<ReadingGuard> {
        self.wire.start_reading()
    }

    pub async fn close(&self) {
        self.session.shutdown(false).await;
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id())
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::methods;
    use crate::session::{NoopHandler, SessionPhase};
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn on_message(&self, session: &Session, msg: Message) {
            match msg.method_name() {
                methods::INITIALIZE => {
                    let _ = session
                        .reply(
                            &msg,
                            &json!({
                                "protocolVersion": "2025-06-18",
                                "capabilities": {},
                                "serverInfo": {"name": "echo", "version": "1"}
                            }),
                        )
                        .await;
                }
                "echo" => {
                    let _ = session.reply(&msg, &msg.params).await;
                }
                _ => {}
            }
        }
    }

    async fn echo_session() -> ServerSession {
        ServerSession::new(Arc::new(Echo), SessionOptions::default())
            .await
            .unwrap()
    }

    fn request(id: i64, method: &str, params: serde_json::Value) -> Message {
        let mut msg = Message::request(method, &params).unwrap();
        msg.id = Some(id.into());
        msg
    }

    #[tokio::test]
    async fn test_exchange_returns_reply() {
        let session = echo_session().await;
        let reply = session
            .exchange(request(1, "echo", json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(reply.id, Some(1.into()));
        assert_eq!(reply.result, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_exchange_records_handshake() {
        let session = echo_session().await;
        assert_eq!(session.session().phase(), SessionPhase::Unestablished);
        session
            .exchange(request(
                1,
                methods::INITIALIZE,
                json!({"protocolVersion": "2025-06-18", "capabilities": {},
                       "clientInfo": {"name": "c", "version": "1"}}),
            ))
            .await
            .unwrap();
        assert_eq!(session.session().phase(), SessionPhase::Established);
        assert_eq!(
            session.session().initialize_request().unwrap().client_info.name,
            "c"
        );
    }

    #[tokio::test]
    async fn test_notification_yields_no_response() {
        let session = echo_session().await;
        let note = Message::notification(methods::INITIALIZED, &json!({})).unwrap();
        assert!(matches!(
            session.exchange(note).await,
            Err(McpError::NoResponse)
        ));
    }

    #[tokio::test]
    async fn test_unanswered_request_yields_no_response() {
        let session = echo_session().await;
        assert!(matches!(
            session.exchange(request(2, "silent", json!({}))).await,
            Err(McpError::NoResponse)
        ));
    }

    #[tokio::test]
    async fn test_send_without_reader_fails_fast() {
        let session = echo_session().await;
        let err = session
            .session()
            .send_payload(methods::LOG_MESSAGE, &json!({"level": "info", "data": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NoReader));
    }

    #[tokio::test]
    async fn test_reader_receives_server_initiated_messages() {
        let session = echo_session().await;
        let reader = session.start_reading().unwrap();
        assert!(session.start_reading().is_none());

        session
            .session()
            .send_payload(methods::LOG_MESSAGE, &json!({"level": "info", "data": "hi"}))
            .await
            .unwrap();
        let msg = reader.next().await.unwrap();
        assert_eq!(msg.method_name(), methods::LOG_MESSAGE);

        drop(reader);
        assert!(!session.wire().has_reader());
        assert!(session.start_reading().is_some());
    }

    #[tokio::test]
    async fn test_blocked_send_fails_when_reader_detaches() {
        let session = echo_session().await;
        let reader = session.start_reading().unwrap();
        for _ in 0..OUTBOUND_BUFFER {
            session
                .session()
                .send_payload("notifications/fill", &json!({}))
                .await
                .unwrap();
        }

        let sender = session.session().clone();
        let blocked = tokio::spawn(async move {
            sender.send_payload("notifications/fill", &json!({})).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(reader);

        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(McpError::NoReader)));
    }

    #[tokio::test]
    async fn test_server_initiated_exchange_resolved_by_posted_response() {
        let session = echo_session().await;
        let reader = session.start_reading().unwrap();

        let server = session.session().clone();
        let pending = tokio::spawn(async move {
            server
                .exchange::<_, serde_json::Value>(methods::ROOTS_LIST, &json!({}))
                .await
        });

        let outbound = reader.next().await.unwrap();
        assert_eq!(outbound.method_name(), methods::ROOTS_LIST);
        let response = Message::response(outbound.id.clone().unwrap(), json!({"roots": []}));
        assert!(matches!(
            session.exchange(response).await,
            Err(McpError::NoResponse)
        ));

        let result = pending.await.unwrap().unwrap();
        assert_eq!(result, json!({"roots": []}));
    }

    #[tokio::test]
    async fn test_restore_keeps_id_and_handshake() {
        let session = echo_session().await;
        session
            .exchange(request(
                1,
                methods::INITIALIZE,
                json!({"protocolVersion": "2025-06-18", "capabilities": {},
                       "clientInfo": {"name": "c", "version": "1"}}),
            ))
            .await
            .unwrap();
        let state = session.session().state();

        let restored =
            ServerSession::restore(Arc::new(NoopHandler), state, SessionOptions::default())
                .await
                .unwrap();
        assert_eq!(restored.id(), session.id());
        assert_eq!(restored.session().phase(), SessionPhase::Established);
    }

    #[tokio::test]
    async fn test_close_rejects_further_exchanges() {
        let session = echo_session().await;
        session.close().await;
        assert!(session.exchange(request(1, "echo", json!({}))).await.is_err());
    }
}
