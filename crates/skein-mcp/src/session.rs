//! Protocol-level session shared by both roles.
//!
//! A [`Session`] is bound to exactly one [`Wire`]. It correlates requests
//! with their responses, records the one-time `initialize` handshake, keeps a
//! typed attribute store that falls back to a parent session, and closes
//! itself when the wire terminates.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{McpError, Result};
use crate::message::{JSONRPC_VERSION, Message, MessageKind, RequestId, RpcError, methods};
use crate::pending::{Notified, PendingRequests};
use crate::protocol::{InitializeParams, InitializeResult, ProgressNotification};
use crate::wire::{Wire, WireHandler};

/// Attribute holding the session environment map.
pub const ENV_KEY: &str = "env";

/// Receives inbound requests and notifications that are not responses to
/// one of our own exchanges.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, session: &Session, msg: Message);
}

/// Handler that ignores everything it is given.
pub struct NoopHandler;

#[async_trait]
impl MessageHandler for NoopHandler {
    async fn on_message(&self, session: &Session, msg: Message) {
        if msg.expects_reply() {
            let error = RpcError::method_not_found(msg.method_name().to_string());
            if let Err(e) = session.reply_error(&msg, error).await {
                tracing::debug!(error = %e, "failed to refuse request");
            }
        }
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No handshake recorded yet.
    Unestablished,
    /// `initialize` completed.
    Established,
    /// Terminal.
    Closed,
}

/// Serializable snapshot of a session for persistence and resumption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_request: Option<InitializeParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_result: Option<InitializeResult>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

/// Options for [`Session::start`].
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Name used in log fields.
    pub name: Option<String>,
    /// Session consulted for attributes missing locally.
    pub parent: Option<Session>,
    /// Previously captured state to resume from.
    pub state: Option<SessionState>,
}

impl SessionOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
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

/// Per-call options for [`Session::exchange_with`].
#[derive(Debug, Clone, Default)]
pub struct ExchangeOptions {
    /// Caller-side cancellation.
    pub cancel: Option<CancellationToken>,
    /// Give up after this long.
    pub timeout: Option<Duration>,
    /// Stored under `params._meta.progressToken`.
    pub progress_token: Option<Value>,
}

impl ExchangeOptions {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_progress_token(mut self, token: impl Into<Value>) -> Self {
        self.progress_token = Some(token.into());
        self
    }
}

enum Attribute {
    /// In-memory value; `persisted` is set when it opted into serialization.
    Live {
        value: Arc<dyn Any + Send + Sync>,
        persisted: Option<Value>,
    },
    /// Reconstituted from a [`SessionState`], typed on first read.
    Stored(Value),
}

struct Handshake {
    phase: SessionPhase,
    request: Option<InitializeParams>,
    result: Option<InitializeResult>,
}

struct SessionInner {
    name: String,
    wire: Arc<dyn Wire>,
    handler: Arc<dyn MessageHandler>,
    pending: PendingRequests,
    handshake: RwLock<Handshake>,
    attributes: Mutex<HashMap<String, Attribute>>,
    parent: Option<Session>,
    closed: CancellationToken,
    tasks: TaskTracker,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// A protocol session bound to one wire. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Session {
    /// Bind a session to `wire` and start receiving.
    pub async fn start(
        wire: Arc<dyn Wire>,
        handler: Arc<dyn MessageHandler>,
        options: SessionOptions,
    ) -> Result<Self> {
        let session = Self::build(wire.clone(), handler, options);

        let weak = Arc::downgrade(&session.inner);
        let on_wire: WireHandler = Arc::new(move |msg: Message| -> BoxFuture<'static, ()> {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    Session { inner }.on_wire(msg).await;
                }
            })
        });
        wire.start(on_wire).await?;

        let weak = Arc::downgrade(&session.inner);
        let closed = session.inner.closed.clone();
        session.inner.tasks.spawn(async move {
            tokio::select! {
                _ = wire.wait() => {
                    if let Some(inner) = weak.upgrade() {
                        let session = Session { inner };
                        tracing::debug!(session = %session.inner.name, "wire terminated");
                        session.mark_closed();
                    }
                }
                _ = closed.cancelled() => {}
            }
        });

        Ok(session)
    }

    fn build(
        wire: Arc<dyn Wire>,
        handler: Arc<dyn MessageHandler>,
        options: SessionOptions,
    ) -> Self {
        let mut handshake = Handshake {
            phase: SessionPhase::Unestablished,
            request: None,
            result: None,
        };
        let mut attributes = HashMap::new();
        if let Some(state) = options.state {
            handshake.request = state.initialize_request;
            handshake.result = state.initialize_result;
            if handshake.result.is_some() {
                handshake.phase = SessionPhase::Established;
            }
            for (key, value) in state.attributes {
                attributes.insert(key, Attribute::Stored(value));
            }
        }

        Self {
            inner: Arc::new(SessionInner {
                name: options.name.unwrap_or_else(|| "mcp".to_string()),
                wire,
                handler,
                pending: PendingRequests::new(),
                handshake: RwLock::new(handshake),
                attributes: Mutex::new(attributes),
                parent: options.parent,
                closed: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Name used in log fields.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identifier assigned by the wire, or empty.
    pub fn id(&self) -> String {
        self.inner.wire.session_id()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.handshake.read().phase
    }

    pub fn parent(&self) -> Option<&Session> {
        self.inner.parent.as_ref()
    }

    /// Outbound (client) or inbound (server) handshake request.
    pub fn initialize_request(&self) -> Option<InitializeParams> {
        self.inner.handshake.read().request.clone()
    }

    /// Handshake result, once established.
    pub fn initialize_result(&self) -> Option<InitializeResult> {
        self.inner.handshake.read().result.clone()
    }

    /// Token cancelled when the session closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.phase() == SessionPhase::Closed {
            return Err(McpError::ConnectionClosed);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────

    async fn on_wire(&self, msg: Message) {
        tracing::trace!(
            session = %self.inner.name,
            direction = "in",
            method = msg.method_name(),
            id = ?msg.id,
            "mcp message"
        );
        let msg = if msg.kind() == MessageKind::Response {
            match self.inner.pending.notify(msg) {
                Notified::Delivered => return,
                Notified::Unclaimed(msg) => msg,
            }
        } else {
            msg
        };
        self.inner.handler.on_message(self, msg).await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────

    /// One-way send. Used for notifications and for replies.
    pub async fn send(&self, mut msg: Message) -> Result<()> {
        self.ensure_open()?;
        msg.jsonrpc = JSONRPC_VERSION.to_string();
        tracing::trace!(
            session = %self.inner.name,
            direction = "out",
            method = msg.method_name(),
            id = ?msg.id,
            "mcp message"
        );
        self.inner.wire.send(msg).await
    }

    /// Send a notification built from `payload`.
    ///
    /// Progress notifications are normalized so that values for one token
    /// only ever increase.
    pub async fn send_payload<P: Serialize + ?Sized>(&self, method: &str, payload: &P) -> Result<()> {
        let mut msg = Message::notification(method, payload)?;
        if method == methods::PROGRESS
            && let Some(params) = msg.params.take()
        {
            let mut note: ProgressNotification = serde_json::from_value(params)?;
            self.normalize_progress(&mut note);
            msg.params = Some(serde_json::to_value(&note)?);
        }
        self.send(msg).await
    }

    /// Bump `note.progress` past the last value recorded for its token.
    pub fn normalize_progress(&self, note: &mut ProgressNotification) {
        let key = progress_key(&note.progress_token);
        if let Ok(Some(last)) = self.try_get::<f64>(&key)
            && note.progress <= last
        {
            note.progress = last + if note.total.is_some() { 0.01 } else { 1.0 };
        }
        self.set(&key, note.progress);
    }

    /// Reply to an inbound request.
    pub async fn reply<R: Serialize + ?Sized>(&self, request: &Message, result: &R) -> Result<()> {
        self.send(request.reply(result)?).await
    }

    /// Reply to an inbound request with an error.
    pub async fn reply_error(&self, request: &Message, error: RpcError) -> Result<()> {
        self.send(request.error_reply(error)).await
    }

    /// Request/response round trip decoding the result into `R`.
    pub async fn exchange<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.exchange_with(method, params, ExchangeOptions::default())
            .await
    }

    /// [`exchange`](Self::exchange) with cancellation, timeout or a progress token.
    pub async fn exchange_with<P, R>(
        &self,
        method: &str,
        params: &P,
        options: ExchangeOptions,
    ) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self
            .exchange_message(Message::request(method, params)?, options)
            .await?;
        if let Some(error) = reply.error {
            return Err(McpError::Rpc(error));
        }
        let result = reply
            .result
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(serde_json::from_value(result)?)
    }

    /// Round trip returning the reply verbatim, `error` member included.
    pub async fn exchange_message(&self, mut msg: Message, options: ExchangeOptions) -> Result<Message> {
        self.ensure_open()?;
        let id = msg.id.get_or_insert_with(RequestId::random).clone();
        if let Some(token) = options.progress_token {
            msg.set_progress_token(token);
        }
        let is_initialize = msg.is_initialize();
        if is_initialize {
            self.record_initialize_request(&msg)?;
        }

        let mut slot = self.inner.pending.wait_for(id);
        let sender = self.clone();
        let mut send_task = self.inner.tasks.spawn(async move { sender.send(msg).await });
        let mut sent = false;

        let cancel = options.cancel.unwrap_or_default();
        let deadline = async {
            match options.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let reply = loop {
            tokio::select! {
                reply = slot.recv() => break reply,
                res = &mut send_task, if !sent => {
                    sent = true;
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(e),
                        Err(e) => return Err(McpError::transport(format!("send task failed: {}", e))),
                    }
                }
                _ = cancel.cancelled() => return Err(McpError::Cancelled),
                _ = &mut deadline => return Err(McpError::Timeout),
            }
        };

        let reply = reply.ok_or(McpError::NoResult)?;
        if is_initialize && reply.error.is_none() {
            self.record_initialize_result(&reply);
        }
        Ok(reply)
    }

    pub(crate) fn record_initialize_request(&self, msg: &Message) -> Result<()> {
        let params: InitializeParams = msg.params_as()?;
        self.inner.handshake.write().request = Some(params);
        Ok(())
    }

    pub(crate) fn record_initialize_result(&self, reply: &Message) {
        let Some(result) = &reply.result else { return };
        let parsed = match serde_json::from_value::<InitializeResult>(result.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(session = %self.inner.name, error = %e, "malformed initialize result");
                return;
            }
        };
        let mut handshake = self.inner.handshake.write();
        if handshake.result.is_none() {
            handshake.result = Some(parsed);
        }
        if handshake.phase == SessionPhase::Unestablished {
            handshake.phase = SessionPhase::Established;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Close the wire and release every pending exchange.
    pub async fn close(&self, delete_remote: bool) {
        if self.mark_closed() {
            tracing::debug!(session = %self.inner.name, delete_remote, "closing session");
            self.inner.wire.close(delete_remote).await;
        }
    }

    /// [`close`](Self::close), then wait for every task the session spawned.
    pub async fn shutdown(&self, delete_remote: bool) {
        self.close(delete_remote).await;
        self.inner.tasks.wait().await;
    }

    fn mark_closed(&self) -> bool {
        {
            let mut handshake = self.inner.handshake.write();
            if handshake.phase == SessionPhase::Closed {
                return false;
            }
            handshake.phase = SessionPhase::Closed;
        }
        self.inner.pending.close();
        self.inner.closed.cancel();
        self.inner.tasks.close();
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Attributes
    // ─────────────────────────────────────────────────────────────────────

    /// Store an in-memory attribute. It is not part of [`state`](Self::state).
    pub fn set<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.inner.attributes.lock().insert(
            key.to_string(),
            Attribute::Live {
                value: Arc::new(value),
                persisted: None,
            },
        );
    }

    /// Store an attribute that is captured by [`state`](Self::state).
    pub fn set_persistent<T: Serialize + Any + Send + Sync>(&self, key: &str, value: T) -> Result<()> {
        let persisted = serde_json::to_value(&value)?;
        self.inner.attributes.lock().insert(
            key.to_string(),
            Attribute::Live {
                value: Arc::new(value),
                persisted: Some(persisted),
            },
        );
        Ok(())
    }

    /// Read an attribute, falling back to the parent chain.
    ///
    /// # Panics
    ///
    /// Panics when the attribute exists but cannot be read as `T`. Use
    /// [`try_get`](Self::try_get) to handle that case.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + DeserializeOwned + Send + Sync + 'static,
    {
        match self.try_get(key) {
            Ok(value) => value,
            Err(e) => panic!("{}", e),
        }
    }

    /// Read an attribute, falling back to the parent chain.
    pub fn try_get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: Clone + DeserializeOwned + Send + Sync + 'static,
    {
        if let Some(value) = self.get_local(key)? {
            return Ok(Some(value));
        }
        match &self.inner.parent {
            Some(parent) => parent.try_get(key),
            None => Ok(None),
        }
    }

    fn get_local<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: Clone + DeserializeOwned + Send + Sync + 'static,
    {
        let mut attributes = self.inner.attributes.lock();
        let rehydrated = match attributes.get(key) {
            None => return Ok(None),
            Some(Attribute::Live { value, persisted }) => {
                if let Some(value) = value.downcast_ref::<T>() {
                    return Ok(Some(value.clone()));
                }
                return match persisted
                    .as_ref()
                    .and_then(|raw| serde_json::from_value::<T>(raw.clone()).ok())
                {
                    Some(value) => Ok(Some(value)),
                    None => Err(McpError::AttributeType {
                        key: key.to_string(),
                        expected: std::any::type_name::<T>(),
                    }),
                };
            }
            Some(Attribute::Stored(raw)) => serde_json::from_value::<T>(raw.clone())
                .ok()
                .map(|value| (value, raw.clone())),
        };

        match rehydrated {
            Some((value, raw)) => {
                attributes.insert(
                    key.to_string(),
                    Attribute::Live {
                        value: Arc::new(value.clone()),
                        persisted: Some(raw),
                    },
                );
                Ok(Some(value))
            }
            None => {
                tracing::debug!(key, "dropping stored attribute that no longer decodes");
                attributes.remove(key);
                Ok(None)
            }
        }
    }

    /// Remove an attribute here and in every ancestor.
    pub fn delete(&self, key: &str) {
        self.inner.attributes.lock().remove(key);
        if let Some(parent) = &self.inner.parent {
            parent.delete(key);
        }
    }

    /// Merged environment: ancestors first, local entries win.
    pub fn env(&self) -> HashMap<String, String> {
        let mut env = self
            .inner
            .parent
            .as_ref()
            .map(Session::env)
            .unwrap_or_default();
        if let Ok(Some(local)) = self.get_local::<HashMap<String, String>>(ENV_KEY) {
            env.extend(local);
        }
        env
    }

    /// Add entries to this session's own environment.
    pub fn merge_env<I, K, V>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut local = self
            .get_local::<HashMap<String, String>>(ENV_KEY)?
            .unwrap_or_default();
        local.extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self.set_persistent(ENV_KEY, local)
    }

    /// Snapshot id, handshake and every persistent attribute.
    pub fn state(&self) -> SessionState {
        let handshake = self.inner.handshake.read();
        let attributes = self
            .inner
            .attributes
            .lock()
            .iter()
            .filter_map(|(key, attr)| match attr {
                Attribute::Live { persisted, .. } => {
                    persisted.clone().map(|raw| (key.clone(), raw))
                }
                Attribute::Stored(raw) => Some((key.clone(), raw.clone())),
            })
            .collect();
        SessionState {
            id: self.id(),
            initialize_request: handshake.request.clone(),
            initialize_result: handshake.result.clone(),
            attributes,
        }
    }
}

fn progress_key(token: &Value) -> String {
    match token {
        Value::String(s) => format!("progress-token:{}", s),
        other => format!("progress-token:{}", other),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Wire that records outbound messages and lets the test inject inbound ones.
    pub(crate) struct TestWire {
        handler: Mutex<Option<WireHandler>>,
        sent: mpsc::UnboundedSender<Message>,
        closed: CancellationToken,
        fail_sends: bool,
    }

    impl TestWire {
        pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
            Self::build(false)
        }

        fn build(fail_sends: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let wire = Arc::new(Self {
                handler: Mutex::new(None),
                sent: tx,
                closed: CancellationToken::new(),
                fail_sends,
            });
            (wire, rx)
        }

        pub(crate) async fn inject(&self, msg: Message) {
            let handler = self.handler.lock().clone().expect("wire not started");
            handler(msg).await;
        }
    }

    #[async_trait]
    impl Wire for TestWire {
        async fn start(&self, handler: WireHandler) -> Result<()> {
            *self.handler.lock() = Some(handler);
            Ok(())
        }

        async fn send(&self, msg: Message) -> Result<()> {
            if self.fail_sends {
                return Err(McpError::transport("wire is broken"));
            }
            self.sent
                .send(msg)
                .map_err(|_| McpError::ConnectionClosed)
        }

        async fn close(&self, _delete_remote: bool) {
            self.closed.cancel();
        }

        async fn wait(&self) {
            self.closed.cancelled().await;
        }

        fn session_id(&self) -> String {
            "test-session".to_string()
        }
    }

    async fn session_on(wire: Arc<TestWire>, options: SessionOptions) -> Session {
        Session::start(wire, Arc::new(NoopHandler), options)
            .await
            .unwrap()
    }

    fn init_result() -> Value {
        json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": "srv", "version": "1.0"}
        })
    }

    #[tokio::test]
    async fn test_exchange_decodes_result() {
        let (wire, mut sent) = TestWire::new();
        let session = session_on(wire.clone(), SessionOptions::default()).await;

        let responder = tokio::spawn(async move {
            let req = sent.recv().await.unwrap();
            assert_eq!(req.method_name(), "tools/list");
            assert_eq!(req.jsonrpc, "2.0");
            wire.inject(Message::response(req.id.unwrap(), json!({"tools": []})))
                .await;
        });

        let result: crate::protocol::ListToolsResult =
            session.exchange("tools/list", &json!({})).await.unwrap();
        assert!(result.tools.is_empty());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_surfaces_server_error() {
        let (wire, mut sent) = TestWire::new();
        let session = session_on(wire.clone(), SessionOptions::default()).await;

        tokio::spawn(async move {
            let req = sent.recv().await.unwrap();
            wire.inject(req.error_reply(RpcError::invalid_params("bad name")))
                .await;
        });

        let err = session
            .exchange::<_, Value>("tools/call", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Rpc(ref e) if e.code == RpcError::INVALID_PARAMS));
        assert!(err.to_string().starts_with("error from server: "));
    }

    #[tokio::test]
    async fn test_exchange_message_returns_error_verbatim() {
        let (wire, mut sent) = TestWire::new();
        let session = session_on(wire.clone(), SessionOptions::default()).await;

        tokio::spawn(async move {
            let req = sent.recv().await.unwrap();
            wire.inject(req.error_reply(RpcError::internal("x"))).await;
        });

        let msg = Message::request("ping", &()).unwrap();
        let reply = session
            .exchange_message(msg, ExchangeOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.error.unwrap().code, RpcError::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_send_failure_ends_exchange() {
        let (wire, _sent) = TestWire::build(true);
        let session = session_on(wire, SessionOptions::default()).await;
        let err = session
            .exchange::<_, Value>("ping", &())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
        assert!(session.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_exchange_retires_slot() {
        let (wire, _sent) = TestWire::new();
        let session = session_on(wire, SessionOptions::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = session
            .exchange_with::<_, Value>("ping", &(), ExchangeOptions::default().with_cancel(cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Cancelled));
        assert!(session.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_exchange() {
        let (wire, _sent) = TestWire::new();
        let session = session_on(wire, SessionOptions::default()).await;
        let err = session
            .exchange_with::<_, Value>(
                "ping",
                &(),
                ExchangeOptions::default().with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout));
    }

    #[tokio::test]
    async fn test_close_releases_pending_and_fails_sends() {
        let (wire, mut sent) = TestWire::new();
        let session = session_on(wire, SessionOptions::default()).await;

        let waiting = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange::<_, Value>("ping", &()).await })
        };
        sent.recv().await.unwrap();

        session.shutdown(false).await;
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::NoResult));
        assert_eq!(session.phase(), SessionPhase::Closed);

        let err = session
            .send(Message::notification("notifications/x", &()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_wire_termination_closes_session() {
        let (wire, _sent) = TestWire::new();
        let session = session_on(wire.clone(), SessionOptions::default()).await;
        wire.close(false).await;
        session.closed_token().cancelled().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn test_initialize_handshake_recorded_once() {
        let (wire, mut sent) = TestWire::new();
        let session = session_on(wire.clone(), SessionOptions::default()).await;
        assert_eq!(session.phase(), SessionPhase::Unestablished);

        tokio::spawn(async move {
            let req = sent.recv().await.unwrap();
            wire.inject(Message::response(req.id.unwrap(), init_result()))
                .await;
        });

        let result: InitializeResult = session
            .exchange("initialize", &InitializeParams::default())
            .await
            .unwrap();
        assert_eq!(result.server_info.name, "srv");
        assert_eq!(session.phase(), SessionPhase::Established);
        assert_eq!(
            session.initialize_request().unwrap().protocol_version,
            "2025-06-18"
        );
        assert_eq!(session.initialize_result().unwrap(), result);
    }

    #[tokio::test]
    async fn test_unmatched_response_goes_to_handler() {
        struct Recorder(mpsc::UnboundedSender<Message>);

        #[async_trait]
        impl MessageHandler for Recorder {
            async fn on_message(&self, _session: &Session, msg: Message) {
                let _ = self.0.send(msg);
            }
        }

        let (wire, _sent) = TestWire::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = Session::start(wire.clone(), Arc::new(Recorder(tx)), SessionOptions::default())
            .await
            .unwrap();

        wire.inject(Message::response("stray".into(), json!({}))).await;
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.id, Some("stray".into()));
    }

    #[tokio::test]
    async fn test_progress_normalization() {
        let (wire, mut sent) = TestWire::new();
        let session = session_on(wire, SessionOptions::default()).await;

        let mut with_total = ProgressNotification {
            progress_token: json!("t1"),
            progress: 5.0,
            total: Some(10.0),
            message: None,
        };
        session.normalize_progress(&mut with_total);
        assert_eq!(with_total.progress, 5.0);

        let mut repeat = with_total.clone();
        session.normalize_progress(&mut repeat);
        assert!(repeat.progress > 5.0 && repeat.progress <= 5.01 + f64::EPSILON);

        let mut no_total = ProgressNotification {
            progress_token: json!(7),
            progress: 5.0,
            total: None,
            message: None,
        };
        session.normalize_progress(&mut no_total);
        let mut lower = ProgressNotification {
            progress: 3.0,
            ..no_total.clone()
        };
        session.normalize_progress(&mut lower);
        assert_eq!(lower.progress, 6.0);

        let mut fresh = ProgressNotification {
            progress_token: json!(7),
            progress: 2.0,
            total: None,
            message: None,
        };
        session
            .send_payload(methods::PROGRESS, &fresh)
            .await
            .unwrap();
        let out = sent.recv().await.unwrap();
        assert_eq!(out.params.unwrap()["progress"], json!(7.0));
        fresh.progress = 100.0;
        session.normalize_progress(&mut fresh);
        assert_eq!(fresh.progress, 100.0);
    }

    #[tokio::test]
    async fn test_attribute_inheritance_and_shadowing() {
        let (parent_wire, _a) = TestWire::new();
        let (child_wire, _b) = TestWire::new();
        let parent = session_on(parent_wire, SessionOptions::default()).await;
        parent.set("k", "parent".to_string());

        let child = session_on(
            child_wire,
            SessionOptions::default().with_parent(parent.clone()),
        )
        .await;
        assert_eq!(child.get::<String>("k"), Some("parent".to_string()));

        child.set("k", "child".to_string());
        assert_eq!(child.get::<String>("k"), Some("child".to_string()));
        assert_eq!(parent.get::<String>("k"), Some("parent".to_string()));

        child.delete("k");
        assert_eq!(child.get::<String>("k"), None);
        assert_eq!(parent.get::<String>("k"), None);
    }

    #[tokio::test]
    async fn test_attribute_type_mismatch() {
        let (wire, _sent) = TestWire::new();
        let session = session_on(wire, SessionOptions::default()).await;
        session.set("n", 5_u32);
        assert!(matches!(
            session.try_get::<String>("n"),
            Err(McpError::AttributeType { .. })
        ));

        // Persistent values can still be read through their serialized form.
        session.set_persistent("p", 5_u32).unwrap();
        assert_eq!(session.get::<u64>("p"), Some(5));
    }

    #[tokio::test]
    #[should_panic(expected = "does not hold")]
    async fn test_get_panics_on_incompatible_type() {
        let (wire, _sent) = TestWire::new();
        let session = session_on(wire, SessionOptions::default()).await;
        session.set("n", vec![1_u8]);
        let _ = session.get::<String>("n");
    }

    #[tokio::test]
    async fn test_state_roundtrip() {
        let (wire, _sent) = TestWire::new();
        let session = session_on(wire, SessionOptions::default()).await;
        session.set("scratch", 1_u8);
        session.set_persistent("count", 3_i64).unwrap();
        session.merge_env([("TOKEN", "abc")]).unwrap();

        let state = session.state();
        assert_eq!(state.id, "test-session");
        assert!(!state.attributes.contains_key("scratch"));
        assert_eq!(state.attributes["count"], json!(3));

        let (wire, _sent) = TestWire::new();
        let restored = session_on(wire, SessionOptions::default().with_state(state)).await;
        assert_eq!(restored.get::<i64>("count"), Some(3));
        assert_eq!(restored.env().get("TOKEN"), Some(&"abc".to_string()));
        // A stored value that no longer decodes is dropped.
        assert_eq!(restored.try_get::<Vec<String>>("count").ok().flatten(), None);
        assert!(!restored.state().attributes.contains_key("count"));
    }

    #[tokio::test]
    async fn test_restored_handshake_is_established() {
        let state = SessionState {
            id: "S1".into(),
            initialize_request: Some(InitializeParams::default()),
            initialize_result: Some(serde_json::from_value(init_result()).unwrap()),
            attributes: BTreeMap::new(),
        };
        let (wire, _sent) = TestWire::new();
        let session = session_on(wire, SessionOptions::default().with_state(state)).await;
        assert_eq!(session.phase(), SessionPhase::Established);
    }

    #[tokio::test]
    async fn test_env_merges_parent() {
        let (a, _a) = TestWire::new();
        let (b, _b) = TestWire::new();
        let parent = session_on(a, SessionOptions::default()).await;
        parent.merge_env([("SHARED", "p"), ("ONLY_PARENT", "p")]).unwrap();
        let child = session_on(b, SessionOptions::default().with_parent(parent)).await;
        child.merge_env([("SHARED", "c")]).unwrap();

        let env = child.env();
        assert_eq!(env["SHARED"], "c");
        assert_eq!(env["ONLY_PARENT"], "p");
    }

    #[tokio::test]
    async fn test_noop_handler_refuses_requests() {
        let (wire, mut sent) = TestWire::new();
        let _session = session_on(wire.clone(), SessionOptions::default()).await;
        let mut req = Message::request("roots/list", &()).unwrap();
        req.id = Some(RequestId::Number(3));
        wire.inject(req).await;
        let reply = sent.recv().await.unwrap();
        assert_eq!(reply.id, Some(RequestId::Number(3)));
        assert_eq!(reply.error.unwrap().code, RpcError::METHOD_NOT_FOUND);
    }
}
