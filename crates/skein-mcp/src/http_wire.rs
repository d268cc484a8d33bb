//! Streamable HTTP client wire.
//!
//! Outbound messages are POSTed; replies come back as a JSON body, as an
//! event stream on the POST response, or (legacy SSE servers) on a separate
//! long-lived GET stream whose first `endpoint` frame names the POST URL.
//! Server-initiated traffic arrives on the GET stream, which is reopened with
//! `Last-Event-ID` whenever it drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::auth::{AuthChallenge, Authenticator};
use crate::error::{McpError, Result};
use crate::message::{Message, RequestId, methods};
use crate::wire::{Wire, WireHandler};

/// Header carrying the server-assigned session id.
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";
/// Header used to resume an event stream.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Default number of stream reconnect attempts after a drop.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
/// Default delay before the first reconnect attempt; doubles each attempt.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(250);
/// Default bound on the best-effort session DELETE.
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_BOTH: &str = "application/json, text/event-stream";
const ACCEPT_STREAM: &str = "text/event-stream";

type EventStream = BoxStream<'static, std::result::Result<Event, EventStreamError<reqwest::Error>>>;

/// Configuration for an [`HttpWire`].
#[derive(Debug, Clone)]
pub struct HttpWireConfig {
    /// Server endpoint.
    pub url: String,
    /// Static headers sent with every request.
    pub headers: HashMap<String, String>,
    /// Bearer token sent until the server rejects it as stale.
    pub bearer_token: Option<String>,
    /// Per-POST timeout.
    pub request_timeout: Option<Duration>,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub delete_timeout: Duration,
}

impl HttpWireConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            bearer_token: None,
            request_timeout: None,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, backoff: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    /// Nothing sent yet.
    None,
    /// The first `initialize` is on the wire.
    InFlight,
    Done,
    /// The server forgot us; replay the stored `initialize` before the next send.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamStatus {
    /// A stream is owed.
    Idle,
    Live,
    /// The server has no standalone GET stream.
    Unsupported,
}

struct WireState {
    session_id: Option<String>,
    message_url: Url,
    handshake: Handshake,
    init_message: Option<Message>,
    sse_mode: bool,
    stream: StreamStatus,
    stream_generation: u64,
    stream_cancel: Option<CancellationToken>,
    last_event_id: Option<String>,
    use_bearer: bool,
    /// The client carries credentials from the authenticator.
    authenticated: bool,
    /// Id of a replayed `initialize` whose reply is consumed here.
    replay_id: Option<RequestId>,
}

struct HttpInner {
    name: String,
    config: HttpWireConfig,
    base_url: Url,
    client: RwLock<reqwest::Client>,
    plain_client: reqwest::Client,
    authenticator: RwLock<Option<Arc<dyn Authenticator>>>,
    state: RwLock<WireState>,
    handler: Mutex<Option<WireHandler>>,
    /// Held by whoever is opening the GET stream.
    reconnect: tokio::sync::Mutex<()>,
    /// Serializes re-initialization.
    handshake_lock: tokio::sync::Mutex<()>,
    closed: CancellationToken,
    tasks: TaskTracker,
}

/// Client wire speaking MCP's streamable HTTP transport.
pub struct HttpWire {
    inner: Arc<HttpInner>,
}

impl HttpWire {
    pub fn new(name: impl Into<String>, config: HttpWireConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| McpError::transport(format!("invalid URL '{}': {}", config.url, e)))?;
        let plain_client = reqwest::Client::builder().build()?;
        let use_bearer = config.bearer_token.is_some();

        Ok(Self {
            inner: Arc::new(HttpInner {
                name: name.into(),
                base_url: base_url.clone(),
                client: RwLock::new(plain_client.clone()),
                plain_client,
                authenticator: RwLock::new(None),
                state: RwLock::new(WireState {
                    session_id: None,
                    message_url: base_url,
                    handshake: Handshake::None,
                    init_message: None,
                    sse_mode: false,
                    stream: StreamStatus::Idle,
                    stream_generation: 0,
                    stream_cancel: None,
                    last_event_id: None,
                    use_bearer,
                    authenticated: false,
                    replay_id: None,
                }),
                handler: Mutex::new(None),
                reconnect: tokio::sync::Mutex::new(()),
                handshake_lock: tokio::sync::Mutex::new(()),
                closed: CancellationToken::new(),
                tasks: TaskTracker::new(),
                config,
            }),
        })
    }

    /// Install the collaborator consulted on `401`.
    pub fn with_authenticator(self, authenticator: Arc<dyn Authenticator>) -> Self {
        *self.inner.authenticator.write() = Some(authenticator);
        self
    }

    /// Server endpoint this wire talks to.
    pub fn url(&self) -> &Url {
        &self.inner.base_url
    }

    /// URL outbound messages are currently POSTed to.
    pub fn message_url(&self) -> Url {
        self.inner.state.read().message_url.clone()
    }

    /// Id of the last event received on the GET stream.
    pub fn last_event_id(&self) -> Option<String> {
        self.inner.state.read().last_event_id.clone()
    }

    /// Close, then wait for the stream reader and every dispatch task.
    pub async fn shutdown(&self, delete_remote: bool) {
        self.close(delete_remote).await;
        self.inner.tasks.wait().await;
    }
}

#[async_trait]
impl Wire for HttpWire {
    async fn start(&self, handler: WireHandler) -> Result<()> {
        {
            let mut slot = self.inner.handler.lock();
            if slot.is_some() {
                return Err(McpError::transport("http wire already started"));
            }
            *slot = Some(handler);
        }
        let authenticator = self.inner.authenticator.read().clone();
        if let Some(authenticator) = authenticator
            && let Some(client) = authenticator.cached_client(&self.inner.base_url).await
        {
            tracing::debug!(server = %self.inner.name, "using cached credentials");
            *self.inner.client.write() = client;
            self.inner.state.write().authenticated = true;
        }
        Ok(())
    }

    /// Send with a bounded recovery ladder: each failure kind gets at most
    /// one retry.
    async fn send(&self, msg: Message) -> Result<()> {
        let inner = &self.inner;
        let mut auth_retried = false;
        let mut session_retried = false;
        let mut stale_reset = false;

        loop {
            let err = match inner.send_once(msg.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if err.is_auth_required() && !auth_retried {
                auth_retried = true;
                inner.reauthenticate(err).await?;
            } else if err.is_session_not_found() && !session_retried {
                session_retried = true;
                tracing::info!(server = %inner.name, "server lost our session, re-initializing");
                inner.reset_session();
            } else if err.is_stale_credential() && !stale_reset {
                stale_reset = true;
                tracing::warn!(server = %inner.name, error = %err, "dropping stale credentials");
                inner.drop_credentials();
            } else {
                return Err(err);
            }
        }
    }

    async fn close(&self, delete_remote: bool) {
        let inner = &self.inner;
        if inner.closed.is_cancelled() {
            return;
        }
        inner.closed.cancel();
        inner.tasks.close();

        if !delete_remote {
            return;
        }
        let (session_id, url) = {
            let state = inner.state.read();
            (state.session_id.clone(), state.message_url.clone())
        };
        let Some(session_id) = session_id else { return };
        let request = inner
            .apply_headers(inner.current_client().delete(url))
            .header(SESSION_ID_HEADER, &session_id)
            .timeout(inner.config.delete_timeout);
        match request.send().await {
            Ok(response) => {
                tracing::debug!(server = %inner.name, session_id = %session_id, status = %response.status(), "deleted remote session");
            }
            Err(e) => {
                tracing::debug!(server = %inner.name, session_id = %session_id, error = %e, "failed to delete remote session");
            }
        }
    }

    async fn wait(&self) {
        self.inner.closed.cancelled().await;
    }

    fn session_id(&self) -> String {
        self.inner.state.read().session_id.clone().unwrap_or_default()
    }
}

impl HttpInner {
    fn current_client(&self) -> reqwest::Client {
        self.client.read().clone()
    }

    fn apply_headers(&self, mut request: RequestBuilder) -> RequestBuilder {
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        if self.state.read().use_bearer
            && let Some(token) = &self.config.bearer_token
        {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        request
    }

    fn dispatch(&self, msg: Message) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                self.tasks.spawn(handler(msg));
            }
            None => tracing::warn!(server = %self.name, "message received before start"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────

    async fn send_once(self: &Arc<Self>, msg: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(McpError::ConnectionClosed);
        }
        if msg.is_initialize() {
            return self.initialize(msg).await;
        }

        let sse_mode = self.state.read().sse_mode;
        if sse_mode {
            self.ensure_stream().await?;
        }

        let handshake = self.state.read().handshake;
        match handshake {
            Handshake::Done => {}
            Handshake::Reset => self.reinitialize().await?,
            Handshake::None | Handshake::InFlight => {
                return Err(McpError::not_initialized(msg.method_name()));
            }
        }

        if !sse_mode && self.stream_owed() {
            let inner = Arc::clone(self);
            self.tasks.spawn(async move {
                if let Err(e) = inner.ensure_stream().await {
                    tracing::debug!(server = %inner.name, error = %e, "event stream unavailable");
                }
            });
        }

        for reply in self.post(&msg).await? {
            self.dispatch(reply);
        }
        Ok(())
    }

    /// POST one message and collect whatever replies the response carries.
    async fn post(&self, msg: &Message) -> Result<Vec<Message>> {
        let (url, session_id) = {
            let state = self.state.read();
            (state.message_url.clone(), state.session_id.clone())
        };
        let mut request = self
            .apply_headers(self.current_client().post(url))
            .header(ACCEPT, ACCEPT_BOTH)
            .header(CONTENT_TYPE, "application/json")
            .json(msg);
        if let Some(session_id) = &session_id {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        if let Some(timeout) = self.config.request_timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        self.capture_session_id(&response);
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(self.unauthorized(&response)),
            StatusCode::NOT_FOUND if session_id.is_some() => Err(McpError::SessionNotFound {
                session_id: session_id.unwrap_or_default(),
            }),
            StatusCode::ACCEPTED => Ok(Vec::new()),
            status if status.is_success() => self.read_replies(response).await,
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(McpError::transport(format!(
                    "POST {} failed with status {}: {}",
                    msg.method_name(),
                    status,
                    body.trim()
                )))
            }
        }
    }

    async fn read_replies(&self, response: Response) -> Result<Vec<Message>> {
        if is_event_stream(&response) {
            let mut events = response.bytes_stream().eventsource();
            let mut replies = Vec::new();
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| McpError::transport(format!("event stream: {}", e)))?;
                if is_message_event(&event) && !event.data.trim().is_empty() {
                    replies.push(serde_json::from_str(&event.data)?);
                }
            }
            return Ok(replies);
        }

        let body = response.bytes().await?;
        let trimmed = body.trim_ascii();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        if !trimmed.starts_with(b"{") {
            return Err(McpError::transport(format!(
                "expected a JSON object, got: {}",
                String::from_utf8_lossy(&trimmed[..trimmed.len().min(128)])
            )));
        }
        Ok(vec![serde_json::from_slice(trimmed)?])
    }

    fn capture_session_id(&self, response: &Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            let mut state = self.state.write();
            if state.session_id.as_deref() != Some(id) {
                tracing::debug!(server = %self.name, session_id = %id, "session established");
                state.session_id = Some(id.to_string());
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Handshake
    // ─────────────────────────────────────────────────────────────────────

    async fn initialize(self: &Arc<Self>, msg: Message) -> Result<()> {
        self.state.write().handshake = Handshake::InFlight;
        match self.post_initialize(&msg).await {
            Ok(replies) => {
                {
                    let mut state = self.state.write();
                    if replies.iter().any(|reply| reply.error.is_some()) {
                        tracing::warn!(server = %self.name, "server rejected initialize");
                        state.handshake = if state.init_message.is_some() {
                            Handshake::Reset
                        } else {
                            Handshake::None
                        };
                    } else {
                        state.init_message = Some(msg);
                        state.handshake = Handshake::Done;
                    }
                }
                // The session still needs the reply, error or not.
                for reply in replies {
                    self.dispatch(reply);
                }
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.write();
                state.handshake = if state.init_message.is_some() {
                    Handshake::Reset
                } else {
                    Handshake::None
                };
                Err(e)
            }
        }
    }

    /// POST `initialize`, falling back to a legacy SSE endpoint when the
    /// server refuses it outright.
    async fn post_initialize(self: &Arc<Self>, msg: &Message) -> Result<Vec<Message>> {
        match self.post(msg).await {
            Ok(replies) => Ok(replies),
            Err(McpError::Transport(reason)) if !self.state.read().sse_mode => {
                tracing::debug!(server = %self.name, reason = %reason, "initialize refused, trying SSE endpoint");
                self.connect_sse_endpoint().await?;
                self.post(msg).await
            }
            Err(e) => Err(e),
        }
    }

    /// Replay the stored `initialize` after the server forgot the session.
    async fn reinitialize(self: &Arc<Self>) -> Result<()> {
        let _guard = self.handshake_lock.lock().await;
        if self.state.read().handshake != Handshake::Reset {
            return Ok(());
        }
        self.replay_initialize().await?;
        tracing::info!(server = %self.name, "session re-initialized");
        Ok(())
    }

    /// POST the stored `initialize` under a fresh id, then
    /// `notifications/initialized`. A no-op before the first handshake
    /// completes.
    async fn replay_initialize(self: &Arc<Self>) -> Result<()> {
        let init = {
            let state = self.state.read();
            match state.handshake {
                Handshake::Done | Handshake::Reset => state.init_message.clone(),
                Handshake::None | Handshake::InFlight => None,
            }
        };
        let Some(mut init) = init else {
            return Ok(());
        };
        let id = RequestId::random();
        init.id = Some(id.clone());
        self.state.write().replay_id = Some(id);

        for reply in self.post_initialize(&init).await? {
            if let Some(error) = reply.error {
                self.state.write().handshake = Handshake::Reset;
                return Err(McpError::Rpc(error));
            }
        }
        self.state.write().handshake = Handshake::Done;

        let initialized = Message::notification(methods::INITIALIZED, &serde_json::json!({}))?;
        self.post(&initialized).await?;
        Ok(())
    }

    fn reset_session(&self) {
        let cancel = {
            let mut state = self.state.write();
            state.session_id = None;
            state.last_event_id = None;
            state.handshake = if state.init_message.is_some() {
                Handshake::Reset
            } else {
                Handshake::None
            };
            if state.stream == StreamStatus::Live {
                state.stream = StreamStatus::Idle;
            }
            state.stream_cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Credentials
    // ─────────────────────────────────────────────────────────────────────

    async fn reauthenticate(&self, err: McpError) -> Result<()> {
        let McpError::AuthRequired { challenge, .. } = &err else {
            return Err(err);
        };
        let authenticator = self.authenticator.read().clone();
        let Some(authenticator) = authenticator else {
            return Err(err);
        };
        let challenge = AuthChallenge::new(self.base_url.clone(), challenge.clone());
        tracing::info!(
            server = %self.name,
            resource_metadata = ?challenge.resource_metadata,
            "server requires authentication"
        );
        let client = authenticator.obtain_client(&challenge).await?;
        *self.client.write() = client;
        let mut state = self.state.write();
        state.use_bearer = false;
        state.authenticated = true;
        Ok(())
    }

    fn drop_credentials(&self) {
        *self.client.write() = self.plain_client.clone();
        let mut state = self.state.write();
        state.use_bearer = false;
        state.authenticated = false;
    }

    /// Map a `401`. A challenge rejecting the token we presented means the
    /// credentials are stale rather than missing.
    fn unauthorized(&self, response: &Response) -> McpError {
        let err = auth_required(response);
        let sent_credentials = {
            let state = self.state.read();
            state.use_bearer || state.authenticated
        };
        match err {
            McpError::AuthRequired { challenge, .. }
                if sent_credentials && crate::auth::rejects_token(&challenge) =>
            {
                McpError::StaleCredential(format!("server rejected the token: {}", challenge))
            }
            err => err,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Event stream
    // ─────────────────────────────────────────────────────────────────────

    fn stream_owed(&self) -> bool {
        let state = self.state.read();
        let handshaken = match state.handshake {
            Handshake::Done => true,
            // Legacy SSE re-initializes over a fresh stream.
            Handshake::Reset => state.sse_mode,
            Handshake::None | Handshake::InFlight => false,
        };
        !self.closed.is_cancelled() && handshaken && state.stream == StreamStatus::Idle
    }

    /// Open the GET stream if one is owed and hand it to a reader task.
    async fn ensure_stream(self: &Arc<Self>) -> Result<()> {
        if !self.stream_owed() {
            return Ok(());
        }
        let _guard = self.reconnect.lock().await;
        if !self.stream_owed() {
            return Ok(());
        }
        let Some(mut events) = self.open_stream().await? else {
            return Ok(());
        };
        if self.state.read().sse_mode {
            self.resume_sse(&mut events).await?;
        }
        self.spawn_reader(events);
        Ok(())
    }

    /// Legacy SSE: GET the base URL and wait for the `endpoint` frame.
    /// A failed attempt restores streamable mode, so the next `initialize`
    /// tries the fallback again.
    async fn connect_sse_endpoint(self: &Arc<Self>) -> Result<()> {
        let _guard = self.reconnect.lock().await;
        self.state.write().sse_mode = true;
        let connected: Result<EventStream> = async {
            let mut events = self
                .open_stream()
                .await?
                .ok_or_else(|| McpError::transport("server offers no event stream"))?;
            self.await_endpoint(&mut events).await?;
            Ok(events)
        }
        .await;

        match connected {
            Ok(events) => {
                self.spawn_reader(events);
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.write();
                state.sse_mode = false;
                state.message_url = self.base_url.clone();
                Err(e)
            }
        }
    }

    /// Read frames until the server names the message endpoint. Messages
    /// arriving first are dispatched as usual.
    async fn await_endpoint(&self, events: &mut EventStream) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => return Err(McpError::ConnectionClosed),
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) if event.event == "endpoint" => return self.set_endpoint(&event.data),
                Some(Ok(event)) => self.on_event(event),
                Some(Err(e)) => return Err(McpError::transport(format!("event stream: {}", e))),
                None => return Err(McpError::transport("event stream ended before endpoint")),
            }
        }
    }

    /// A new legacy stream names a new endpoint, which knows nothing of
    /// our handshake.
    async fn resume_sse(self: &Arc<Self>, events: &mut EventStream) -> Result<()> {
        self.await_endpoint(events).await?;
        self.replay_initialize().await?;
        tracing::debug!(server = %self.name, endpoint = %self.state.read().message_url, "legacy stream resumed");
        Ok(())
    }

    fn set_endpoint(&self, data: &str) -> Result<()> {
        let url = self
            .base_url
            .join(data.trim())
            .map_err(|e| McpError::protocol(format!("invalid endpoint '{}': {}", data, e)))?;
        tracing::debug!(server = %self.name, endpoint = %url, "message endpoint");
        self.state.write().message_url = url;
        Ok(())
    }

    /// GET the event stream. `None` when the server has no standalone stream.
    async fn open_stream(&self) -> Result<Option<EventStream>> {
        let (session_id, last_event_id, sse_mode) = {
            let state = self.state.read();
            (
                state.session_id.clone(),
                state.last_event_id.clone(),
                state.sse_mode,
            )
        };
        let mut request = self
            .apply_headers(self.current_client().get(self.base_url.clone()))
            .header(ACCEPT, ACCEPT_STREAM);
        if let Some(session_id) = &session_id {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        if let Some(last_event_id) = &last_event_id {
            request = request.header(LAST_EVENT_ID_HEADER, last_event_id);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(self.unauthorized(&response)),
            StatusCode::NOT_FOUND if session_id.is_some() => Err(McpError::SessionNotFound {
                session_id: session_id.unwrap_or_default(),
            }),
            StatusCode::METHOD_NOT_ALLOWED if !sse_mode => {
                tracing::debug!(server = %self.name, "server has no standalone event stream");
                self.state.write().stream = StreamStatus::Unsupported;
                Ok(None)
            }
            status if status.is_success() => {
                tracing::debug!(server = %self.name, last_event_id = ?last_event_id, "event stream open");
                Ok(Some(response.bytes_stream().eventsource().boxed()))
            }
            status => Err(McpError::transport(format!(
                "event stream request failed with status {}",
                status
            ))),
        }
    }

    fn spawn_reader(self: &Arc<Self>, events: EventStream) {
        let token = self.closed.child_token();
        let generation = {
            let mut state = self.state.write();
            state.stream = StreamStatus::Live;
            state.stream_generation += 1;
            if let Some(previous) = state.stream_cancel.replace(token.clone()) {
                previous.cancel();
            }
            state.stream_generation
        };
        let inner = Arc::clone(self);
        self.tasks
            .spawn(async move { inner.read_stream(events, token, generation).await });
    }

    async fn read_stream(self: Arc<Self>, mut events: EventStream, token: CancellationToken, generation: u64) {
        loop {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => {
                        self.stream_finished(generation);
                        return;
                    }
                    next = events.next() => next,
                };
                match next {
                    Some(Ok(event)) => self.on_event(event),
                    Some(Err(e)) => {
                        tracing::warn!(server = %self.name, error = %e, "event stream read failed");
                        break;
                    }
                    None => {
                        tracing::debug!(server = %self.name, "event stream ended");
                        break;
                    }
                }
            }

            match self.reconnect_with_backoff(&token).await {
                Some(mut next) => {
                    let sse_mode = self.state.read().sse_mode;
                    if sse_mode && let Err(e) = self.resume_sse(&mut next).await {
                        tracing::warn!(server = %self.name, error = %e, "legacy stream resume failed");
                        self.stream_finished(generation);
                        return;
                    }
                    events = next;
                }
                None => {
                    self.stream_finished(generation);
                    return;
                }
            }
        }
    }

    async fn reconnect_with_backoff(&self, token: &CancellationToken) -> Option<EventStream> {
        let mut delay = self.config.reconnect_backoff;
        for attempt in 1..=self.config.reconnect_attempts {
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            let _guard = self.reconnect.lock().await;
            match self.open_stream().await {
                Ok(Some(events)) => return Some(events),
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(server = %self.name, attempt, error = %e, "event stream reconnect failed");
                }
            }
            delay *= 2;
        }
        None
    }

    fn stream_finished(&self, generation: u64) {
        let mut state = self.state.write();
        if state.stream_generation == generation && state.stream == StreamStatus::Live {
            state.stream = StreamStatus::Idle;
            state.stream_cancel = None;
        }
    }

    fn on_event(&self, event: Event) {
        if event.event == "endpoint" {
            if let Err(e) = self.set_endpoint(&event.data) {
                tracing::warn!(server = %self.name, error = %e, "ignoring endpoint frame");
            }
            return;
        }
        if !is_message_event(&event) {
            tracing::trace!(server = %self.name, event = %event.event, "ignoring event");
            return;
        }
        if event.data.trim().is_empty() {
            return;
        }
        let msg: Message = match serde_json::from_str(&event.data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "discarding malformed event");
                return;
            }
        };

        let event_id = if !event.id.is_empty() {
            Some(event.id)
        } else {
            msg.id.as_ref().map(ToString::to_string)
        };
        if let Some(event_id) = event_id {
            self.state.write().last_event_id = Some(event_id);
        }
        if self.is_replay_reply(&msg) {
            if let Some(error) = &msg.error {
                tracing::warn!(server = %self.name, error = %error.message, "server rejected replayed initialize");
                self.state.write().handshake = Handshake::Reset;
            }
            return;
        }
        self.dispatch(msg);
    }

    fn is_replay_reply(&self, msg: &Message) -> bool {
        if msg.method.is_some() || msg.id.is_none() {
            return false;
        }
        let mut state = self.state.write();
        if state.replay_id.is_some() && state.replay_id == msg.id {
            state.replay_id = None;
            return true;
        }
        false
    }
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(ACCEPT_STREAM))
}

fn is_message_event(event: &Event) -> bool {
    event.event.is_empty() || event.event == "message"
}

fn auth_required(response: &Response) -> McpError {
    let challenge = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    McpError::AuthRequired {
        resource_metadata: crate::auth::resource_metadata(&challenge),
        challenge,
    }
}
