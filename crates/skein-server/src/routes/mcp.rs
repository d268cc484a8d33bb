//! MCP endpoint: POST for messages, GET for the outbound event stream,
//! DELETE to end a session.
//!
//! Sessions are keyed by the `Mcp-Session-Id` header. The `?id=` query
//! parameter is accepted as a fallback for clients on the legacy SSE transport.

use std::convert::Infallible;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::post,
};
use serde::Deserialize;
use skein_mcp::{McpError, Message, RpcError, ServerSession, SessionOptions};

use crate::env::extract_env;
use crate::error::{Result, ServerError};
use crate::state::AppState;

/// `Mcp-Session-Id`, as stored by `http`.
pub const SESSION_ID_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

/// Query fallback for the session id.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub id: Option<String>,
}

/// Routes for the MCP endpoint mounted at `path`.
pub fn mcp_routes(path: &str) -> Router<AppState> {
    Router::new().route(
        path,
        post(post_handler).get(stream_handler).delete(delete_handler),
    )
}

fn header_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn session_id(headers: &HeaderMap, query: SessionQuery) -> Option<String> {
    header_session_id(headers).or(query.id.filter(|id| !id.is_empty()))
}

fn load(state: &AppState, id: &str) -> Result<ServerSession> {
    state
        .store
        .load(id)
        .ok_or_else(|| ServerError::NotFound(format!("session {}", id)))
}

fn apply_env(state: &AppState, session: &ServerSession, headers: &HeaderMap) -> Result<()> {
    let env = extract_env(headers, &state.config.env);
    if !env.is_empty() {
        session.session().merge_env(env)?;
    }
    Ok(())
}

/// POST - deliver one message.
pub async fn post_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let msg = match Message::from_slice(&body) {
        Ok(msg) => msg,
        Err(error) => return Ok(parse_error(error)),
    };
    tracing::trace!(method = %msg.method_name(), id = ?msg.id, "inbound message");

    match (header_session_id(&headers), query.id) {
        (Some(id), _) => exchange_existing(&state, &id, &headers, msg).await,
        (None, Some(id)) => dispatch_legacy(&state, &id, &headers, msg),
        (None, None) => initialize(&state, &headers, msg).await,
    }
}

fn parse_error(error: RpcError) -> Response {
    tracing::warn!(error = %error, "malformed message body");
    (
        StatusCode::BAD_REQUEST,
        Json(Message::error_response(None, error)),
    )
        .into_response()
}

async fn exchange_existing(
    state: &AppState,
    id: &str,
    headers: &HeaderMap,
    msg: Message,
) -> Result<Response> {
    let session = load(state, id)?;
    apply_env(state, &session, headers)?;

    match session.exchange(msg).await {
        Ok(reply) => Ok(Json(reply).into_response()),
        Err(McpError::NoResponse) => Ok(StatusCode::ACCEPTED.into_response()),
        Err(McpError::ConnectionClosed) => {
            state.store.load_and_delete(id);
            Err(ServerError::NotFound(format!("session {}", id)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Legacy SSE clients get their replies on the stream, never in the POST body.
fn dispatch_legacy(state: &AppState, id: &str, headers: &HeaderMap, msg: Message) -> Result<Response> {
    let session = load(state, id)?;
    apply_env(state, &session, headers)?;
    session.send(msg)?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn initialize(state: &AppState, headers: &HeaderMap, msg: Message) -> Result<Response> {
    if !msg.is_initialize() {
        return Err(ServerError::MethodNotAllowed(format!(
            "{} requires a session id",
            msg.method_name()
        )));
    }

    let session = ServerSession::new(
        state.handler.clone(),
        SessionOptions::default().with_name("http"),
    )
    .await?;
    let id = session.id();
    let header = HeaderValue::from_str(&id)
        .map_err(|e| ServerError::Internal(format!("invalid session id: {}", e)))?;

    let reply = match apply_env(state, &session, headers) {
        Ok(()) => session.exchange(msg).await,
        Err(e) => {
            session.close().await;
            return Err(e);
        }
    };
    let reply = match reply {
        Ok(reply) => reply,
        Err(e) => {
            session.close().await;
            return Err(e.into());
        }
    };

    if reply.error.is_some() {
        session.close().await;
        return Ok(Json(reply).into_response());
    }

    tracing::info!(session_id = %id, "session initialized");
    state.store.store(session);
    Ok(([(SESSION_ID_HEADER, header)], Json(reply)).into_response())
}

/// GET - attach the session's single outbound reader as an event stream.
pub async fn stream_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let id = session_id(&headers, query)
        .ok_or_else(|| ServerError::BadRequest("missing session id".to_string()))?;
    let session = load(&state, &id)?;
    let reader = session
        .start_reading()
        .ok_or_else(|| ServerError::Conflict(format!("session {} already has a reader", id)))?;
    tracing::debug!(session_id = %id, "event stream opened");

    let stream = async_stream::stream! {
        while let Some(msg) = reader.next().await {
            match Event::default().json_data(&msg) {
                Ok(event) => yield Ok::<Event, Infallible>(event),
                Err(e) => tracing::warn!(error = %e, "failed to encode outbound message"),
            }
        }
        tracing::debug!("event stream closed");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

/// DELETE - remove the session and close its transport.
pub async fn delete_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let id = session_id(&headers, query)
        .ok_or_else(|| ServerError::BadRequest("missing session id".to_string()))?;
    let session = state
        .store
        .load_and_delete(&id)
        .ok_or_else(|| ServerError::NotFound(format!("session {}", id)))?;
    session.close().await;
    tracing::info!(session_id = %id, "session deleted");
    Ok(StatusCode::OK)
}
