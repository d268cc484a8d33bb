//! JSON-RPC 2.0 message envelope and error model.
//!
//! One [`Message`] type carries requests, notifications and responses; which
//! one it is follows from which members are present (see [`MessageKind`]).

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Well-known MCP method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const PROGRESS: &str = "notifications/progress";
    pub const LOG_MESSAGE: &str = "notifications/message";
    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";
    pub const ELICITATION_CREATE: &str = "elicitation/create";
    pub const ROOTS_LIST: &str = "roots/list";

    /// Prefix shared by every notification method.
    pub const NOTIFICATION_PREFIX: &str = "notifications/";
}

// ─────────────────────────────────────────────────────────────────────────────
// Correlation ids
// ─────────────────────────────────────────────────────────────────────────────

/// Correlation id linking a request to its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    String(String),
    /// Any other JSON number (beyond `i64`, or fractional), echoed verbatim.
    Other(serde_json::Number),
}

impl RequestId {
    /// Mint a fresh random id.
    pub fn random() -> Self {
        Self::String(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
            Self::Other(n) => write!(f, "{}", n),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes
impl RpcError {
    /// Parse error - Invalid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Invalid Request - Not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid params.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(Self::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, message)
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Derive an error with `context` appended to the message, keeping the code.
    pub fn with_context(&self, context: impl fmt::Display) -> Self {
        Self {
            code: self.code,
            message: format!("{}: {}", self.message, context),
            data: self.data.clone(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " ({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// What a message is, derived from the members it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `id` and `method`: expects a reply.
    Request,
    /// `method` without `id`: fire-and-forget.
    Notification,
    /// `id` without `method`: answers an earlier request.
    Response,
    /// Neither `id` nor `method`.
    Invalid,
}

/// A JSON-RPC message travelling in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// JSON-RPC version (always "2.0").
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// Correlation id; absent on notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name on requests and notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Result on a successful response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on a failed response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

impl Message {
    fn empty() -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Build a request. The id is left unset; `Session::exchange` assigns one.
    pub fn request<P: Serialize + ?Sized>(method: impl Into<String>, params: &P) -> Result<Self> {
        Ok(Self {
            method: Some(method.into()),
            params: non_null(serde_json::to_value(params)?),
            ..Self::empty()
        })
    }

    /// Build a notification.
    pub fn notification<P: Serialize + ?Sized>(
        method: impl Into<String>,
        params: &P,
    ) -> Result<Self> {
        Self::request(method, params)
    }

    /// Build a successful response.
    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Build an error response.
    pub fn error_response(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            error: Some(error),
            ..Self::empty()
        }
    }

    /// Decode one message, mapping malformed input to a parse error.
    pub fn from_slice(data: &[u8]) -> std::result::Result<Self, RpcError> {
        serde_json::from_slice(data).map_err(|e| RpcError::parse_error(e.to_string()))
    }

    /// Classify this message.
    pub fn kind(&self) -> MessageKind {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => MessageKind::Request,
            (None, Some(_)) => MessageKind::Notification,
            (Some(_), None) => MessageKind::Response,
            (None, None) => MessageKind::Invalid,
        }
    }

    /// Whether the sender waits for a reply to this message.
    pub fn expects_reply(&self) -> bool {
        self.kind() == MessageKind::Request
    }

    /// Method name, or an empty string on responses.
    pub fn method_name(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }

    /// Whether the method is the handshake.
    pub fn is_initialize(&self) -> bool {
        self.method_name() == methods::INITIALIZE
    }

    /// Decode `params` into `T`. Missing params decode from `{}`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        let params = self
            .params
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(serde_json::from_value(params)?)
    }

    /// Reply to this message with `result`.
    pub fn reply<R: Serialize + ?Sized>(&self, result: &R) -> Result<Self> {
        let mut result = serde_json::to_value(result)?;
        if result.is_null() {
            result = Value::Object(Default::default());
        }
        Ok(Self {
            id: self.id.clone(),
            result: Some(result),
            ..Self::empty()
        })
    }

    /// Reply to this message with an error.
    pub fn error_reply(&self, error: RpcError) -> Self {
        Self::error_response(self.id.clone(), error)
    }

    /// Progress token under `params._meta.progressToken`.
    pub fn progress_token(&self) -> Option<&Value> {
        self.params
            .as_ref()?
            .get("_meta")?
            .get("progressToken")
            .filter(|t| !t.is_null())
    }

    /// Store a progress token under `params._meta.progressToken`.
    ///
    /// Params that are not an object are replaced.
    pub fn set_progress_token(&mut self, token: impl Into<Value>) {
        let params = self
            .params
            .get_or_insert_with(|| Value::Object(Default::default()));
        if !params.is_object() {
            *params = Value::Object(Default::default());
        }
        if let Value::Object(map) = params {
            let meta = map
                .entry("_meta")
                .or_insert_with(|| Value::Object(Default::default()));
            if !meta.is_object() {
                *meta = Value::Object(Default::default());
            }
            if let Value::Object(meta) = meta {
                meta.insert("progressToken".to_string(), token.into());
            }
        }
    }
}

fn non_null(value: Value) -> Option<Value> {
    (!value.is_null()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let mut req = Message::request("initialize", &json!({"test": true})).unwrap();
        req.id = Some(RequestId::Number(1));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains("result"));
    }

    #[test]
    fn test_kind_classification() {
        let note = Message::notification(methods::INITIALIZED, &()).unwrap();
        assert_eq!(note.kind(), MessageKind::Notification);
        assert!(note.params.is_none());

        let mut req = Message::request(methods::PING, &json!({})).unwrap();
        req.id = Some("abc".into());
        assert_eq!(req.kind(), MessageKind::Request);
        assert!(req.expects_reply());

        let resp: Message = serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#)
            .unwrap();
        assert_eq!(resp.kind(), MessageKind::Response);
        assert_eq!(resp.id, Some(RequestId::String("abc".into())));
    }

    #[test]
    fn test_numeric_and_string_ids() {
        let resp: Message = serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#)
            .unwrap();
        assert_eq!(resp.id, Some(RequestId::Number(7)));
        assert_eq!(RequestId::from("x").to_string(), "x");
        assert_eq!(RequestId::from(42).to_string(), "42");
    }

    #[test]
    fn test_unusual_numeric_ids_are_echoed() {
        let big: Message =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":18446744073709551615,"method":"ping"}"#)
                .unwrap();
        let id = big.id.clone().unwrap();
        assert!(matches!(id, RequestId::Other(_)));
        assert_eq!(id.to_string(), "18446744073709551615");
        let reply = Message::response(id.clone(), serde_json::json!({}));
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire["id"], serde_json::json!(18446744073709551615u64));

        let frac: Message =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#).unwrap();
        let id = frac.id.unwrap();
        assert_eq!(id.to_string(), "1.5");
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!(1.5));
        assert_ne!(id, RequestId::Number(1));
    }

    #[test]
    fn test_parse_error_on_malformed_input() {
        let err = Message::from_slice(b"{not json").unwrap_err();
        assert_eq!(err.code, RpcError::PARSE_ERROR);
    }

    #[test]
    fn test_error_with_context_keeps_code() {
        let err = RpcError::method_not_found("no such method").with_data(json!({"m": "x"}));
        let derived = err.with_context("tools/frob");
        assert_eq!(derived.code, RpcError::METHOD_NOT_FOUND);
        assert_eq!(derived.message, "no such method: tools/frob");
        assert_eq!(derived.data, err.data);
        assert_eq!(
            derived.to_string(),
            r#"-32601: no such method: tools/frob ({"m":"x"})"#
        );
    }

    #[test]
    fn test_error_reply_addresses_same_id() {
        let mut req = Message::request("tools/frob", &json!({})).unwrap();
        req.id = Some(RequestId::Number(9));
        let reply = req.error_reply(RpcError::internal("boom"));
        assert_eq!(reply.id, Some(RequestId::Number(9)));
        assert_eq!(reply.kind(), MessageKind::Response);
        assert!(reply.result.is_none());
        assert_eq!(reply.error.unwrap().code, RpcError::INTERNAL_ERROR);
    }

    #[test]
    fn test_progress_token_roundtrip() {
        let mut req = Message::request("tools/call", &json!({"name": "slow"})).unwrap();
        assert!(req.progress_token().is_none());

        req.set_progress_token("tok-1");
        assert_eq!(req.progress_token(), Some(&json!("tok-1")));
        assert_eq!(req.params.as_ref().unwrap()["name"], "slow");

        let mut bare = Message::request("tools/call", &()).unwrap();
        bare.set_progress_token(5);
        assert_eq!(bare.progress_token(), Some(&json!(5)));
    }

    #[test]
    fn test_reply_null_becomes_empty_object() {
        let mut req = Message::request(methods::PING, &()).unwrap();
        req.id = Some(RequestId::Number(1));
        let reply = req.reply(&()).unwrap();
        assert_eq!(reply.result, Some(json!({})));
    }
}
