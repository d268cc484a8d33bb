//! Credential collaborator for the HTTP wire.
//!
//! Discovery and token exchange live outside this crate. The wire only needs
//! to turn a `401` challenge into an HTTP client that carries credentials.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use url::Url;

use crate::error::{McpError, Result};

/// A `WWW-Authenticate` challenge received from an MCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Server that issued the challenge.
    pub server_url: Url,
    /// `resource_metadata` parameter, when the server advertised one.
    pub resource_metadata: Option<String>,
    /// Raw header value.
    pub header: String,
}

impl AuthChallenge {
    pub fn new(server_url: Url, header: impl Into<String>) -> Self {
        let header = header.into();
        Self {
            server_url,
            resource_metadata: resource_metadata(&header),
            header,
        }
    }
}

/// Extract the `resource_metadata` parameter from a `WWW-Authenticate` value.
pub fn resource_metadata(header: &str) -> Option<String> {
    let start = header.find("resource_metadata=")? + "resource_metadata=".len();
    let rest = &header[start..];
    let value = match rest.strip_prefix('"') {
        Some(quoted) => &quoted[..quoted.find('"')?],
        None => rest.split([',', ' ']).next().unwrap_or_default(),
    };
    (!value.is_empty()).then(|| value.to_string())
}

/// Whether a `WWW-Authenticate` value reports the presented token as
/// expired or revoked (RFC 6750 `invalid_token`).
pub fn rejects_token(header: &str) -> bool {
    header
        .split(',')
        .filter_map(|param| param.trim().rsplit_once("error="))
        .any(|(_, value)| value.trim_matches('"') == "invalid_token")
}

/// Supplies credentialed HTTP clients.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Obtain a client that satisfies `challenge`.
    async fn obtain_client(&self, challenge: &AuthChallenge) -> Result<reqwest::Client>;

    /// A previously obtained client for `server_url`, if one is cached.
    async fn cached_client(&self, _server_url: &Url) -> Option<reqwest::Client> {
        None
    }
}

/// Authenticator that answers every challenge with one fixed bearer token.
pub struct StaticBearer {
    token: String,
}

impl StaticBearer {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    fn client(&self) -> Result<reqwest::Client> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| McpError::transport(format!("invalid bearer token: {}", e)))?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(reqwest::Client::builder().default_headers(headers).build()?)
    }
}

#[async_trait]
impl Authenticator for StaticBearer {
    async fn obtain_client(&self, challenge: &AuthChallenge) -> Result<reqwest::Client> {
        tracing::debug!(server = %challenge.server_url, "answering challenge with static bearer token");
        self.client()
    }

    async fn cached_client(&self, _server_url: &Url) -> Option<reqwest::Client> {
        self.client().ok()
    }
}
