//! Session environment carried on inbound HTTP requests.
//!
//! `Authorization: Bearer <t>` becomes `http:bearer-token`, and each
//! `X-Nanobot-Env-<KEY>` header becomes `KEY` (upper-cased, `-` as `_`).

use std::collections::HashMap;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

/// Env key holding the caller's bearer token.
pub const BEARER_TOKEN_KEY: &str = "http:bearer-token";

/// Prefix of headers copied into the session env (lower-case, as stored by `http`).
pub const ENV_HEADER_PREFIX: &str = "x-nanobot-env-";

/// Build the env for one request: `base`, then headers on top.
pub fn extract_env(headers: &HeaderMap, base: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = base.clone();

    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        env.insert(BEARER_TOKEN_KEY.to_string(), token.to_string());
    }

    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix(ENV_HEADER_PREFIX) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        match value.to_str() {
            Ok(value) => {
                env.insert(key.to_ascii_uppercase().replace('-', "_"), value.to_string());
            }
            Err(_) => tracing::debug!(header = %name, "skipping non-text env header"),
        }
    }
    env
}
