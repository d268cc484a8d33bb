//! HTTP routes.

pub mod health;
pub mod mcp;

pub use health::{health_routes, healthz};
pub use mcp::{
    SESSION_ID_HEADER, SessionQuery, delete_handler, mcp_routes, post_handler, stream_handler,
};
