//! End-to-end tests: a real bound server driven by the HTTP client wire.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use skein_mcp::protocol::{ClientCapabilities, ListRootsResult, Root, RootsCapability, ServerInfo};
use skein_mcp::{ClientHandler, ClientOptions, McpClient, McpServerConfig, Session, ToolServer};
use skein_server::ServerConfig;

fn client_config(server: &common::TestServer) -> McpServerConfig {
    McpServerConfig::http("e2e", server.mcp_url())
}

#[tokio::test]
async fn test_initialize_list_and_call() -> Result<()> {
    let server = common::TestServer::start().await?;
    let client = McpClient::connect(client_config(&server)).await?;

    let init = client.initialize().await?;
    assert_eq!(init.protocol_version, "2025-06-18");
    assert_eq!(init.server_info.name, "skein-test");

    let session_id = client.session().id();
    assert!(!session_id.is_empty());
    assert!(server.server.state().store.load(&session_id).is_some());

    let names: Vec<String> = client.list_tools().await?.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["count_roots", "echo", "env"]);

    let result = client
        .call_tool("echo", Some(json!({"message": "over http"})), None)
        .await?;
    assert!(!result.is_error);
    assert_eq!(result.joined_text(), "over http");

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_request_headers_become_session_env() -> Result<()> {
    let server = common::TestServer::start_with(
        Arc::new(common::demo_tools()),
        ServerConfig::default().with_env_var("TIER", "gold"),
    )
    .await?;
    let config = client_config(&server)
        .with_header("X-Nanobot-Env-Region", "eu")
        .with_bearer_token("secret");
    let client = McpClient::connect(config).await?;
    client.initialize().await?;

    for (key, expected) in [("REGION", "eu"), ("TIER", "gold"), ("http:bearer-token", "secret")] {
        let result = client.call_tool("env", Some(json!({"key": key})), None).await?;
        assert_eq!(result.joined_text(), expected, "env key {key}");
    }

    client.shutdown().await;
    Ok(())
}

struct TwoRoots;

#[async_trait]
impl ClientHandler for TwoRoots {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            roots: Some(RootsCapability::default()),
            ..Default::default()
        }
    }

    async fn list_roots(&self, _session: &Session) -> skein_mcp::Result<ListRootsResult> {
        Ok(ListRootsResult {
            roots: vec![
                Root {
                    uri: "file:///src".into(),
                    name: None,
                },
                Root {
                    uri: "file:///docs".into(),
                    name: None,
                },
            ],
        })
    }
}

#[tokio::test]
async fn test_server_request_travels_over_event_stream() -> Result<()> {
    let server = common::TestServer::start().await?;
    let client = McpClient::connect_with(
        client_config(&server),
        ClientOptions::default().with_handler(Arc::new(TwoRoots)),
    )
    .await?;
    client.initialize().await?;

    // The event stream opens in the background after the handshake.
    let id = client.session().id();
    server
        .wait_until(|s| {
            s.state()
                .store
                .load(&id)
                .is_some_and(|session| session.wire().has_reader())
        })
        .await?;

    let result = client.call_tool("count_roots", None, None).await?;
    assert!(!result.is_error, "tool failed: {}", result.joined_text());
    assert_eq!(result.joined_text(), "2 roots");

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_client_shutdown_deletes_session() -> Result<()> {
    let server = common::TestServer::start().await?;
    let client = McpClient::connect(client_config(&server)).await?;
    client.initialize().await?;
    let id = client.session().id();
    assert_eq!(server.server.state().store.len(), 1);

    client.shutdown().await;
    assert!(server.server.state().store.load(&id).is_none());

    let resp = server
        .client
        .post(server.mcp_url())
        .header("Mcp-Session-Id", &id)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 404);
    Ok(())
}

#[tokio::test]
async fn test_forgotten_session_is_reinitialized() -> Result<()> {
    let server = common::TestServer::start().await?;
    let client = McpClient::connect(client_config(&server)).await?;
    client.initialize().await?;
    let first = client.session().id();

    let forgotten = server.server.state().store.load_and_delete(&first).unwrap();
    forgotten.close().await;

    let tools = client.list_tools().await?;
    assert_eq!(tools.len(), 3);

    let second = client.session().id();
    assert_ne!(first, second);
    assert!(server.server.state().store.load(&second).is_some());

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_healthz_reflects_tool_listing() -> Result<()> {
    let healthy = common::TestServer::start().await?;
    healthy
        .wait_until(|s| s.state().health.status() != skein_server::HealthStatus::Pending)
        .await?;
    assert_eq!(healthy.healthz().await?, (200, "ok".to_string()));

    let empty = common::TestServer::start_with(
        Arc::new(ToolServer::new(ServerInfo::new("empty", "0"))),
        ServerConfig::default().with_health_interval(Duration::from_secs(3600)),
    )
    .await?;
    empty
        .wait_until(|s| s.state().health.status() != skein_server::HealthStatus::Pending)
        .await?;
    let (status, body) = empty.healthz().await?;
    assert_eq!(status, 503);
    assert!(body.contains("no tools from server"), "body: {body}");

    healthy.server.shutdown().await;
    empty.server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_raw_post_without_session_requires_initialize() -> Result<()> {
    let server = common::TestServer::start().await?;
    let resp = server
        .client
        .post(server.mcp_url())
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 405);
    Ok(())
}
