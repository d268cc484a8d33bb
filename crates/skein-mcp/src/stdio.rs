//! Newline-delimited JSON over a byte stream pair.
//!
//! Used both for talking to a child process (client role) and for serving on
//! the current process's stdin/stdout (server role).

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{McpError, Result};
use crate::message::Message;
use crate::wire::{Wire, WireHandler};

/// Longest line accepted from the peer (10 MiB).
pub const MAX_LINE_LENGTH: usize = 10 * 1024 * 1024;

type Reader = Pin<Box<dyn AsyncRead + Send>>;
type Writer = Pin<Box<dyn AsyncWrite + Send>>;

/// Wire over a reader/writer pair, one JSON message per line.
pub struct StdioWire {
    name: String,
    reader: parking_lot::Mutex<Option<Reader>>,
    writer: tokio::sync::Mutex<Writer>,
    child: parking_lot::Mutex<Option<Child>>,
    closed: CancellationToken,
    tasks: TaskTracker,
}

impl StdioWire {
    /// Wrap an existing reader/writer pair.
    pub fn new(
        name: impl Into<String>,
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            reader: parking_lot::Mutex::new(Some(Box::pin(reader))),
            writer: tokio::sync::Mutex::new(Box::pin(writer)),
            child: parking_lot::Mutex::new(None),
            closed: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Serve on this process's stdin/stdout.
    pub fn from_process_stdio(name: impl Into<String>) -> Self {
        Self::new(name, tokio::io::stdin(), tokio::io::stdout())
    }

    /// Spawn `command` and talk to it over its stdin/stdout.
    ///
    /// # Arguments
    /// * `command` - The command to spawn (e.g., "mcp-server-sqlite")
    /// * `args` - Arguments to pass to the command
    /// * `env` - Extra environment variables
    pub fn spawn(
        name: impl Into<String>,
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::spawn_failed(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::spawn_failed("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::spawn_failed("failed to capture stdout"))?;

        let wire = Self::new(name, stdout, stdin);
        *wire.child.lock() = Some(child);
        Ok(wire)
    }

    /// Close and wait for the reader and every handler task to finish.
    pub async fn shutdown(&self) {
        self.close(false).await;
        self.tasks.wait().await;
    }
}

#[async_trait]
impl Wire for StdioWire {
    async fn start(&self, handler: WireHandler) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| McpError::transport("stdio wire already started"))?;

        let name = self.name.clone();
        let closed = self.closed.clone();
        let tasks = self.tasks.clone();
        self.tasks.spawn(async move {
            let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            loop {
                let line = tokio::select! {
                    _ = closed.cancelled() => break,
                    next = lines.next() => next,
                };
                match line {
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => match serde_json::from_str::<Message>(&line) {
                        Ok(msg) => {
                            tasks.spawn(handler(msg));
                        }
                        Err(e) => {
                            tracing::warn!(server = %name, error = %e, "discarding malformed line");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(server = %name, error = %e, "stdio read failed");
                        break;
                    }
                    None => {
                        tracing::debug!(server = %name, "stdio reached EOF");
                        break;
                    }
                }
            }
            closed.cancel();
        });
        Ok(())
    }

    async fn send(&self, msg: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(McpError::ConnectionClosed);
        }
        let mut line = serde_json::to_vec(&msg)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self, _delete_remote: bool) {
        self.closed.cancel();
        self.tasks.close();
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                tracing::debug!(server = %self.name, error = %e, "child already exited");
            }
            let _ = child.wait().await;
        }
    }

    async fn wait(&self) {
        self.closed.cancelled().await;
    }

    fn session_id(&self) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::mpsc;

    fn recording_handler() -> (WireHandler, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: WireHandler = Arc::new(move |msg| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg);
            })
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_reads_one_message_per_line() {
        let (mut peer, local) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(local);
        let wire = StdioWire::new("test", read_half, write_half);
        let (handler, mut inbound) = recording_handler();
        wire.start(handler).await.unwrap();

        peer.write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/a\"}\n\nnot json\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n")
            .await
            .unwrap();

        let first = inbound.recv().await.unwrap();
        let second = inbound.recv().await.unwrap();
        let mut methods = vec![first.method_name().to_string(), second.method_name().to_string()];
        methods.sort();
        assert_eq!(methods, vec!["".to_string(), "notifications/a".to_string()]);
    }

    #[tokio::test]
    async fn test_send_writes_newline_terminated_json() {
        let (peer, local) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(local);
        let wire = StdioWire::new("test", read_half, write_half);

        wire.send(Message::response(7.into(), json!({"ok": true})))
            .await
            .unwrap();

        let mut lines = BufReader::new(peer).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let msg: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(msg.id, Some(7.into()));
    }

    #[tokio::test]
    async fn test_eof_terminates_wire() {
        let (peer, local) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(local);
        let wire = StdioWire::new("test", read_half, write_half);
        let (handler, _inbound) = recording_handler();
        wire.start(handler).await.unwrap();

        drop(peer);
        wire.wait().await;
        assert!(matches!(
            wire.send(Message::response(1.into(), json!({}))).await,
            Err(McpError::ConnectionClosed)
        ));
        wire.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_peer, local) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(local);
        let wire = StdioWire::new("test", read_half, write_half);
        let (handler, _rx) = recording_handler();
        wire.start(handler.clone()).await.unwrap();
        assert!(wire.start(handler).await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let result = StdioWire::spawn("test", "nonexistent-mcp-server-12345", &[], &[]);
        assert!(matches!(result, Err(McpError::SpawnFailed(_))));
    }
}
