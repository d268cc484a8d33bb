//! Serve a [`ServerSession`] over a newline-delimited stdio pair.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{McpError, Result};
use crate::message::Message;
use crate::server_session::ServerSession;
use crate::session::{MessageHandler, SessionOptions};
use crate::stdio::StdioWire;
use crate::wire::{Wire, WireHandler};

/// Bridges a stdio wire to an in-process server session.
///
/// Every inbound line is exchanged with the session and any reply is written
/// back. Messages the server originates (progress, logging, requests to the
/// client) are pumped from the session's reader to the same output.
pub struct StdioServer {
    wire: Arc<StdioWire>,
    session: ServerSession,
    tasks: TaskTracker,
    done: CancellationToken,
}

impl StdioServer {
    /// Serve `handler` on this process's stdin/stdout.
    pub async fn from_process_stdio(handler: Arc<dyn MessageHandler>) -> Result<Self> {
        Self::new(StdioWire::from_process_stdio("stdio"), handler, SessionOptions::default()).await
    }

    /// Serve `handler` over an arbitrary reader/writer pair.
    pub async fn over(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        Self::new(StdioWire::new("stdio", reader, writer), handler, SessionOptions::default()).await
    }

    async fn new(
        wire: StdioWire,
        handler: Arc<dyn MessageHandler>,
        options: SessionOptions,
    ) -> Result<Self> {
        let wire = Arc::new(wire);
        let session = ServerSession::new(handler, options).await?;
        let tasks = TaskTracker::new();
        let done = CancellationToken::new();

        let reader = session
            .start_reading()
            .ok_or_else(|| McpError::transport("server session already has a reader"))?;
        let pump_wire = wire.clone();
        let pump_done = done.clone();
        tasks.spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = pump_done.cancelled() => break,
                    msg = reader.next() => msg,
                };
                let Some(msg) = msg else { break };
                if let Err(e) = pump_wire.send(msg).await {
                    tracing::warn!(error = %e, "failed to write server message");
                    break;
                }
            }
        });

        let bridge_session = session.clone();
        let bridge_wire = wire.clone();
        let on_line: WireHandler = Arc::new(move |msg: Message| -> BoxFuture<'static, ()> {
            let session = bridge_session.clone();
            let wire = bridge_wire.clone();
            Box::pin(async move {
                match session.exchange(msg).await {
                    Ok(reply) => {
                        if let Err(e) = wire.send(reply).await {
                            tracing::warn!(error = %e, "failed to write reply");
                        }
                    }
                    Err(McpError::NoResponse) => {}
                    Err(e) => tracing::warn!(error = %e, "exchange failed"),
                }
            })
        });
        wire.start(on_line).await?;

        Ok(Self {
            wire,
            session,
            tasks,
            done,
        })
    }

    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    /// Run until the input reaches EOF, then shut everything down.
    pub async fn run(self) {
        self.wire.wait().await;
        tracing::debug!("stdio input closed");
        self.shutdown().await;
    }

    pub async fn shutdown(&self) {
        self.done.cancel();
        self.tasks.close();
        self.wire.shutdown().await;
        self.session.close().await;
        self.tasks.wait().await;
    }
}
