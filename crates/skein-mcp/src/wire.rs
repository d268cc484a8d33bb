//! The transport seam between a [`Session`](crate::Session) and physical I/O.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::message::Message;

/// Callback a wire invokes for every inbound message.
///
/// The returned future performs the session-side handling. Wires that read
/// a stream spawn it as a task they own; the in-process server wire awaits it
/// inline so it can tell whether a reply was produced.
pub type WireHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// A bidirectional message transport.
#[async_trait]
pub trait Wire: Send + Sync {
    /// Begin delivering inbound messages to `handler`.
    async fn start(&self, handler: WireHandler) -> Result<()>;

    /// Transmit one message.
    async fn send(&self, msg: Message) -> Result<()>;

    /// Terminate the transport. With `delete_remote`, also ask the peer to
    /// drop any state it keeps for this connection (best effort).
    async fn close(&self, delete_remote: bool);

    /// Resolve once the transport has terminated.
    async fn wait(&self);

    /// Identifier the peer assigned to this connection, or empty.
    fn session_id(&self) -> String;
}
