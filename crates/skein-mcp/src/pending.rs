//! Request/response correlation table.
//!
//! Every connection owns one [`PendingRequests`]. A slot is registered with
//! [`PendingRequests::wait_for`] before the request leaves, and retired
//! exactly once: by delivery, by [`PendingRequests::done`], or by
//! [`PendingRequests::close`], which releases every waiter without a result.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::message::{Message, RequestId};

/// Outcome of [`PendingRequests::notify`].
#[derive(Debug)]
pub enum Notified {
    /// A registered slot took the message (or had already been abandoned).
    Delivered,
    /// Nobody was waiting on this id; the message is handed back.
    Unclaimed(Message),
}

#[derive(Default)]
struct Inner {
    waiters: HashMap<RequestId, oneshot::Sender<Message>>,
    closed: bool,
}

/// Per-connection map from correlation id to a one-shot delivery slot.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot for `id`.
    ///
    /// After [`close`](Self::close) the returned slot is already released.
    pub fn wait_for(&self, id: RequestId) -> PendingSlot<'_> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if !inner.closed && inner.waiters.insert(id.clone(), tx).is_some() {
            tracing::warn!(id = %id, "replaced an outstanding waiter with the same id");
        }
        PendingSlot {
            table: self,
            id,
            rx,
        }
    }

    /// Deliver a response to its waiter, retiring the slot.
    pub fn notify(&self, msg: Message) -> Notified {
        let Some(id) = msg.id.clone() else {
            return Notified::Unclaimed(msg);
        };
        let sender = self.inner.lock().waiters.remove(&id);
        match sender {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    tracing::trace!(id = %id, "waiter gave up before its response arrived");
                }
                Notified::Delivered
            }
            None => {
                tracing::debug!(id = %id, "response for unknown or abandoned request");
                Notified::Unclaimed(msg)
            }
        }
    }

    /// Discard the slot for `id` without delivering anything.
    pub fn done(&self, id: &RequestId) {
        self.inner.lock().waiters.remove(id);
    }

    /// Release every waiter with no result and refuse new registrations.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.waiters.clear();
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of outstanding slots.
    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receive side of a registered slot.
///
/// Dropping the slot retires it, so a caller that gives up never leaks an entry.
pub struct PendingSlot<'a> {
    table: &'a PendingRequests,
    id: RequestId,
    rx: oneshot::Receiver<Message>,
}

impl PendingSlot<'_> {
    /// Correlation id this slot waits on.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response. `None` means the slot was released without one.
    pub async fn recv(&mut self) -> Option<Message> {
        (&mut self.rx).await.ok()
    }

    /// Take the response if it has already arrived.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.table.done(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str) -> Message {
        Message::response(RequestId::from(id), json!({"ok": true}))
    }

    #[tokio::test]
    async fn test_notify_delivers_and_retires() {
        let table = PendingRequests::new();
        let mut slot = table.wait_for("a".into());
        assert_eq!(table.len(), 1);

        assert!(matches!(table.notify(response("a")), Notified::Delivered));
        assert!(table.is_empty());

        let msg = slot.recv().await.unwrap();
        assert_eq!(msg.result, Some(json!({"ok": true})));

        // A duplicate late delivery finds nobody waiting.
        assert!(matches!(table.notify(response("a")), Notified::Unclaimed(_)));
    }

    #[test]
    fn test_notify_unknown_id_hands_message_back() {
        let table = PendingRequests::new();
        match table.notify(response("zzz")) {
            Notified::Unclaimed(msg) => assert_eq!(msg.id, Some("zzz".into())),
            Notified::Delivered => panic!("nobody was waiting"),
        }
    }

    #[test]
    fn test_done_discards_slot() {
        let table = PendingRequests::new();
        let slot = table.wait_for("b".into());
        table.done(slot.id());
        assert!(table.is_empty());
        assert!(matches!(table.notify(response("b")), Notified::Unclaimed(_)));
    }

    #[test]
    fn test_dropping_slot_retires_it() {
        let table = PendingRequests::new();
        {
            let _slot = table.wait_for("c".into());
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let table = PendingRequests::new();
        let mut first = table.wait_for("x".into());
        let mut second = table.wait_for("y".into());

        table.close();
        assert!(first.recv().await.is_none());
        assert!(second.recv().await.is_none());
        assert!(table.is_closed());

        let mut late = table.wait_for("z".into());
        assert!(late.recv().await.is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_still_consumes_response() {
        let table = PendingRequests::new();
        let mut slot = table.wait_for("d".into());
        // Stopped listening but not retired yet.
        slot.rx.close();
        assert!(matches!(table.notify(response("d")), Notified::Delivered));
        assert!(table.is_empty());
    }
}
