//! Session storage for the HTTP multiplexer.
//!
//! Handlers look sessions up by the id carried in `Mcp-Session-Id` (or `?id=`).
//! Every operation is safe to call from concurrent request handlers.

use std::collections::HashMap;

use parking_lot::RwLock;
use skein_mcp::ServerSession;

/// Keyed storage of live server sessions.
pub trait SessionStore: Send + Sync {
    /// Insert or replace the session under its own id.
    fn store(&self, session: ServerSession);

    fn load(&self, id: &str) -> Option<ServerSession>;

    /// Remove and return the session in one step.
    fn load_and_delete(&self, id: &str) -> Option<ServerSession>;

    /// Ids of every stored session.
    fn ids(&self) -> Vec<String>;

    fn len(&self) -> usize {
        self.ids().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local store.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, ServerSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn store(&self, session: ServerSession) {
        let id = session.id();
        tracing::debug!(session_id = %id, "session stored");
        self.sessions.write().insert(id, session);
    }

    fn load(&self, id: &str) -> Option<ServerSession> {
        self.sessions.read().get(id).cloned()
    }

    fn load_and_delete(&self, id: &str) -> Option<ServerSession> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, "session removed");
        }
        removed
    }

    fn ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.sessions.read().len()
    }
}
