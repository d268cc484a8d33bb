//! Application state shared across handlers.

use std::sync::Arc;

use skein_mcp::MessageHandler;

use crate::config::ServerConfig;
use crate::health::HealthMonitor;
use crate::store::{InMemorySessionStore, SessionStore};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,

    /// Handler every new session is bound to.
    pub handler: Arc<dyn MessageHandler>,

    /// Live sessions keyed by id.
    pub store: Arc<dyn SessionStore>,

    /// Latest health-check outcome.
    pub health: Arc<HealthMonitor>,
}

impl AppState {
    /// Create a new application state with an in-memory session store.
    pub fn new(handler: Arc<dyn MessageHandler>, config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            health: Arc::new(HealthMonitor::new(handler.clone())),
            handler,
            store: Arc::new(InMemorySessionStore::new()),
        }
    }

    /// Replace the session store.
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }
}
