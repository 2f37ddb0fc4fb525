//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use parley_core::backend::Backends;
use parley_core::config::{Config, SessionSettings};

/// Shared gateway state accessible from all connections.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub backends: Backends,
    /// Resolved once at startup and copied into every session.
    pub settings: SessionSettings,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    /// Cancelled on server shutdown; every session holds a child token.
    pub shutdown: CancellationToken,
}

/// Per-connection bookkeeping.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub session_id: String,
    pub connected_at: Instant,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, backends: Backends) -> Self {
        let settings = config.session_settings();
        Self {
            config,
            backends,
            settings,
            connections: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn register(&self, session_id: &str) {
        self.connections.write().await.insert(
            session_id.to_string(),
            ConnectionState {
                session_id: session_id.to_string(),
                connected_at: Instant::now(),
            },
        );
    }

    pub async fn unregister(&self, session_id: &str) -> Option<ConnectionState> {
        self.connections.write().await.remove(session_id)
    }

    pub async fn session_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
