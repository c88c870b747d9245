//! Connection manager — health checks and bounded-retry reconnection.
//!
//! Exactly one instance per process owns the store handle; repositories go
//! through it and fail soft when the store is unavailable, so a missed poll
//! cycle never crashes the process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::StorageConfig;
use crate::error::{Result, WardenError};
use crate::store::DocumentStore;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Process-wide owner of the store session.
pub struct ConnectionManager {
    config: StorageConfig,
    store: Mutex<Option<Arc<DocumentStore>>>,
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            store: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Establish a session, retrying up to the configured attempt count with
    /// a fixed delay between attempts. Only after the last attempt fails is
    /// the store surfaced as unavailable.
    pub async fn connect(&self) -> Result<()> {
        let path = self.config.resolved_db_path();
        let busy_timeout = Duration::from_millis(self.config.busy_timeout_ms);
        let max_attempts = self.config.max_connect_attempts.max(1);

        self.set_state(ConnectionState::Connecting);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match DocumentStore::open(&path, busy_timeout) {
                Ok(store) => {
                    *self.store.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(store));
                    self.set_state(ConnectionState::Connected);
                    tracing::info!("🗄️ Store connected ({})", path.display());
                    return Ok(());
                }
                Err(e) if attempt < max_attempts => {
                    tracing::warn!(
                        "⚠️ Store connect attempt {attempt}/{max_attempts} failed: {e}, retrying in {}ms",
                        self.config.reconnect_delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.reconnect_delay_ms)).await;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(WardenError::Store(format!(
                        "store unavailable after {max_attempts} attempts: {e}"
                    )));
                }
            }
        }
    }

    /// Lightweight round-trip check. Never throws.
    pub fn is_healthy(&self) -> bool {
        match self.store() {
            Some(store) => store.ping(),
            None => false,
        }
    }

    /// Ping, and if the session is gone try one full reconnect cycle.
    pub async fn ensure_healthy(&self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        tracing::warn!("⚠️ Store unhealthy, attempting reconnect");
        self.set_state(ConnectionState::Disconnected);
        self.connect().await
    }

    /// Current store handle, if connected.
    pub fn store(&self) -> Option<Arc<DocumentStore>> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Teardown hook: drop the session on graceful shutdown.
    pub fn shutdown(&self) {
        *self.store.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("🗄️ Store connection closed");
    }
}
