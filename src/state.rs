//! Shared server state.
//!
//! Three mutable regions, each behind its own lock: the connection map, the
//! peer registry, and the hub state (bootstrap links, cross-hub cache,
//! relay dedup; see `hub_mesh`). Lock order is connections → registry →
//! hubs → hub state; senders are collected under a lock and written to
//! after it is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::{mpsc, RwLock};

use crate::config::ServerConfig;
use crate::hub_mesh::{HubMeshState, HubRecord};
use crate::metrics::Metrics;
use crate::models::{now_ms, Envelope};
use crate::peer_id::generate_peer_id;
use crate::registry::PeerRegistry;

/// Handle to one client socket: the outbound mailbox plus a serial that
/// tells an evicted socket's teardown apart from its replacement's.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub serial: u64,
    pub tx: mpsc::UnboundedSender<Message>,
}

pub struct AppState {
    pub config: ServerConfig,
    pub metrics: Metrics,
    /// Mesh identity when running in hub mode.
    pub hub_peer_id: Option<String>,
    pub connections: RwLock<HashMap<String, ConnectionHandle>>,
    pub registry: RwLock<PeerRegistry>,
    pub hubs: RwLock<HashMap<String, HubRecord>>,
    pub mesh: HubMeshState,
    start_time: i64,
    running: AtomicBool,
    port: AtomicU16,
    next_serial: AtomicU64,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let hub_peer_id = config.is_hub.then(generate_peer_id);
        Self {
            config,
            metrics: Metrics::default(),
            hub_peer_id,
            connections: RwLock::new(HashMap::new()),
            registry: RwLock::new(PeerRegistry::default()),
            hubs: RwLock::new(HashMap::new()),
            mesh: HubMeshState::default(),
            start_time: now_ms(),
            running: AtomicBool::new(false),
            port: AtomicU16::new(0),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// The actually bound port, once the listener is up.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst);
    }

    pub fn uptime_ms(&self) -> i64 {
        now_ms() - self.start_time
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Enqueue an envelope on a local peer's socket. Returns false when the
    /// peer is not connected (best-effort, never an error).
    pub async fn send_to_peer(&self, peer_id: &str, envelope: &Envelope) -> bool {
        let text = envelope.to_text();
        let conns = self.connections.read().await;
        match conns.get(peer_id) {
            Some(handle) => handle.tx.send(Message::Text(text)).is_ok(),
            None => false,
        }
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.connections.read().await.contains_key(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageType;
    use serde_json::json;

    #[tokio::test]
    async fn test_hub_identity_only_in_hub_mode() {
        let plain = AppState::new(ServerConfig::default());
        assert!(plain.hub_peer_id.is_none());

        let hub = AppState::new(ServerConfig {
            is_hub: true,
            ..ServerConfig::default()
        });
        let id = hub.hub_peer_id.as_deref().unwrap();
        assert!(crate::peer_id::is_valid_peer_id(id));
    }

    #[tokio::test]
    async fn test_send_to_peer_enqueues() {
        let state = AppState::new(ServerConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.connections.write().await.insert(
            "ab".to_string(),
            ConnectionHandle { serial: 1, tx },
        );

        let env = Envelope::system(MessageType::Pong, json!({"timestamp": 1}), "global");
        assert!(state.send_to_peer("ab", &env).await);
        assert!(!state.send_to_peer("missing", &env).await);

        match rx.recv().await.unwrap() {
            Message::Text(text) => assert!(text.contains("\"pong\"")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_serials_are_unique() {
        let state = AppState::new(ServerConfig::default());
        let a = state.next_serial();
        let b = state.next_serial();
        assert_ne!(a, b);
    }
}
