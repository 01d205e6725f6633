//! Hub mesh: cross-hub state and frame intake.
//!
//! `HubMeshState` owns the three mesh tables: bootstrap links, the
//! cross-hub peer cache, and the relay-dedup set. A mesh frame can arrive
//! two ways, on an outbound bootstrap link (`bootstrap` module read task)
//! or on an inbound client connection that announced itself as a hub, and
//! both feed [`handle_mesh_frame`], so a single one-directional link
//! propagates discovery and relays signaling in both directions.

pub mod bootstrap;

use std::collections::HashMap;

use axum::extract::ws::Message;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::models::{merge_peer_data, now_ms, DataMap, Envelope, MessageType};
use crate::state::{AppState, SharedState};

/// Relay-dedup entries older than this are swept by housekeeping.
pub const RELAY_DEDUP_MAX_AGE_MS: i64 = 5_000;

/// A peer promoted to hub, via the explicit flag or the reserved namespace.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubRecord {
    pub peer_id: String,
    pub registered_at: i64,
    pub last_activity: i64,
    pub network_name: String,
    pub data: DataMap,
}

/// One configured bootstrap URI and the state of its outbound link.
#[derive(Debug)]
pub struct BootstrapLink {
    pub uri: String,
    pub connected: bool,
    pub last_attempt: i64,
    pub attempt: u32,
    tx: Option<mpsc::UnboundedSender<String>>,
}

/// Mesh tables; exclusively owned here, accessed through these methods.
#[derive(Debug, Default)]
pub struct HubMeshState {
    links: Mutex<HashMap<String, BootstrapLink>>,
    cache: Mutex<HashMap<String, HashMap<String, DataMap>>>,
    relayed: Mutex<HashMap<String, i64>>,
}

impl HubMeshState {
    // ── bootstrap link table ──

    pub async fn note_attempt(&self, uri: &str, attempt: u32) {
        let mut links = self.links.lock().await;
        let link = links.entry(uri.to_string()).or_insert_with(|| BootstrapLink {
            uri: uri.to_string(),
            connected: false,
            last_attempt: 0,
            attempt: 0,
            tx: None,
        });
        link.last_attempt = now_ms();
        link.attempt = attempt;
        link.connected = false;
        link.tx = None;
    }

    pub async fn link_opened(&self, uri: &str, tx: mpsc::UnboundedSender<String>) {
        let mut links = self.links.lock().await;
        if let Some(link) = links.get_mut(uri) {
            link.connected = true;
            link.tx = Some(tx);
        }
    }

    pub async fn link_closed(&self, uri: &str) {
        let mut links = self.links.lock().await;
        if let Some(link) = links.get_mut(uri) {
            link.connected = false;
            link.tx = None;
        }
    }

    pub async fn remove_link(&self, uri: &str) {
        self.links.lock().await.remove(uri);
    }

    /// Drop every link; closing the mailboxes ends the writer tasks.
    pub async fn clear_links(&self) {
        self.links.lock().await.clear();
    }

    pub async fn connected_link_count(&self) -> usize {
        self.links.lock().await.values().filter(|l| l.connected).count()
    }

    pub async fn link_senders(
        &self,
        exclude: Option<&str>,
    ) -> Vec<(String, mpsc::UnboundedSender<String>)> {
        self.links
            .lock()
            .await
            .values()
            .filter(|l| l.connected && Some(l.uri.as_str()) != exclude)
            .filter_map(|l| l.tx.clone().map(|tx| (l.uri.clone(), tx)))
            .collect()
    }

    /// Per-link snapshot for `/hubstats`.
    pub async fn link_stats(&self) -> Vec<Value> {
        self.links
            .lock()
            .await
            .values()
            .map(|l| {
                serde_json::json!({
                    "uri": l.uri,
                    "connected": l.connected,
                    "lastAttempt": l.last_attempt,
                    "attemptNumber": l.attempt,
                })
            })
            .collect()
    }

    // ── relay dedup ──

    /// Record a relay fingerprint. Returns false when it was already seen
    /// inside the dedup window, meaning the caller must drop the message.
    pub async fn record_relay(&self, key: &str) -> bool {
        let mut relayed = self.relayed.lock().await;
        if relayed.contains_key(key) {
            return false;
        }
        relayed.insert(key.to_string(), now_ms());
        true
    }

    /// Sweep dedup entries older than `max_age_ms`. Returns how many went.
    pub async fn sweep_relayed(&self, max_age_ms: i64) -> usize {
        let cutoff = now_ms() - max_age_ms;
        let mut relayed = self.relayed.lock().await;
        let before = relayed.len();
        relayed.retain(|_, ts| *ts >= cutoff);
        before - relayed.len()
    }

    // ── cross-hub peer cache ──

    pub async fn cache_peer(&self, network: &str, peer_id: &str, data: DataMap) {
        self.cache
            .lock()
            .await
            .entry(network.to_string())
            .or_default()
            .insert(peer_id.to_string(), data);
    }

    /// Cached peers for a network, ascending by id.
    pub async fn cached_peers(&self, network: &str) -> Vec<(String, DataMap)> {
        let cache = self.cache.lock().await;
        let mut out: Vec<(String, DataMap)> = cache
            .get(network)
            .map(|peers| peers.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn evict_cached(&self, network: &str, peer_id: &str) {
        let mut cache = self.cache.lock().await;
        if let Some(peers) = cache.get_mut(network) {
            peers.remove(peer_id);
            if peers.is_empty() {
                cache.remove(network);
            }
        }
    }
}

/// Where a mesh frame came in.
#[derive(Debug, Clone, Copy)]
pub enum MeshOrigin<'a> {
    /// An outbound bootstrap link, by URI.
    Link(&'a str),
    /// An inbound connection from a hub-promoted peer, by peer id.
    HubConn(&'a str),
}

impl<'a> MeshOrigin<'a> {
    fn excludes(&self) -> (Option<&'a str>, Option<&'a str>) {
        match *self {
            MeshOrigin::Link(uri) => (Some(uri), None),
            MeshOrigin::HubConn(id) => (None, Some(id)),
        }
    }
}

/// A mesh neighbor we can write a frame to: an outbound bootstrap link or
/// an inbound hub connection.
pub enum MeshTarget {
    Link {
        uri: String,
        tx: mpsc::UnboundedSender<String>,
    },
    HubConn {
        peer_id: String,
        tx: mpsc::UnboundedSender<Message>,
    },
}

impl MeshTarget {
    pub fn send(&self, text: &str) -> bool {
        match self {
            MeshTarget::Link { tx, .. } => tx.send(text.to_string()).is_ok(),
            MeshTarget::HubConn { tx, .. } => tx.send(Message::Text(text.to_string())).is_ok(),
        }
    }
}

/// Every mesh neighbor, minus the optional exclusions. Locks are taken one
/// at a time, never nested.
pub async fn mesh_targets(
    state: &AppState,
    exclude_link: Option<&str>,
    exclude_conn: Option<&str>,
) -> Vec<MeshTarget> {
    let mut out: Vec<MeshTarget> = state
        .mesh
        .link_senders(exclude_link)
        .await
        .into_iter()
        .map(|(uri, tx)| MeshTarget::Link { uri, tx })
        .collect();

    let hub_ids: Vec<String> = {
        let hubs = state.hubs.read().await;
        hubs.keys()
            .filter(|id| Some(id.as_str()) != exclude_conn)
            .cloned()
            .collect()
    };
    let conns = state.connections.read().await;
    for id in hub_ids {
        if let Some(handle) = conns.get(&id) {
            out.push(MeshTarget::HubConn {
                peer_id: id,
                tx: handle.tx.clone(),
            });
        }
    }
    out
}

/// Write a frame to every mesh neighbor. Returns how many got it.
pub async fn broadcast_to_mesh(
    state: &AppState,
    text: &str,
    exclude_link: Option<&str>,
    exclude_conn: Option<&str>,
) -> usize {
    mesh_targets(state, exclude_link, exclude_conn)
        .await
        .iter()
        .filter(|t| t.send(text))
        .count()
}

async fn send_to_origin(state: &AppState, origin: &MeshOrigin<'_>, text: &str) {
    match origin {
        MeshOrigin::Link(uri) => {
            if let Some((_, tx)) = state
                .mesh
                .link_senders(None)
                .await
                .into_iter()
                .find(|(u, _)| u == uri)
            {
                let _ = tx.send(text.to_string());
            }
        }
        MeshOrigin::HubConn(peer_id) => {
            let conns = state.connections.read().await;
            if let Some(handle) = conns.get(*peer_id) {
                let _ = handle.tx.send(Message::Text(text.to_string()));
            }
        }
    }
}

/// Replay payloads for every announced local peer, one `peer-discovered`
/// envelope each, carrying the peer's own network.
pub async fn peer_replay_envelopes(state: &AppState) -> Vec<Envelope> {
    let announced = { state.registry.read().await.announced() };
    announced
        .into_iter()
        .map(|rec| {
            Envelope::system(
                MessageType::PeerDiscovered,
                serde_json::json!({
                    "peerId": rec.peer_id,
                    "isHub": rec.network_name == state.config.hub_mesh_namespace,
                }),
                &rec.network_name,
            )
        })
        .collect()
}

/// Dispatch one frame received from a mesh neighbor.
pub async fn handle_mesh_frame(state: &SharedState, origin: MeshOrigin<'_>, envelope: Envelope) {
    match envelope.kind {
        MessageType::PeerDiscovered => handle_remote_discovery(state, origin, envelope).await,
        kind if kind.is_signal() => {
            let Some(target) = envelope
                .target_peer_id
                .clone()
                .filter(|t| !t.is_empty())
            else {
                return;
            };
            if state.is_connected(&target).await {
                let mut out = envelope;
                out.timestamp = Some(now_ms());
                state.send_to_peer(&target, &out).await;
                tracing::debug!(
                    target_peer = %target,
                    kind = out.kind.as_str(),
                    "message_relayed"
                );
            }
        }
        _ => {}
    }
}

async fn handle_remote_discovery(state: &SharedState, origin: MeshOrigin<'_>, envelope: Envelope) {
    let Some(obj) = envelope.data_map().cloned() else {
        return;
    };
    let Some(peer_id) = obj.get("peerId").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let is_hub = obj.get("isHub").and_then(Value::as_bool).unwrap_or(false);
    let network = envelope.network().to_string();

    if is_hub {
        tracing::info!(hub_id = %peer_id, "hub_discovered");
        return;
    }

    // An announcement naming one of our own peers is the far side's ack of
    // something we sent; re-processing it would bounce between hubs forever.
    if state.is_connected(&peer_id).await {
        tracing::debug!(peer_id = %peer_id, "discovery_acknowledged");
        return;
    }

    state.mesh.cache_peer(&network, &peer_id, obj.clone()).await;
    state.metrics.peer_discovered();

    let targets = { state.registry.read().await.active_in_network(&network, None) };
    let forward = Envelope::system(
        MessageType::PeerDiscovered,
        Value::Object(obj.clone()),
        &network,
    );
    for target in &targets {
        state.send_to_peer(target, &forward).await;
    }

    let gossip = Envelope::system(
        MessageType::PeerDiscovered,
        merge_peer_data(&obj, &peer_id, Some(false)),
        &network,
    )
    .to_text();

    let (exclude_link, exclude_conn) = origin.excludes();
    let sent = broadcast_to_mesh(state, &gossip, exclude_link, exclude_conn).await;
    if sent > 0 {
        state.metrics.cross_hub_message();
    }

    // Single echo back so the sender knows the announcement was accepted.
    send_to_origin(state, &origin, &gossip).await;
}
