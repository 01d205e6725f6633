//! HTTP and WebSocket handlers.
//!
//! The WebSocket side owns the connection lifecycle: upgrade-time checks,
//! last-writer-wins eviction of a reconnecting peer id, the per-socket read
//! loop, and disconnect cleanup. Writes to a socket are serialized through
//! its mailbox; the single writer task is the only thing touching the sink.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::discovery;
use crate::error::SignalError;
use crate::models::{now_ms, Envelope, ErrorResponse, HealthResponse, MessageType};
use crate::peer_id::is_valid_peer_id;
use crate::signaling;
use crate::state::{ConnectionHandle, SharedState};

// ── HTTP endpoints ──

pub async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let peers = {
        let registry = state.registry.read().await;
        (registry.peer_count(), registry.network_count())
    };
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: now_ms(),
        uptime: state.uptime_ms(),
        is_hub: state.config.is_hub,
        connections: state.connection_count().await,
        peers: peers.0,
        hubs: state.hubs.read().await.len(),
        networks: peers.1,
    })
}

pub async fn stats_handler(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let (peers, networks) = {
        let registry = state.registry.read().await;
        (registry.peer_count(), registry.network_count())
    };
    Json(json!({
        "isRunning": state.is_running(),
        "isHub": state.config.is_hub,
        "hubPeerId": state.hub_peer_id,
        "hubMeshNamespace": state.config.hub_mesh_namespace,
        "connections": state.connection_count().await,
        "peers": peers,
        "hubs": state.hubs.read().await.len(),
        "networks": networks,
        "bootstrapHubs": {
            "total": state.config.bootstrap_hubs.len(),
            "connected": state.mesh.connected_link_count().await,
        },
        "maxConnections": state.config.max_connections,
        "uptime": state.uptime_ms(),
        "host": state.config.host,
        "port": state.port(),
    }))
}

pub async fn hubs_handler(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let hubs: Vec<_> = state.hubs.read().await.values().cloned().collect();
    Json(json!({
        "timestamp": now_ms(),
        "totalHubs": hubs.len(),
        "hubs": hubs,
    }))
}

pub async fn hubstats_handler(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let hubs: Vec<_> = state.hubs.read().await.values().cloned().collect();
    Json(json!({
        "totalHubs": hubs.len(),
        "connectedHubs": hubs.len(),
        "hubs": hubs,
        "bootstrapHubs": state.mesh.link_stats().await,
    }))
}

pub async fn metrics_handler(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let (peers, networks, sizes) = {
        let registry = state.registry.read().await;
        (
            registry.peer_count(),
            registry.network_count(),
            registry.network_sizes(),
        )
    };
    Json(json!({
        "timestamp": now_ms(),
        "uptime_ms": state.uptime_ms(),
        "server": {
            "is_hub": state.config.is_hub,
            "namespace": state.config.hub_mesh_namespace,
        },
        "gauges": {
            "connections": state.connection_count().await,
            "max_connections": state.config.max_connections,
            "peers": peers,
            "networks": networks,
            "network_peers": sizes,
            "hubs": state.hubs.read().await.len(),
            "bootstrap_connected": state.mesh.connected_link_count().await,
        },
        "counters": state.metrics.snapshot(),
    }))
}

// ── WebSocket ──

fn refuse(error: SignalError) -> Response {
    let status = error.status();
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: status.as_u16(),
        }),
    )
        .into_response()
}

/// Upgrade handler for `/ws` and `/`. Auth and peer-id checks happen here,
/// before the upgrade, so a refused client sees a plain HTTP status.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<SharedState>,
) -> Response {
    let expected = &state.config.auth_token;
    if !expected.is_empty() {
        let bearer_ok = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t == expected)
            .unwrap_or(false);
        let query_ok = params.get("token").map(|t| t == expected).unwrap_or(false);
        if !bearer_ok && !query_ok {
            return refuse(SignalError::Unauthorized);
        }
    }

    let peer_id = params.get("peerId").cloned().unwrap_or_default();
    if !is_valid_peer_id(&peer_id) {
        return refuse(SignalError::InvalidPeerId);
    }

    ws.on_upgrade(move |socket| handle_socket(socket, peer_id, remote, state))
}

async fn handle_socket(
    socket: WebSocket,
    peer_id: String,
    remote: SocketAddr,
    state: SharedState,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Install the connection: evict any previous socket with this id
    // (last writer wins), then enforce the cap.
    let serial = {
        let mut conns = state.connections.write().await;
        if let Some(old) = conns.remove(&peer_id) {
            let _ = old.tx.send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "replaced by new connection".into(),
            })));
            let removed = state.registry.write().await.remove(&peer_id);
            if let Some(record) = removed {
                if record.is_hub {
                    state.hubs.write().await.remove(&peer_id);
                }
                if record.announced {
                    state.mesh.evict_cached(&record.network_name, &peer_id).await;
                }
            }
            tracing::info!(peer_id = %peer_id, "evicting stale connection for reconnecting peer");
        }

        if conns.len() >= state.config.max_connections {
            drop(conns);
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "max connections".into(),
                })))
                .await;
            tracing::warn!(peer_id = %peer_id, "connection refused: cap reached");
            return;
        }

        let serial = state.next_serial();
        conns.insert(
            peer_id.clone(),
            ConnectionHandle {
                serial,
                tx: tx.clone(),
            },
        );
        serial
    };

    if let Err(err) = state
        .registry
        .write()
        .await
        .insert(&peer_id, &remote.to_string())
    {
        // only reachable if a racing connection re-registered the id
        tracing::warn!(peer_id = %peer_id, error = %err, "registry insert failed");
    }
    state.metrics.connection_opened();
    tracing::info!(peer_id = %peer_id, remote = %remote, "peer_connected");

    let greeting = Envelope::system(
        MessageType::Connected,
        json!({"peerId": peer_id}),
        "global",
    );
    let _ = tx.send(Message::Text(greeting.to_text()));

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let mut reason = "connection closed";
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Dispatch::Goodbye = handle_message(&state, &peer_id, &text).await {
                    let _ = tx.send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "goodbye".into(),
                    })));
                    reason = "goodbye";
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(peer_id = %peer_id, error = %err, "socket read failed");
                reason = "socket error";
                break;
            }
        }
    }

    disconnect_peer(&state, &peer_id, serial, reason).await;
    writer.abort();
}

/// What the read loop should do after one inbound frame.
enum Dispatch {
    Continue,
    Goodbye,
}

async fn handle_message(state: &SharedState, peer_id: &str, text: &str) -> Dispatch {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(_) => {
            // malformed frames are dropped without disconnecting
            state.metrics.message_failed();
            return Dispatch::Continue;
        }
    };

    state.registry.write().await.touch(peer_id);
    state.metrics.message_processed();

    match envelope.kind {
        MessageType::Announce => {
            discovery::handle_announce(state, peer_id, envelope).await;
        }
        kind if kind.is_signal() => {
            signaling::handle_signal(state, peer_id, envelope).await;
        }
        MessageType::Ping => {
            let pong = Envelope::system(
                MessageType::Pong,
                json!({"timestamp": now_ms()}),
                "global",
            )
            .with_target(peer_id);
            state.send_to_peer(peer_id, &pong).await;
        }
        MessageType::Goodbye => {
            disconnect_goodbye(state, peer_id).await;
            return Dispatch::Goodbye;
        }
        MessageType::PeerDiscovered => {
            // mesh intake for hub connections; a no-op from plain clients
            if state.hubs.read().await.contains_key(peer_id) {
                crate::hub_mesh::handle_mesh_frame(
                    state,
                    crate::hub_mesh::MeshOrigin::HubConn(peer_id),
                    envelope,
                )
                .await;
            }
        }
        _ => {}
    }
    Dispatch::Continue
}

async fn disconnect_goodbye(state: &SharedState, peer_id: &str) {
    let serial = {
        let conns = state.connections.read().await;
        match conns.get(peer_id) {
            Some(handle) => handle.serial,
            None => return,
        }
    };
    disconnect_peer(state, peer_id, serial, "goodbye").await;
}

/// Tear down a peer: drop the connection, notify its network, clear the
/// registry, hub table, and cross-hub cache. A stale serial means this
/// socket was already evicted by a reconnect and the replacement owns the
/// record, so nothing is touched.
pub(crate) async fn disconnect_peer(
    state: &SharedState,
    peer_id: &str,
    serial: u64,
    reason: &str,
) {
    {
        let mut conns = state.connections.write().await;
        match conns.get(peer_id) {
            Some(handle) if handle.serial == serial => {
                conns.remove(peer_id);
            }
            _ => return,
        }
    }
    state.metrics.connection_closed();

    let (record, targets) = {
        let mut registry = state.registry.write().await;
        let record = registry.lookup(peer_id).cloned();
        let targets = record
            .as_ref()
            .filter(|r| r.announced)
            .map(|r| registry.active_in_network(&r.network_name, Some(peer_id)))
            .unwrap_or_default();
        registry.remove(peer_id);
        (record, targets)
    };
    let Some(record) = record else {
        return;
    };

    if record.is_hub {
        state.hubs.write().await.remove(peer_id);
    }
    if record.announced {
        state.mesh.evict_cached(&record.network_name, peer_id).await;
    }

    let network = if record.network_name.is_empty() {
        "global"
    } else {
        record.network_name.as_str()
    };
    let notice = Envelope::system(
        MessageType::PeerDisconnected,
        json!({
            "peerId": peer_id,
            "isHub": record.is_hub,
            "reason": reason,
            "timestamp": now_ms(),
        }),
        network,
    );
    for target in &targets {
        state
            .send_to_peer(target, &notice.clone().with_target(target))
            .await;
    }
    state.metrics.messages_broadcast(targets.len() as i64);
    tracing::info!(peer_id = %peer_id, reason = %reason, "peer_disconnected");
}
