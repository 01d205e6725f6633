//! Outbound bootstrap links.
//!
//! One task per configured URI: dial, announce ourselves into the hub-mesh
//! namespace, replay our announced peers, then consume mesh frames until
//! the socket dies. Redials keep going until the attempt cap, after which
//! the link entry is forgotten.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::models::{now_ms, Envelope, MessageType};
use crate::state::SharedState;

use super::{handle_mesh_frame, peer_replay_envelopes, MeshOrigin};

/// Delay before the first dial, letting the listener come up.
const WARMUP: Duration = Duration::from_secs(1);

/// Start the mesh client: one link task per bootstrap URI, after a short
/// warmup. No-op unless hub mode is on and at least one URI is configured.
pub fn spawn(state: SharedState) {
    if !state.config.is_hub || state.config.bootstrap_hubs.is_empty() {
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(WARMUP).await;
        for uri in state.config.bootstrap_hubs.clone() {
            let state = state.clone();
            tokio::spawn(async move {
                run_link(state, uri).await;
            });
        }
    });
}

/// Drive one bootstrap link through dial / session / reconnect until the
/// attempt cap is hit or the server stops.
async fn run_link(state: SharedState, uri: String) {
    if dials_self(&state, &uri) {
        tracing::debug!(uri = %uri, "skipping bootstrap uri that points at ourselves");
        return;
    }

    let mut attempt: u32 = 0;
    loop {
        if !state.is_running() {
            break;
        }
        state.mesh.note_attempt(&uri, attempt).await;

        match connect_async(dial_url(&state, &uri)).await {
            Ok((socket, _)) => {
                run_session(&state, &uri, socket).await;
            }
            Err(err) => {
                tracing::warn!(uri = %uri, error = %err, attempt, "bootstrap dial failed");
            }
        }

        attempt += 1;
        if attempt > state.config.max_reconnect_attempts {
            tracing::warn!(uri = %uri, "bootstrap retry cap exceeded, forgetting hub");
            state.mesh.remove_link(&uri).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(state.config.reconnect_interval_ms)).await;
    }
    state.mesh.remove_link(&uri).await;
}

async fn run_session(
    state: &SharedState,
    uri: &str,
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state.mesh.link_opened(uri, tx.clone()).await;
    state.metrics.bootstrap_connected();
    tracing::info!(uri = %uri, "hub_connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    announce_self(state, &tx);
    for replay in peer_replay_envelopes(state).await {
        let _ = tx.send(replay.to_text());
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Ok(envelope) = serde_json::from_str::<Envelope>(&text) {
                    handle_mesh_frame(state, MeshOrigin::Link(uri), envelope).await;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(uri = %uri, error = %err, "bootstrap read failed");
                break;
            }
        }
    }

    writer.abort();
    state.mesh.link_closed(uri).await;
    tracing::info!(uri = %uri, "hub_disconnected");
}

/// Announce ourselves to the remote hub, inside the mesh namespace.
fn announce_self(state: &SharedState, tx: &mpsc::UnboundedSender<String>) {
    let announce = Envelope {
        kind: MessageType::Announce,
        data: Some(serde_json::json!({
            "isHub": true,
            "port": state.port(),
            "host": state.config.host,
            "capabilities": ["signaling", "relay"],
            "timestamp": now_ms(),
        })),
        from_peer_id: None,
        target_peer_id: None,
        network_name: Some(state.config.hub_mesh_namespace.clone()),
        timestamp: Some(now_ms()),
    };
    let _ = tx.send(announce.to_text());
}

fn dial_url(state: &SharedState, uri: &str) -> String {
    let hub_id = state.hub_peer_id.as_deref().unwrap_or_default();
    format!("{uri}?peerId={hub_id}")
}

/// True when the URI resolves to our own bind endpoint.
fn dials_self(state: &SharedState, uri: &str) -> bool {
    match Url::parse(uri) {
        Ok(url) => {
            url.host_str() == Some(state.config.host.as_str())
                && url.port_or_known_default() == Some(state.port())
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::state::AppState;
    use std::sync::Arc;

    fn hub_state(host: &str, port: u16) -> SharedState {
        let state = Arc::new(AppState::new(ServerConfig {
            is_hub: true,
            host: host.to_string(),
            ..ServerConfig::default()
        }));
        state.set_port(port);
        state
    }

    #[test]
    fn test_self_dial_guard() {
        let state = hub_state("localhost", 3000);
        assert!(dials_self(&state, "ws://localhost:3000"));
        assert!(dials_self(&state, "ws://localhost:3000/ws"));
        assert!(!dials_self(&state, "ws://localhost:3001"));
        assert!(!dials_self(&state, "ws://otherhost:3000"));
        assert!(!dials_self(&state, "not a uri"));
    }

    #[test]
    fn test_dial_url_carries_hub_identity() {
        let state = hub_state("localhost", 3000);
        let url = dial_url(&state, "ws://remote:4000/ws");
        let hub_id = state.hub_peer_id.as_deref().unwrap();
        assert_eq!(url, format!("ws://remote:4000/ws?peerId={hub_id}"));
    }
}
