//! Discovery engine: `announce` handling and the per-network fan-out.
//!
//! For a single announce the steps run strictly in order: register, fan
//! out to the network, backfill the new peer with existing peers, backfill
//! from the cross-hub cache, then propagate outward through the mesh.
//! Concurrent announces only promise per-connection FIFO.

use serde_json::Value;

use crate::hub_mesh::{self, broadcast_to_mesh, HubRecord};
use crate::models::{merge_peer_data, now_ms, DataMap, Envelope, MessageType};
use crate::state::SharedState;

pub async fn handle_announce(state: &SharedState, peer_id: &str, envelope: Envelope) {
    let network = envelope.network().to_string();
    let data: DataMap = envelope.data_map().cloned().unwrap_or_default();
    let hub_flag = data.get("isHub").and_then(Value::as_bool).unwrap_or(false);
    let is_hub = hub_flag || network == state.config.hub_mesh_namespace;

    // 1+2: mark announced and join the membership set
    let record = {
        let mut registry = state.registry.write().await;
        registry.mark_announced(peer_id, &network, is_hub, data.clone())
    };
    if record.is_none() {
        // record vanished under us (disconnect raced the announce)
        return;
    }
    state.metrics.peer_announced();
    tracing::info!(peer_id = %peer_id, network = %network, is_hub, "peer_announced");

    if is_hub {
        register_hub(state, peer_id, &network, &data).await;
    }

    // 3: tell everyone already in the network about the new peer
    let others = {
        let registry = state.registry.read().await;
        registry.active_in_network(&network, Some(peer_id))
    };
    let discovered = merge_peer_data(&data, peer_id, Some(is_hub));
    for other in &others {
        let note = Envelope::system(MessageType::PeerDiscovered, discovered.clone(), &network)
            .with_target(other);
        if state.send_to_peer(other, &note).await {
            state.metrics.peer_discovered();
        }
    }
    state.metrics.messages_broadcast(others.len() as i64);

    // 4: backfill the new peer with everyone already there
    let existing = {
        let registry = state.registry.read().await;
        others
            .iter()
            .filter_map(|id| registry.lookup(id).cloned())
            .collect::<Vec<_>>()
    };
    for record in existing {
        let note = Envelope::system(
            MessageType::PeerDiscovered,
            merge_peer_data(&record.data, &record.peer_id, Some(record.is_hub)),
            &network,
        )
        .with_target(peer_id);
        state.send_to_peer(peer_id, &note).await;
    }

    // 5: backfill from the cross-hub cache, skipping locally-connected ids
    for (cached_id, cached_data) in state.mesh.cached_peers(&network).await {
        if state.is_connected(&cached_id).await {
            continue;
        }
        let note = Envelope::system(
            MessageType::PeerDiscovered,
            merge_peer_data(&cached_data, &cached_id, None),
            &network,
        )
        .with_target(peer_id);
        state.send_to_peer(peer_id, &note).await;
    }

    // 6: propagate the announcement through the mesh
    let outward = Envelope::system(MessageType::PeerDiscovered, discovered, &network).to_text();
    let sent = broadcast_to_mesh(state, &outward, None, Some(peer_id)).await;
    if sent > 0 {
        state.metrics.cross_hub_message();
        tracing::debug!(peer_id = %peer_id, network = %network, links = sent, "bootstrap_announcement");
    }

    // a newly announced hub gets our full peer list, mirroring what we
    // replay when we dial outward
    if is_hub {
        for replay in hub_mesh::peer_replay_envelopes(state).await {
            if replay
                .data_map()
                .and_then(|d| d.get("peerId"))
                .and_then(Value::as_str)
                == Some(peer_id)
            {
                continue;
            }
            state.send_to_peer(peer_id, &replay).await;
        }
    }
}

async fn register_hub(state: &SharedState, peer_id: &str, network: &str, data: &DataMap) {
    let now = now_ms();
    let mut hubs = state.hubs.write().await;
    hubs.insert(
        peer_id.to_string(),
        HubRecord {
            peer_id: peer_id.to_string(),
            registered_at: now,
            last_activity: now,
            network_name: network.to_string(),
            data: data.clone(),
        },
    );
}
