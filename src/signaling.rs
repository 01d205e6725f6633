//! Signaling router: local forward or hub relay for offer / answer /
//! ice-candidate, with loop-suppressing dedup on the relay path.

use crate::hub_mesh::broadcast_to_mesh;
use crate::models::{now_ms, relay_key, Envelope};
use crate::state::SharedState;

/// Route one signaling message from a connected peer. Best-effort: the
/// sender is never told whether delivery happened.
pub async fn handle_signal(state: &SharedState, from: &str, envelope: Envelope) {
    let Some(target) = envelope
        .target_peer_id
        .clone()
        .filter(|t| !t.is_empty())
    else {
        return;
    };
    let network = envelope.network().to_string();

    let mut out = envelope.clone();
    out.from_peer_id = Some(
        envelope
            .from_peer_id
            .clone()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| from.to_string()),
    );
    out.network_name = Some(network.clone());
    out.timestamp = Some(now_ms());

    if state.is_connected(&target).await {
        // same-network check preserves network isolation
        let target_network = {
            let registry = state.registry.read().await;
            registry
                .lookup(&target)
                .map(|r| r.network_name.clone())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "global".to_string())
        };
        if network != target_network {
            return;
        }
        state.send_to_peer(&target, &out).await;
        tracing::debug!(
            from_peer = %from,
            target_peer = %target,
            kind = out.kind.as_str(),
            network = %network,
            "message_relayed"
        );
        return;
    }

    // not local: relay through the mesh exactly once per dedup window
    let key = relay_key(out.kind, from, &target, envelope.data.as_ref());
    if !state.mesh.record_relay(&key).await {
        return;
    }
    let sent = broadcast_to_mesh(state, &out.to_text(), None, Some(from)).await;
    if sent > 0 {
        state.metrics.cross_hub_message();
        tracing::debug!(
            from_peer = %from,
            target_peer = %target,
            kind = out.kind.as_str(),
            links = sent,
            "signal relayed to mesh"
        );
    }
}
