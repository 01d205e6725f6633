//! Wire envelope and HTTP response shapes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Network a peer lands in when `announce` carries no `networkName`.
pub const DEFAULT_NETWORK: &str = "global";

/// Sender id stamped on every server-originated message.
pub const SYSTEM_PEER: &str = "system";

/// Opaque attribute bag supplied in `announce`, preserved as-is.
pub type DataMap = Map<String, Value>;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Message types on the wire. Unknown strings deserialize to `Unknown`
/// so a bad frame never disconnects a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Announce,
    Offer,
    Answer,
    IceCandidate,
    Ping,
    Pong,
    Goodbye,
    Cleanup,
    Connected,
    PeerDiscovered,
    PeerDisconnected,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn is_signal(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Announce => "announce",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Goodbye => "goodbye",
            Self::Cleanup => "cleanup",
            Self::Connected => "connected",
            Self::PeerDiscovered => "peer-discovered",
            Self::PeerDisconnected => "peer-disconnected",
            Self::Unknown => "unknown",
        }
    }
}

/// The JSON envelope carried in every text frame, inbound and outbound.
/// Unknown fields are ignored on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "fromPeerId", default, skip_serializing_if = "Option::is_none")]
    pub from_peer_id: Option<String>,
    #[serde(
        rename = "targetPeerId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_peer_id: Option<String>,
    #[serde(
        rename = "networkName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub network_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// A server-originated message: `fromPeerId = "system"`, stamped now.
    pub fn system(kind: MessageType, data: Value, network: &str) -> Self {
        Self {
            kind,
            data: Some(data),
            from_peer_id: Some(SYSTEM_PEER.to_string()),
            target_peer_id: None,
            network_name: Some(network.to_string()),
            timestamp: Some(now_ms()),
        }
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target_peer_id = Some(target.to_string());
        self
    }

    /// Effective network name, defaulting blank/missing to `"global"`.
    pub fn network(&self) -> &str {
        self.network_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(DEFAULT_NETWORK)
    }

    /// The opaque data bag as a map, when it is one.
    pub fn data_map(&self) -> Option<&DataMap> {
        self.data.as_ref().and_then(Value::as_object)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Fingerprint of a signaling payload for relay dedup: a 64-bit
/// non-cryptographic hash of the canonical JSON text of `data`
/// (`serde_json` maps are key-ordered), rendered as 16 hex chars.
pub fn signal_fingerprint(data: Option<&Value>) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let canonical = data.map(Value::to_string).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Dedup key for a relayed signaling message.
pub fn relay_key(kind: MessageType, from: &str, target: &str, data: Option<&Value>) -> String {
    format!(
        "{}:{}:{}:{}",
        kind.as_str(),
        from,
        target,
        signal_fingerprint(data)
    )
}

/// Clone `data` and overlay `peerId` (and optionally `isHub`) on top of it.
pub fn merge_peer_data(data: &DataMap, peer_id: &str, is_hub: Option<bool>) -> Value {
    let mut out = data.clone();
    out.insert("peerId".to_string(), Value::String(peer_id.to_string()));
    if let Some(hub) = is_hub {
        out.insert("isHub".to_string(), Value::Bool(hub));
    }
    Value::Object(out)
}

// ── HTTP response shapes ──

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    pub uptime: i64,
    #[serde(rename = "isHub")]
    pub is_hub: bool,
    pub connections: usize,
    pub peers: usize,
    pub hubs: usize,
    pub networks: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::system(
            MessageType::PeerDiscovered,
            json!({"peerId": "ab", "isHub": false}),
            "net1",
        )
        .with_target("cd");

        let text = env.to_text();
        assert!(text.contains("\"type\":\"peer-discovered\""));
        assert!(text.contains("\"fromPeerId\":\"system\""));

        let parsed: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.kind, MessageType::PeerDiscovered);
        assert_eq!(parsed.target_peer_id.as_deref(), Some("cd"));
        assert_eq!(parsed.network(), "net1");
        assert!(parsed.timestamp.is_some());
    }

    #[test]
    fn test_unknown_type_and_fields_tolerated() {
        let parsed: Envelope =
            serde_json::from_str(r#"{"type":"frobnicate","data":1,"extra":"x"}"#).unwrap();
        assert_eq!(parsed.kind, MessageType::Unknown);
    }

    #[test]
    fn test_network_defaults_to_global() {
        let parsed: Envelope = serde_json::from_str(r#"{"type":"announce"}"#).unwrap();
        assert_eq!(parsed.network(), DEFAULT_NETWORK);

        let blank: Envelope =
            serde_json::from_str(r#"{"type":"announce","networkName":"  "}"#).unwrap();
        assert_eq!(blank.network(), DEFAULT_NETWORK);
    }

    #[test]
    fn test_fingerprint_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":{"x":true}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":{"x":true},"a":1}"#).unwrap();
        assert_eq!(signal_fingerprint(Some(&a)), signal_fingerprint(Some(&b)));
        assert_eq!(signal_fingerprint(Some(&a)).len(), 16);
    }

    #[test]
    fn test_fingerprint_differs_on_body() {
        let a: Value = json!({"sdp": "x"});
        let b: Value = json!({"sdp": "y"});
        assert_ne!(signal_fingerprint(Some(&a)), signal_fingerprint(Some(&b)));
    }

    #[test]
    fn test_relay_key_shape() {
        let data = json!({"sdp": "x"});
        let key = relay_key(MessageType::Offer, "aa", "bb", Some(&data));
        assert!(key.starts_with("offer:aa:bb:"));
    }

    #[test]
    fn test_merge_peer_data_overlays() {
        let mut bag = DataMap::new();
        bag.insert("name".into(), json!("alice"));
        bag.insert("peerId".into(), json!("stale"));

        let merged = merge_peer_data(&bag, "fresh", Some(true));
        assert_eq!(merged["peerId"], "fresh");
        assert_eq!(merged["isHub"], true);
        assert_eq!(merged["name"], "alice");
    }
}
