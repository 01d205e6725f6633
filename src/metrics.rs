//! Process-wide counters exposed through `GET /metrics`.

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::{json, Value};

use crate::models::now_ms;

/// Monotonic counters. Gauges (live connections, peers, networks) come from
/// the owning maps at snapshot time, not from here.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_opened: AtomicI64,
    connections_closed: AtomicI64,
    peers_announced: AtomicI64,
    peers_discovered: AtomicI64,
    messages_processed: AtomicI64,
    message_errors: AtomicI64,
    messages_broadcast: AtomicI64,
    cross_hub_messages: AtomicI64,
    bootstrap_connects: AtomicI64,
    last_cleanup_ms: AtomicI64,
}

impl Metrics {
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_announced(&self) {
        self.peers_announced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_discovered(&self) {
        self.peers_discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_failed(&self) {
        self.message_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_broadcast(&self, count: i64) {
        self.messages_broadcast.fetch_add(count, Ordering::Relaxed);
    }

    pub fn cross_hub_message(&self) {
        self.cross_hub_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bootstrap_connected(&self) {
        self.bootstrap_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cleanup_performed(&self) {
        self.last_cleanup_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Counter portion of the `/metrics` payload.
    pub fn snapshot(&self) -> Value {
        json!({
            "connections": {
                "opened": self.connections_opened.load(Ordering::Relaxed),
                "closed": self.connections_closed.load(Ordering::Relaxed),
            },
            "peers": {
                "announced": self.peers_announced.load(Ordering::Relaxed),
                "discovered": self.peers_discovered.load(Ordering::Relaxed),
            },
            "messages": {
                "processed": self.messages_processed.load(Ordering::Relaxed),
                "errors": self.message_errors.load(Ordering::Relaxed),
                "broadcast": self.messages_broadcast.load(Ordering::Relaxed),
            },
            "hubs": {
                "cross_hub_messages": self.cross_hub_messages.load(Ordering::Relaxed),
                "bootstrap_connects": self.bootstrap_connects.load(Ordering::Relaxed),
            },
            "last_cleanup": self.last_cleanup_ms.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::default();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        m.peer_announced();
        m.messages_broadcast(3);
        m.message_failed();

        let snap = m.snapshot();
        assert_eq!(snap["connections"]["opened"], 2);
        assert_eq!(snap["connections"]["closed"], 1);
        assert_eq!(snap["peers"]["announced"], 1);
        assert_eq!(snap["messages"]["broadcast"], 3);
        assert_eq!(snap["messages"]["errors"], 1);
    }

    #[test]
    fn test_cleanup_stamp() {
        let m = Metrics::default();
        assert_eq!(m.snapshot()["last_cleanup"], 0);
        m.cleanup_performed();
        assert!(m.snapshot()["last_cleanup"].as_i64().unwrap() > 0);
    }
}
