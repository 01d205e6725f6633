//! Peer registry and per-network membership.
//!
//! One record per live connection, keyed by peer id. The membership sets
//! only ever contain announced peers with a live record, and their
//! `network_name` always equals the set's key; `mark_announced` moves a
//! peer between sets when a re-announce names a different network
//! (last-announce wins).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::SignalError;
use crate::models::{now_ms, DataMap};

/// Everything the server knows about one connected peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: String,
    pub connected_at: i64,
    pub last_activity: i64,
    pub announced_at: i64,
    pub remote_address: String,
    pub announced: bool,
    pub network_name: String,
    pub is_hub: bool,
    pub data: DataMap,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerRecord>,
    networks: HashMap<String, BTreeSet<String>>,
}

impl PeerRegistry {
    /// Create a record for a freshly accepted connection.
    ///
    /// Fails with `DuplicatePeer` when a live record exists; the connection
    /// manager resolves reconnects by removing the old record first.
    pub fn insert(&mut self, peer_id: &str, remote_addr: &str) -> Result<(), SignalError> {
        if self.peers.contains_key(peer_id) {
            return Err(SignalError::DuplicatePeer(peer_id.to_string()));
        }
        let now = now_ms();
        self.peers.insert(
            peer_id.to_string(),
            PeerRecord {
                peer_id: peer_id.to_string(),
                connected_at: now,
                last_activity: now,
                announced_at: 0,
                remote_address: remote_addr.to_string(),
                announced: false,
                network_name: String::new(),
                is_hub: false,
                data: DataMap::new(),
            },
        );
        Ok(())
    }

    /// Mark a peer announced into `network`. Idempotent; a different
    /// network on re-announce moves the membership entry.
    pub fn mark_announced(
        &mut self,
        peer_id: &str,
        network: &str,
        is_hub: bool,
        data: DataMap,
    ) -> Option<PeerRecord> {
        let record = self.peers.get_mut(peer_id)?;
        let previous = record.network_name.clone();

        record.announced = true;
        record.announced_at = now_ms();
        record.network_name = network.to_string();
        record.is_hub = is_hub;
        record.data = data;
        let snapshot = record.clone();

        if !previous.is_empty() && previous != network {
            self.drop_membership(&previous, peer_id);
        }
        self.networks
            .entry(network.to_string())
            .or_default()
            .insert(peer_id.to_string());

        Some(snapshot)
    }

    pub fn touch(&mut self, peer_id: &str) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.last_activity = now_ms();
        }
    }

    pub fn lookup(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Announced peers in `network`, ascending lexicographic order.
    pub fn active_in_network(&self, network: &str, exclude: Option<&str>) -> Vec<String> {
        match self.networks.get(network) {
            Some(set) => set
                .iter()
                .filter(|id| Some(id.as_str()) != exclude)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Remove a peer, clearing its membership. Returns the removed record.
    pub fn remove(&mut self, peer_id: &str) -> Option<PeerRecord> {
        let record = self.peers.remove(peer_id)?;
        if !record.network_name.is_empty() {
            self.drop_membership(&record.network_name, peer_id);
        }
        Some(record)
    }

    /// All currently-announced records, for mesh replay.
    pub fn announced(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self
            .peers
            .values()
            .filter(|r| r.announced)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    /// Network name → member count, for `/metrics`.
    pub fn network_sizes(&self) -> BTreeMap<String, usize> {
        self.networks
            .iter()
            .map(|(name, set)| (name.clone(), set.len()))
            .collect()
    }

    fn drop_membership(&mut self, network: &str, peer_id: &str) {
        if let Some(set) = self.networks.get_mut(network) {
            set.remove(peer_id);
            if set.is_empty() {
                self.networks.remove(network);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(c: char) -> String {
        std::iter::repeat(c).take(40).collect()
    }

    #[test]
    fn test_insert_and_duplicate() {
        let mut reg = PeerRegistry::default();
        reg.insert(&id('a'), "127.0.0.1").unwrap();
        assert!(matches!(
            reg.insert(&id('a'), "127.0.0.1"),
            Err(SignalError::DuplicatePeer(_))
        ));
        assert_eq!(reg.peer_count(), 1);
        assert!(!reg.lookup(&id('a')).unwrap().announced);
    }

    #[test]
    fn test_announce_populates_membership() {
        let mut reg = PeerRegistry::default();
        reg.insert(&id('a'), "x").unwrap();
        let rec = reg
            .mark_announced(&id('a'), "net1", false, DataMap::new())
            .unwrap();
        assert!(rec.announced);
        assert_eq!(rec.network_name, "net1");
        assert_eq!(reg.active_in_network("net1", None), vec![id('a')]);
        assert_eq!(reg.network_count(), 1);
    }

    #[test]
    fn test_announce_unknown_peer_is_none() {
        let mut reg = PeerRegistry::default();
        assert!(reg
            .mark_announced(&id('z'), "net1", false, DataMap::new())
            .is_none());
    }

    #[test]
    fn test_reannounce_moves_network() {
        let mut reg = PeerRegistry::default();
        reg.insert(&id('a'), "x").unwrap();
        reg.mark_announced(&id('a'), "net1", false, DataMap::new());
        reg.mark_announced(&id('a'), "net2", false, DataMap::new());

        assert!(reg.active_in_network("net1", None).is_empty());
        assert_eq!(reg.active_in_network("net2", None), vec![id('a')]);
        // the emptied set is gone entirely
        assert_eq!(reg.network_count(), 1);
    }

    #[test]
    fn test_active_is_sorted_and_excludes() {
        let mut reg = PeerRegistry::default();
        for c in ['c', 'a', 'b'] {
            reg.insert(&id(c), "x").unwrap();
            reg.mark_announced(&id(c), "net", false, DataMap::new());
        }
        assert_eq!(
            reg.active_in_network("net", None),
            vec![id('a'), id('b'), id('c')]
        );
        assert_eq!(
            reg.active_in_network("net", Some(&id('b'))),
            vec![id('a'), id('c')]
        );
    }

    #[test]
    fn test_remove_clears_membership() {
        let mut reg = PeerRegistry::default();
        reg.insert(&id('a'), "x").unwrap();
        reg.mark_announced(&id('a'), "net", false, DataMap::new());

        let removed = reg.remove(&id('a')).unwrap();
        assert_eq!(removed.network_name, "net");
        assert!(reg.lookup(&id('a')).is_none());
        assert!(reg.active_in_network("net", None).is_empty());
        assert_eq!(reg.network_count(), 0);
    }

    #[test]
    fn test_announced_listing() {
        let mut reg = PeerRegistry::default();
        reg.insert(&id('a'), "x").unwrap();
        reg.insert(&id('b'), "x").unwrap();
        reg.mark_announced(&id('b'), "net", true, DataMap::new());

        let announced = reg.announced();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].peer_id, id('b'));
        assert!(announced[0].is_hub);
    }
}
