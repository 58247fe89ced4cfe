//! The peer table.
//!
//! Keyed by IP address, upserted on HERE, evicted on inactivity or transfer
//! failure. Readers take a full clone under the lock rather than holding it
//! across a callback, the same deep-copy-on-read pattern `BanList` and
//! `AddrMan` use for their own peer sets — this keeps the discovery dispatch
//! path from lock-coupling with whatever a callback does next.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::config::PEER_CLEANUP;
use crate::util::now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub last_seen: u64,
}

#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<IpAddr, Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer's ports and last-seen timestamp.
    pub fn upsert(&self, ip: IpAddr, udp_port: u16, tcp_port: u16) {
        let mut peers = self.peers.lock().unwrap();
        peers.insert(ip, Peer { ip, udp_port, tcp_port, last_seen: now() });
    }

    pub fn get(&self, ip: &IpAddr) -> Option<Peer> {
        self.peers.lock().unwrap().get(ip).copied()
    }

    pub fn remove(&self, ip: &IpAddr) -> Option<Peer> {
        self.peers.lock().unwrap().remove(ip)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.peers.lock().unwrap().contains_key(ip)
    }

    /// Deep copy of the current peer set.
    pub fn snapshot(&self) -> HashMap<IpAddr, Peer> {
        self.peers.lock().unwrap().clone()
    }

    pub fn ip_set(&self) -> std::collections::HashSet<IpAddr> {
        self.peers.lock().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict peers whose `last_seen` predates `PEER_CLEANUP`. Returns the
    /// evicted IPs.
    pub fn evict_stale(&self) -> Vec<IpAddr> {
        let cutoff = now().saturating_sub(PEER_CLEANUP.as_secs());
        let mut peers = self.peers.lock().unwrap();
        let stale: Vec<IpAddr> = peers
            .iter()
            .filter(|(_, p)| p.last_seen < cutoff)
            .map(|(ip, _)| *ip)
            .collect();
        for ip in &stale {
            peers.remove(ip);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_get_round_trips_ports() {
        let table = PeerTable::new();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        table.upsert(ip, 13371, 13372);
        let peer = table.get(&ip).unwrap();
        assert_eq!(peer.udp_port, 13371);
        assert_eq!(peer.tcp_port, 13372);
    }

    #[test]
    fn evict_stale_removes_old_entries_only() {
        let table = PeerTable::new();
        let fresh: IpAddr = "10.0.0.2".parse().unwrap();
        let stale: IpAddr = "10.0.0.3".parse().unwrap();
        table.upsert(fresh, 1, 1);
        table.peers.lock().unwrap().insert(
            stale,
            Peer { ip: stale, udp_port: 1, tcp_port: 1, last_seen: 0 },
        );
        let evicted = table.evict_stale();
        assert_eq!(evicted, vec![stale]);
        assert!(table.contains(&fresh));
        assert!(!table.contains(&stale));
    }

    #[test]
    fn snapshot_is_independent_of_later_mutation() {
        let table = PeerTable::new();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        table.upsert(ip, 1, 1);
        let snap = table.snapshot();
        table.remove(&ip);
        assert!(snap.contains_key(&ip));
        assert!(!table.contains(&ip));
    }
}
