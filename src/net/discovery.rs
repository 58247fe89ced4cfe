//! Discovery & search engine.
//!
//! Owns the two UDP sockets, the peer table, and the table of in-flight
//! search sessions. Wires the five discovery callbacks (HELLO, HERE, FIND on
//! the broadcast socket; FOUND, NOTFOUND on the unicast socket) and runs the
//! periodic advertise loop.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::config::{Config, ADVERTISE_PERIOD, FINDING_TIME, SEARCH_RETRIES};
use crate::error::{Error, Result};
use crate::net::peer::{Peer, PeerTable};
use crate::net::search::{FoundResponse, SearchSession};
use crate::net::socket::{resolve_broadcast_addr, Socket};
use crate::wire::{Datagram, FileData};

/// A callback into local file metadata, queried on every inbound FIND.
/// Implemented by [`crate::controller::Controller`].
pub trait FileLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<FileData>;
}

fn is_valid_digest(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// The discovery engine. Constructed once per node and shared with the
/// controller via [`Arc`].
pub struct Discovery {
    config: Config,
    peers: PeerTable,
    sessions: Mutex<HashMap<String, Arc<SearchSession>>>,
    unicast: Arc<Socket>,
    broadcast: Arc<Socket>,
    lookup: Arc<dyn FileLookup>,
}

impl Discovery {
    /// Binds both sockets and registers the five discovery callbacks. The
    /// returned engine is inert until [`Discovery::start`] is called.
    pub fn new(config: &Config, lookup: Arc<dyn FileLookup>) -> Result<Arc<Self>> {
        let broadcast_dest = resolve_broadcast_addr(&config.broadcast_iface, config.broadcast_port);
        let broadcast_bind = SocketAddr::new(config.bind_ip, config.broadcast_port);
        let unicast_bind = SocketAddr::new(config.bind_ip, config.udp_port);

        let broadcast_socket = Arc::new(Socket::bind(
            broadcast_bind,
            broadcast_dest,
            true,
            true,
            config.broadcast_drop_chance,
            config.broadcast_drop_in_row,
        )?);
        // the unicast socket never uses its default destination: every send
        // goes through send_to with an explicit peer address.
        let unicast_socket = Arc::new(Socket::bind(unicast_bind, broadcast_dest, false, true, 0, 1)?);

        let discovery = Arc::new(Self {
            config: config.clone(),
            peers: PeerTable::new(),
            sessions: Mutex::new(HashMap::new()),
            unicast: unicast_socket,
            broadcast: broadcast_socket,
            lookup,
        });
        discovery.register_callbacks();
        Ok(discovery)
    }

    /// Registers callbacks through weak references so the sockets never keep
    /// this engine alive past [`Discovery::stop`].
    fn register_callbacks(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let w = weak.clone();
        self.broadcast.add_receive_callback(Box::new(move |bytes, from| {
            if let Some(d) = w.upgrade() {
                d.on_broadcast(bytes, from.ip());
            }
        }));
        let w = weak;
        self.unicast.add_receive_callback(Box::new(move |bytes, from| {
            if let Some(d) = w.upgrade() {
                d.on_unicast(bytes, from.ip());
            }
        }));
    }

    /// Starts both receive loops, announces this node with HELLO, and kicks
    /// off the periodic advertise loop.
    pub fn start(self: &Arc<Self>) {
        self.unicast.start();
        self.broadcast.start();
        if let Ok(bytes) = Datagram::Hello.encode() {
            self.broadcast.send(bytes);
        }
        self.spawn_advertise_loop();
    }

    /// Stops both sockets. Outstanding searches see their peers drop out of
    /// `still_pending` rather than erroring.
    pub fn stop(&self) {
        self.unicast.close();
        self.broadcast.close();
    }

    fn spawn_advertise_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(ADVERTISE_PERIOD).await;
                let Some(discovery) = weak.upgrade() else { break };
                discovery.send_here();
                for ip in discovery.peers.evict_stale() {
                    debug!("evicted stale peer {ip}");
                }
            }
        });
    }

    fn send_here(&self) {
        let datagram = Datagram::Here { udp_port: self.config.udp_port, tcp_port: self.config.tcp_port };
        if let Ok(bytes) = datagram.encode() {
            self.broadcast.send(bytes);
        }
    }

    fn on_broadcast(&self, bytes: &[u8], from_ip: IpAddr) {
        match Datagram::decode(bytes) {
            Ok(Datagram::Hello) => self.send_here(),
            Ok(Datagram::Here { udp_port, tcp_port }) => {
                self.peers.upsert(from_ip, udp_port, tcp_port);
            }
            Ok(Datagram::Find(data)) => self.handle_find(data, from_ip),
            Ok(_) => {}
            Err(e) => debug!("discarding malformed broadcast datagram from {from_ip}: {e}"),
        }
    }

    fn on_unicast(&self, bytes: &[u8], from_ip: IpAddr) {
        match Datagram::decode(bytes) {
            Ok(Datagram::Found(data)) => self.handle_found(data, from_ip),
            Ok(Datagram::NotFound(data)) => self.handle_not_found(data, from_ip),
            Ok(_) => {}
            Err(e) => debug!("discarding malformed unicast datagram from {from_ip}: {e}"),
        }
    }

    /// A FIND is only answered for peers we've already heard a HERE from:
    /// that's where the reply's destination UDP port comes from.
    fn handle_find(&self, data: FileData, from_ip: IpAddr) {
        let Some(peer) = self.peers.get(&from_ip) else {
            debug!("ignoring FIND from unknown peer {from_ip}");
            return;
        };
        let response = match self.lookup.lookup(&data.name) {
            Some(local) if data.digest.is_none() || data.digest == local.digest => {
                Datagram::Found(local)
            }
            _ => Datagram::NotFound(data),
        };
        if let Ok(bytes) = response.encode() {
            self.unicast.send_to(bytes, from_ip, peer.udp_port);
        }
    }

    fn session_for(&self, name: &str) -> Option<Arc<SearchSession>> {
        self.sessions.lock().unwrap().get(name).cloned()
    }

    fn handle_found(&self, data: FileData, from_ip: IpAddr) {
        if !self.peers.contains(&from_ip) {
            return;
        }
        if let Some(session) = self.session_for(&data.name) {
            session.record_found(from_ip, data);
        }
    }

    fn handle_not_found(&self, data: FileData, from_ip: IpAddr) {
        if !self.peers.contains(&from_ip) {
            return;
        }
        if let Some(session) = self.session_for(&data.name) {
            session.record_not_found(from_ip);
        }
    }

    pub fn known_peers(&self) -> Vec<Peer> {
        self.peers.snapshot().into_values().collect()
    }

    pub fn get_peer(&self, ip: &IpAddr) -> Option<Peer> {
        self.peers.get(ip)
    }

    /// Drops a peer from the table outright — used when a download from it
    /// fails, so the next retry picks a different responder.
    pub fn forget_peer(&self, ip: &IpAddr) {
        self.peers.remove(ip);
    }

    /// Runs a bounded FIND/FOUND/NOTFOUND exchange for `name`, retrying up
    /// to [`SEARCH_RETRIES`] times and evicting peers that never answered.
    pub async fn search(&self, name: &str, digest: Option<String>) -> Result<HashMap<String, Vec<FoundResponse>>> {
        if name.is_empty() || name.len() > crate::config::MAX_NAME {
            return Err(Error::ParseError("search name must be 1..=MAX_NAME bytes".into()));
        }
        if let Some(d) = &digest {
            if !is_valid_digest(d) {
                return Err(Error::ParseError("digest must be 64 hex characters".into()));
            }
        }

        let session = {
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(name) {
                return Err(Error::SearchBusy(name.to_string()));
            }
            let expected = self.peers.ip_set();
            let session = Arc::new(SearchSession::new(name.to_string(), digest.clone(), expected));
            sessions.insert(name.to_string(), session.clone());
            session
        };

        let find = Datagram::Find(FileData::new(name, digest, 0)).encode()?;

        self.broadcast.send(find.clone());
        tokio::time::sleep(FINDING_TIME).await;
        for _ in 0..SEARCH_RETRIES {
            if session.still_pending().is_empty() {
                break;
            }
            self.broadcast.send(find.clone());
            tokio::time::sleep(FINDING_TIME).await;
        }

        for ip in session.still_pending() {
            debug!("evicting non-responder {ip} after search for '{name}'");
            self.peers.remove(&ip);
        }

        self.sessions.lock().unwrap().remove(name);
        Ok(session.results())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoFiles;
    impl FileLookup for NoFiles {
        fn lookup(&self, _name: &str) -> Option<FileData> {
            None
        }
    }

    fn test_config(udp: u16, bcast: u16) -> Config {
        let mut config = Config::default();
        config.bind_ip = "127.0.0.1".parse().unwrap();
        config.udp_port = udp;
        config.broadcast_port = bcast;
        config.tcp_port = 0;
        config
    }

    #[tokio::test]
    async fn search_with_no_known_peers_returns_empty_immediately() {
        let config = test_config(23171, 23170);
        let discovery = Discovery::new(&config, Arc::new(NoFiles)).unwrap();
        discovery.start();
        let results = discovery.search("nothing.bin", None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn duplicate_concurrent_search_is_rejected() {
        let config = test_config(23173, 23172);
        let discovery = Discovery::new(&config, Arc::new(NoFiles)).unwrap();
        // the session map is populated directly to exercise the busy path
        // without needing a live peer on the other end of a real search.
        discovery.sessions.lock().unwrap().insert(
            "busy.bin".to_string(),
            Arc::new(SearchSession::new("busy.bin".to_string(), None, Default::default())),
        );
        let err = discovery.search("busy.bin", None).await.unwrap_err();
        assert!(matches!(err, Error::SearchBusy(_)));
    }
}
