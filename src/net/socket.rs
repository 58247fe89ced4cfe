//! UDP transport.
//!
//! Two bound sockets — unicast and broadcast — each with its own receive
//! loop and a single outbound writer task. Serializing sends through one
//! task per socket, rather than letting every caller call `send_to` directly
//! on a shared socket, means callers never contend on the underlying fd and
//! send order on a given socket is preserved.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use rand::Rng;
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::config::UDP_BUFFER;

pub type ReceiveCallback = Box<dyn Fn(&[u8], SocketAddr) + Send + Sync>;

/// Fault-injection drop filter for the broadcast socket.
///
/// With probability `chance` (0-100) the next `run_len` consecutive inbound
/// datagrams are dropped; a counter decrements once per dropped datagram so,
/// once triggered, the run is guaranteed regardless of later rolls.
struct DropFilter {
    chance: u8,
    run_len: u32,
    remaining: AtomicU32,
}

impl DropFilter {
    fn new(chance: u8, run_len: u32) -> Self {
        Self { chance: chance.min(100), run_len: run_len.max(1), remaining: AtomicU32::new(0) }
    }

    fn should_drop(&self) -> bool {
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::Relaxed);
            return true;
        }
        if self.chance == 0 {
            return false;
        }
        let roll: u8 = rand::thread_rng().gen_range(0..100);
        if roll < self.chance {
            self.remaining.store(self.run_len - 1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

/// A bound UDP socket with registered receive callbacks and a dedicated
/// outbound writer task.
pub struct Socket {
    socket: std::sync::Arc<TokioUdpSocket>,
    default_dest: SocketAddr,
    callbacks: Mutex<Vec<ReceiveCallback>>,
    started: AtomicBool,
    omit_self: bool,
    local_ips: HashSet<IpAddr>,
    drop_filter: Option<DropFilter>,
    out_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Socket {
    /// Binds a socket at `bind_addr`. `broadcast` enables `SO_BROADCAST` and
    /// `default_dest` is where a bare `send()` lands (the broadcast address
    /// for the broadcast socket, or the caller's usual peer otherwise).
    pub fn bind(
        bind_addr: SocketAddr,
        default_dest: SocketAddr,
        broadcast: bool,
        omit_self: bool,
        drop_chance: u8,
        drop_in_row: u32,
    ) -> std::io::Result<Self> {
        let socket2 = socket2::Socket::new(
            socket2::Domain::for_address(bind_addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket2.set_reuse_address(true)?;
        if broadcast {
            socket2.set_broadcast(true)?;
        }
        socket2.bind(&bind_addr.into())?;
        socket2.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = TokioUdpSocket::from_std(std_socket)?;

        let local_ips = if omit_self { local_interface_ips() } else { HashSet::new() };
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(Self {
            socket: std::sync::Arc::new(socket),
            default_dest,
            callbacks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            omit_self,
            local_ips,
            drop_filter: if broadcast { Some(DropFilter::new(drop_chance, drop_in_row)) } else { None },
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Registers a receive callback. Must be called before [`Socket::start`].
    pub fn add_receive_callback(&self, callback: ReceiveCallback) {
        debug_assert!(!self.started.load(Ordering::Relaxed), "callbacks must be registered before start()");
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Starts the receive loop and outbound writer task.
    pub fn start(self: &std::sync::Arc<Self>) {
        self.started.store(true, Ordering::Relaxed);

        let recv_self = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER];
            loop {
                if recv_self.closed.load(Ordering::Relaxed) {
                    break;
                }
                tokio::select! {
                    res = recv_self.socket.recv_from(&mut buf) => match res {
                        Ok((len, from)) => recv_self.dispatch(&buf[..len], from),
                        Err(e) => {
                            error!("udp recv error: {e}");
                            break;
                        }
                    },
                    _ = recv_self.shutdown.notified() => break,
                }
            }
        });

        let mut out_rx = self.out_rx.lock().unwrap().take().expect("start() called twice");
        let write_self = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = out_rx.recv() => match maybe {
                        Some((bytes, dest)) => {
                            if let Err(e) = write_self.socket.send_to(&bytes, dest).await {
                                warn!("udp send to {dest} failed: {e}");
                            }
                        }
                        None => break,
                    },
                    _ = write_self.shutdown.notified() => break,
                }
            }
        });
    }

    /// Stops the receive loop and outbound writer task.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
    }

    fn dispatch(&self, bytes: &[u8], from: SocketAddr) {
        if self.omit_self && self.local_ips.contains(&from.ip()) {
            return;
        }
        if let Some(filter) = &self.drop_filter {
            if filter.should_drop() {
                debug!("drop filter discarded datagram from {from}");
                return;
            }
        }
        let callbacks = self.callbacks.lock().unwrap();
        for callback in callbacks.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(bytes, from)));
            if let Err(panic) = result {
                error!("udp receive callback panicked: {panic:?}");
            }
        }
    }

    /// Queues `bytes` for delivery to this socket's configured destination
    /// (the peer address for a unicast socket, the broadcast address for a
    /// broadcast socket).
    pub fn send(&self, bytes: Vec<u8>) {
        self.send_to_addr(bytes, self.default_dest);
    }

    pub fn send_to(&self, bytes: Vec<u8>, ip: IpAddr, port: u16) {
        self.send_to_addr(bytes, SocketAddr::new(ip, port));
    }

    fn send_to_addr(&self, bytes: Vec<u8>, dest: SocketAddr) {
        if self.out_tx.send((bytes, dest)).is_err() {
            warn!("udp socket writer task is gone, dropping outbound datagram to {dest}");
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// All IPv4 addresses of local network interfaces, used to suppress
/// self-broadcast loops.
fn local_interface_ips() -> HashSet<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(addrs) => addrs.into_iter().map(|a| a.ip()).collect(),
        Err(e) => {
            warn!("could not enumerate local interfaces: {e}");
            let mut set = HashSet::new();
            set.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
            set
        }
    }
}

/// Resolves the broadcast destination address for `iface` (or the wildcard
/// limited broadcast address `255.255.255.255` when no interface is
/// pinned).
pub fn resolve_broadcast_addr(iface: &str, port: u16) -> SocketAddr {
    if iface != "default" {
        if let Ok(addrs) = if_addrs::get_if_addrs() {
            if let Some(found) = addrs.into_iter().find(|a| a.name == iface) {
                if let if_addrs::IfAddr::V4(v4) = found.addr {
                    if let Some(broadcast) = v4.broadcast {
                        return SocketAddr::new(IpAddr::V4(broadcast), port);
                    }
                }
            }
        }
        warn!("interface '{iface}' not found or has no broadcast address, falling back to wildcard");
    }
    SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)
}
