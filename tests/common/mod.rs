use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};

use filemesh::Config;

// Ports are assigned from a shared counter so tests running in parallel
// (the default `cargo test` behavior) never collide on a bind address.
static NEXT_PORT: AtomicU16 = AtomicU16::new(25_000);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(3, Ordering::Relaxed)
}

/// A `Config` bound to a fresh port triple and a fresh temp data directory.
/// Discovery binds on `0.0.0.0` (not `127.0.0.1`): a socket bound to a
/// specific address only receives datagrams addressed to it, and broadcast
/// datagrams are addressed to the broadcast address, not the unicast one.
pub fn test_config() -> (tempfile::TempDir, Config) {
    let dir = tempfile::tempdir().unwrap();
    let base = next_port();
    let mut config = Config::default();
    config.bind_ip = IpAddr::from([0, 0, 0, 0]);
    config.broadcast_port = base;
    config.udp_port = base + 1;
    config.tcp_port = base + 2;
    config.data_dir = dir.path().to_path_buf();
    (dir, config)
}
