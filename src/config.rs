//! Runtime configuration.
//!
//! A plain value plumbed through constructors, not a global singleton: a
//! [`Config`] is built once (from CLI args, in `main`, or directly in tests)
//! and handed to the pieces that need it.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const MAX_NAME: usize = 32;
pub const FILE_CHUNK: usize = 16 * 1024;
pub const UDP_BUFFER: usize = 2048;
pub const ADVERTISE_PERIOD: Duration = Duration::from_secs(10);
pub const PEER_CLEANUP: Duration = Duration::from_secs(30);
pub const FINDING_TIME: Duration = Duration::from_secs(2);
pub const SEARCH_RETRIES: u32 = 2;
pub const FILE_WATCHER_PERIOD: Duration = Duration::from_secs(5);
pub const TCP_FILE_SEND_TIMEOUT: Duration = Duration::from_secs(15);
pub const TCP_FILE_RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const FINGERPRINT_LENGTH: usize = 10;
pub const DIGEST_ALG: &str = "sha-256";

/// filemesh: a local-network peer-to-peer file sharing node.
#[derive(Parser, Debug, Clone)]
#[command(name = "filemesh", version, about)]
pub struct Config {
    /// Address to bind all sockets on.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_ip: IpAddr,

    /// TCP port the transfer server listens on.
    #[arg(long, default_value_t = 13372)]
    pub tcp_port: u16,

    /// UDP port used for unicast discovery replies.
    #[arg(long, default_value_t = 13371)]
    pub udp_port: u16,

    /// UDP port used for broadcast discovery.
    #[arg(long, default_value_t = 13370)]
    pub broadcast_port: u16,

    /// Network interface to broadcast on ("default" = wildcard broadcast).
    #[arg(long, default_value = "default")]
    pub broadcast_iface: String,

    /// Fault injection: percent chance (0-100) that a run of inbound
    /// broadcast datagrams is dropped.
    #[arg(long, default_value_t = 0)]
    pub broadcast_drop_chance: u8,

    /// Fault injection: length of the dropped run once triggered.
    #[arg(long, default_value_t = 1)]
    pub broadcast_drop_in_row: u32,

    /// Directory holding downloaded files and the metadata store.
    #[arg(long, default_value = "./filemesh-data")]
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            tcp_port: 13372,
            udp_port: 13371,
            broadcast_port: 13370,
            broadcast_iface: "default".to_string(),
            broadcast_drop_chance: 0,
            broadcast_drop_in_row: 1,
            data_dir: PathBuf::from("./filemesh-data"),
        }
    }
}
