//! Provider/consumer context guards: RAII handles that deregister
//! themselves on drop, mirroring the context-manager pattern for resources
//! that must be released on every exit path, success or failure.
//!
//! A [`ProviderGuard`] represents an in-progress download (we are receiving
//! bytes from a peer); a [`ConsumerGuard`] represents an in-progress upload
//! (a peer is receiving bytes from us). Both are scoped acquisitions: the
//! controller registers the handle when the guard is created, and releases
//! it unconditionally on drop, whatever exit path the holding task took.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Implemented by the controller; lets a [`ProviderGuard`] release itself
/// and report progress without the transfer engine depending on the
/// controller's concrete type.
pub trait ProviderHost: Send + Sync {
    fn detach_provider(&self, name: &str);
    fn report_progress(&self, name: &str, current_size: u64);
}

/// Implemented by the controller; lets a [`ConsumerGuard`] release itself.
pub trait ConsumerHost: Send + Sync {
    fn detach_consumer(&self, name: &str, peer: SocketAddr);
}

/// Held by a download task for the lifetime of the transfer.
pub struct ProviderGuard {
    name: String,
    host: Weak<dyn ProviderHost>,
    stopped: Arc<AtomicBool>,
}

impl ProviderGuard {
    pub(crate) fn new(name: String, host: Weak<dyn ProviderHost>, stopped: Arc<AtomicBool>) -> Self {
        Self { name, host, stopped }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the controller has asked this transfer to stop
    /// (shutdown, or the file was invalidated underneath it).
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn report_progress(&self, current_size: u64) {
        if let Some(host) = self.host.upgrade() {
            host.report_progress(&self.name, current_size);
        }
    }
}

impl Drop for ProviderGuard {
    fn drop(&mut self) {
        if let Some(host) = self.host.upgrade() {
            host.detach_provider(&self.name);
        }
    }
}

/// Held by a server connection handler for the lifetime of one upload.
pub struct ConsumerGuard {
    name: String,
    peer: SocketAddr,
    host: Weak<dyn ConsumerHost>,
    stopped: Arc<AtomicBool>,
}

impl ConsumerGuard {
    pub(crate) fn new(name: String, peer: SocketAddr, host: Weak<dyn ConsumerHost>, stopped: Arc<AtomicBool>) -> Self {
        Self { name, peer, host, stopped }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        if let Some(host) = self.host.upgrade() {
            host.detach_consumer(&self.name, self.peer);
        }
    }
}

/// Handle kept in the controller's `FileState` for an attached provider.
pub struct ProviderHandle {
    pub peer_ip: IpAddr,
    pub stopped: Arc<AtomicBool>,
}

/// Handle kept in the controller's `FileState` for one attached consumer.
pub struct ConsumerHandle {
    pub peer: SocketAddr,
    pub stopped: Arc<AtomicBool>,
}
