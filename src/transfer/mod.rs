//! Transfer protocol engine: server (upload) and client (download) roles
//! sharing the wire format in [`crate::wire::transfer`] and the scoped
//! provider/consumer contexts in [`context`].

pub mod client;
pub mod context;
pub mod server;

pub use context::{ConsumerGuard, ConsumerHandle, ConsumerHost, ProviderGuard, ProviderHandle, ProviderHost};
