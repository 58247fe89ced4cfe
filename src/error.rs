//! Crate-wide error kinds.
//!
//! Transfer handlers map these to status codes in one place
//! ([`crate::transfer::server`]); controller background tasks never
//! propagate these upward, they log and drive a state transition instead.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("(de)serialization error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),

    #[error("udp datagram did not match the wire format")]
    ProtocolMismatch,

    #[error("transfer message framing was malformed: {0}")]
    ParseError(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("requested range is outside the file")]
    InvalidRange,

    #[error("file not found or not shareable: {0}")]
    NotFound(String),

    #[error("if-digest precondition failed")]
    DigestMismatch,

    #[error("file name exceeds the maximum length")]
    NameTooLong,

    #[error("operation timed out")]
    Timeout,

    #[error("transfer ended after {got} of {expected} declared bytes")]
    ShortTransfer { got: u64, expected: u64 },

    #[error("local file changed underneath an in-progress transfer")]
    InconsistentFileState,

    #[error("file '{0}' already exists")]
    DuplicateFile(String),

    #[error("a search for '{0}' is already in flight")]
    SearchBusy(String),

    #[error("remote responded with a failure: {0}")]
    ProtocolError(String),

    #[error("the downloaded content does not match the expected digest")]
    InvalidDownload,

    #[error("cannot start: {0}")]
    FatalStart(String),

    #[error("no known peer at {0}")]
    UnknownPeer(SocketAddr),
}

pub type Result<T> = std::result::Result<T, Error>;
