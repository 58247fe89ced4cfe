//! Wire codecs: the UDP discovery datagram format and the line-oriented
//! transfer-message format.
//!
//! Both codecs are hand-rolled rather than built on `serde`: the datagram
//! layout is a fixed byte structure with pascal-style length-prefixed
//! fields, and the transfer format is a text protocol with case-insensitive
//! header canonicalization — neither maps naturally onto a derive.

pub mod datagram;
pub mod transfer;

pub use datagram::{Datagram, FileData, Kind, DATAGRAM_LEN, HEADER_LEN, MAGIC, PROTO_VERSION};
pub use transfer::{Method, Request, Response, StatusCode};
