//! UDP discovery datagram codec.
//!
//! Layout: a 4-byte header (`magic:u16be, version:u8, kind:u8`) followed by
//! a kind-specific body. `FIND`/`FOUND`/`NOTFOUND` share the same body shape
//! (a `FileData` record); `HERE` carries two ports; `HELLO` is empty.

use crate::config::MAX_NAME;
use crate::error::{Error, Result};

pub const MAGIC: u16 = 0xD16D;
pub const PROTO_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 4;

const NAME_FIELD_LEN: usize = 1 + MAX_NAME; // length byte + padded name bytes
const DIGEST_LEN: usize = 64;
const FILE_DATA_LEN: usize = NAME_FIELD_LEN + DIGEST_LEN + 8;
/// Total datagram length for FIND/FOUND/NOTFOUND: header + FileData body.
pub const DATAGRAM_LEN: usize = HEADER_LEN + FILE_DATA_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Hello = 0x01,
    Here = 0x02,
    Find = 0x11,
    Found = 0x12,
    NotFound = 0x13,
}

impl Kind {
    fn from_byte(b: u8) -> Option<Kind> {
        match b {
            0x01 => Some(Kind::Hello),
            0x02 => Some(Kind::Here),
            0x11 => Some(Kind::Find),
            0x12 => Some(Kind::Found),
            0x13 => Some(Kind::NotFound),
            _ => None,
        }
    }
}

/// `{name, digest, size}` carried by FIND/FOUND/NOTFOUND.
///
/// `digest` is `None` to mean "any digest" on FIND, or "unknown" on
/// FOUND/NOTFOUND — the wire signals this with a leading zero byte in the
/// 64-byte digest field rather than an empty field, since the field is
/// always fixed-width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub name: String,
    pub digest: Option<String>,
    pub size: u64,
}

impl FileData {
    pub fn new(name: impl Into<String>, digest: Option<String>, size: u64) -> Self {
        Self { name: name.into(), digest, size }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let name_bytes = self.name.as_bytes();
        if name_bytes.len() > MAX_NAME {
            return Err(Error::NameTooLong);
        }
        out.push(name_bytes.len() as u8);
        out.extend_from_slice(name_bytes);
        out.resize(out.len() + (MAX_NAME - name_bytes.len()), 0);

        let mut digest_field = [0u8; DIGEST_LEN];
        if let Some(digest) = &self.digest {
            let digest_bytes = digest.as_bytes();
            if digest_bytes.len() != DIGEST_LEN || digest_bytes[0] == 0 {
                return Err(Error::ParseError("digest must be 64 hex characters".into()));
            }
            digest_field.copy_from_slice(digest_bytes);
        }
        out.extend_from_slice(&digest_field);
        out.extend_from_slice(&self.size.to_be_bytes());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_DATA_LEN {
            return Err(Error::ProtocolMismatch);
        }
        let name_len = bytes[0] as usize;
        if name_len > MAX_NAME {
            return Err(Error::ProtocolMismatch);
        }
        let name = String::from_utf8(bytes[1..1 + name_len].to_vec())
            .map_err(|_| Error::ProtocolMismatch)?;

        let digest_bytes = &bytes[NAME_FIELD_LEN..NAME_FIELD_LEN + DIGEST_LEN];
        let digest = if digest_bytes[0] == 0 {
            None
        } else {
            Some(
                String::from_utf8(digest_bytes.to_vec())
                    .map_err(|_| Error::ProtocolMismatch)?,
            )
        };

        let size_bytes = &bytes[NAME_FIELD_LEN + DIGEST_LEN..FILE_DATA_LEN];
        let size = u64::from_be_bytes(size_bytes.try_into().unwrap());

        Ok(FileData { name, digest, size })
    }
}

/// A decoded or to-be-encoded discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Hello,
    Here { udp_port: u16, tcp_port: u16 },
    Find(FileData),
    Found(FileData),
    NotFound(FileData),
}

impl Datagram {
    fn kind(&self) -> Kind {
        match self {
            Datagram::Hello => Kind::Hello,
            Datagram::Here { .. } => Kind::Here,
            Datagram::Find(_) => Kind::Find,
            Datagram::Found(_) => Kind::Found,
            Datagram::NotFound(_) => Kind::NotFound,
        }
    }

    /// Encoding is total: every valid `Datagram` produces bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(DATAGRAM_LEN);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(PROTO_VERSION);
        out.push(self.kind() as u8);

        match self {
            Datagram::Hello => {}
            Datagram::Here { udp_port, tcp_port } => {
                out.extend_from_slice(&udp_port.to_be_bytes());
                out.extend_from_slice(&tcp_port.to_be_bytes());
            }
            Datagram::Find(fd) | Datagram::Found(fd) | Datagram::NotFound(fd) => {
                fd.encode(&mut out)?;
            }
        }
        Ok(out)
    }

    /// Decoding rejects any datagram whose magic, version, or kind is not
    /// recognized.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::ProtocolMismatch);
        }
        let magic = u16::from_be_bytes([bytes[0], bytes[1]]);
        let version = bytes[2];
        if magic != MAGIC || version != PROTO_VERSION {
            return Err(Error::ProtocolMismatch);
        }
        let kind = Kind::from_byte(bytes[3]).ok_or(Error::ProtocolMismatch)?;
        let body = &bytes[HEADER_LEN..];

        Ok(match kind {
            Kind::Hello => Datagram::Hello,
            Kind::Here => {
                if body.len() < 4 {
                    return Err(Error::ProtocolMismatch);
                }
                Datagram::Here {
                    udp_port: u16::from_be_bytes([body[0], body[1]]),
                    tcp_port: u16::from_be_bytes([body[2], body[3]]),
                }
            }
            Kind::Find => Datagram::Find(FileData::decode(body)?),
            Kind::Found => Datagram::Found(FileData::decode(body)?),
            Kind::NotFound => Datagram::NotFound(FileData::decode(body)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(byte: u8) -> String {
        std::iter::repeat(char::from(b'a' + (byte % 6)))
            .take(64)
            .collect()
    }

    #[test]
    fn hello_round_trips() {
        let d = Datagram::Hello;
        assert_eq!(Datagram::decode(&d.encode().unwrap()).unwrap(), d);
    }

    #[test]
    fn here_round_trips() {
        let d = Datagram::Here { udp_port: 13371, tcp_port: 13372 };
        assert_eq!(Datagram::decode(&d.encode().unwrap()).unwrap(), d);
    }

    #[test]
    fn find_with_empty_digest_round_trips() {
        let d = Datagram::Find(FileData::new("report.pdf", None, 0));
        let bytes = d.encode().unwrap();
        assert_eq!(bytes.len(), DATAGRAM_LEN);
        assert_eq!(Datagram::decode(&bytes).unwrap(), d);
    }

    #[test]
    fn found_with_digest_round_trips() {
        let d = Datagram::Found(FileData::new("report.pdf", Some(digest_of(1)), 4096));
        assert_eq!(Datagram::decode(&d.encode().unwrap()).unwrap(), d);
    }

    #[test]
    fn not_found_round_trips() {
        let d = Datagram::NotFound(FileData::new("x", Some(digest_of(2)), 0));
        assert_eq!(Datagram::decode(&d.encode().unwrap()).unwrap(), d);
    }

    #[test]
    fn name_at_max_length_round_trips() {
        let name: String = std::iter::repeat('n').take(MAX_NAME).collect();
        let d = Datagram::Find(FileData::new(name, None, 0));
        assert_eq!(Datagram::decode(&d.encode().unwrap()).unwrap(), d);
    }

    #[test]
    fn name_over_max_length_is_rejected() {
        let name: String = std::iter::repeat('n').take(MAX_NAME + 1).collect();
        let d = Datagram::Find(FileData::new(name, None, 0));
        assert!(d.encode().is_err());
    }

    #[test]
    fn bad_magic_is_protocol_mismatch() {
        let mut bytes = Datagram::Hello.encode().unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(Datagram::decode(&bytes), Err(Error::ProtocolMismatch)));
    }

    #[test]
    fn bad_version_is_protocol_mismatch() {
        let mut bytes = Datagram::Hello.encode().unwrap();
        bytes[2] = 99;
        assert!(matches!(Datagram::decode(&bytes), Err(Error::ProtocolMismatch)));
    }

    #[test]
    fn unknown_kind_is_protocol_mismatch() {
        let mut bytes = Datagram::Hello.encode().unwrap();
        bytes[3] = 0xEE;
        assert!(matches!(Datagram::decode(&bytes), Err(Error::ProtocolMismatch)));
    }

    #[test]
    fn truncated_datagram_is_protocol_mismatch() {
        let bytes = Datagram::Here { udp_port: 1, tcp_port: 2 }.encode().unwrap();
        assert!(matches!(
            Datagram::decode(&bytes[..HEADER_LEN + 1]),
            Err(Error::ProtocolMismatch)
        ));
    }
}
