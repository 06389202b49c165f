//! The payloads carried inside extended messages (BEP 10): the extended
//! handshake, peer exchange (BEP 11), and metadata transfer (BEP 9).
//!
//! All of these are bencoded dictionaries. The metadata data message is the
//! one oddity of the family: its raw piece bytes are appended verbatim
//! after the bencoded header.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use serde_bytes::ByteBuf;

use crate::error::Result;

/// The id of the extended handshake itself, fixed by BEP 10.
pub const EXT_HANDSHAKE_ID: u8 = 0;

/// Our local id for peer exchange messages, advertised in our handshake's
/// `m` dictionary. Inbound extended messages use these local ids.
pub const UT_PEX_ID: u8 = 1;

/// Our local id for metadata transfer messages.
pub const UT_METADATA_ID: u8 = 2;

/// The size of a metadata piece (BEP 9), 16 KiB except for the last piece.
pub const METADATA_PIECE_LEN: u32 = 0x4000;

/// The extended handshake, sent by both sides right after the base
/// handshake when both advertise extended messaging.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedHandshake {
    /// Maps the names of the extensions the sender speaks to the ids it
    /// expects them on.
    #[serde(default)]
    pub m: HashMap<String, u8>,
    /// The port the sending client listens on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,
    /// Human readable client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// The number of outstanding requests the sender is willing to queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<usize>,
    /// The size of the info dictionary, in bytes, for metadata transfer.
    #[serde(
        default,
        rename = "metadata_size",
        skip_serializing_if = "Option::is_none"
    )]
    pub metadata_size: Option<u32>,
}

impl ExtendedHandshake {
    /// The handshake we send: our extension registry, client version, and,
    /// when we have the metadata, its size.
    pub fn ours(listen_port: Option<u16>, metadata_size: Option<u32>) -> Self {
        let mut m = HashMap::new();
        m.insert("ut_pex".into(), UT_PEX_ID);
        m.insert("ut_metadata".into(), UT_METADATA_ID);
        Self {
            m,
            p: listen_port,
            v: Some(format!("peercore {}", env!("CARGO_PKG_VERSION"))),
            reqq: Some(250),
            metadata_size,
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }

    /// The id the peer wants peer exchange messages on, if it speaks PeX.
    pub fn ut_pex_id(&self) -> Option<u8> {
        self.m.get("ut_pex").copied().filter(|&id| id != 0)
    }

    /// The id the peer wants metadata messages on, if it speaks BEP 9.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.get("ut_metadata").copied().filter(|&id| id != 0)
    }
}

/// A peer exchange message (BEP 11), carrying compact peer lists.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PexMessage {
    /// Peers that joined the swarm, in compact 6 byte IPv4 form.
    #[serde(default)]
    pub added: ByteBuf,
    /// One flag byte per added peer.
    #[serde(default, rename = "added.f")]
    pub added_f: ByteBuf,
    /// Peers that left the swarm, in compact form.
    #[serde(default)]
    pub dropped: ByteBuf,
}

impl PexMessage {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }

    /// The peers the message offers, decoded from the compact form. Any
    /// trailing partial entry is discarded.
    pub fn added_peers(&self) -> Vec<SocketAddr> {
        decode_compact_peers(&self.added)
    }
}

/// Decodes a compact IPv4 peer list: 4 address bytes and a big endian port
/// per entry.
pub fn decode_compact_peers(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

/// The type tag of a metadata transfer message (BEP 9).
pub mod metadata_msg_type {
    pub const REQUEST: u8 = 0;
    pub const DATA: u8 = 1;
    pub const REJECT: u8 = 2;
}

/// The bencoded header of a metadata transfer message (BEP 9).
///
/// A data message's piece bytes follow the header verbatim; they are not
/// part of the dictionary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataMessage {
    pub msg_type: u8,
    pub piece: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u32>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: metadata_msg_type::REQUEST,
            piece,
            total_size: None,
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: metadata_msg_type::REJECT,
            piece,
            total_size: None,
        }
    }

    /// Builds the full payload of a data message: the bencoded header with
    /// the piece's bytes appended.
    pub fn data(
        piece: u32,
        metadata: &[u8],
    ) -> Result<Vec<u8>, serde_bencode::Error> {
        let header = Self {
            msg_type: metadata_msg_type::DATA,
            piece,
            total_size: Some(metadata.len() as u32),
        };
        let mut payload = serde_bencode::to_bytes(&header)?;
        let start = piece as usize * METADATA_PIECE_LEN as usize;
        let end = (start + METADATA_PIECE_LEN as usize).min(metadata.len());
        payload.extend_from_slice(&metadata[start..end]);
        Ok(payload)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }

    /// The number of metadata pieces for an info dictionary of this size.
    pub fn piece_count(metadata_size: u32) -> u32 {
        (metadata_size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN
    }
}
