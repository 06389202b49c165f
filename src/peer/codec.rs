//! The framing of the peer wire protocol: the fixed 68 byte handshake and
//! the length prefixed messages that follow it, including the fast
//! extension (BEP 6) and extended messaging (BEP 10) vocabularies.
//!
//! The connection starts out with [`HandshakeCodec`] and is switched over
//! to [`PeerCodec`] once the handshakes are exchanged, reusing the read and
//! write buffers as the peer may have sent messages right after its
//! handshake.

use std::{convert::TryFrom, io::Cursor};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, ProtocolError, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol identifier sent at the start of every handshake. This is
/// version 1.0 of the BitTorrent protocol.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The reserved byte and mask advertising DHT support (BEP 5).
const DHT_FLAG: (usize, u8) = (7, 0x01);
/// The reserved byte and mask advertising the fast extension (BEP 6).
const FAST_FLAG: (usize, u8) = (7, 0x04);
/// The reserved byte and mask advertising extended messaging (BEP 10).
const EXTENDED_FLAG: (usize, u8) = (5, 0x10);

/// The message sent at the beginning of a connection, in both directions.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    /// The protocol string, which must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Eight reserved bytes, used to signal extension support.
    pub reserved: [u8; 8],
    /// The torrent's SHA1 info hash. Both sides must send the same value
    /// or the connection is severed.
    pub info_hash: Sha1Hash,
    /// The arbitrary 20 byte string identifying the sending client.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates the handshake we send, advertising the capabilities this
    /// engine implements: DHT, the fast extension, and extended messaging.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[DHT_FLAG.0] |= DHT_FLAG.1;
        reserved[FAST_FLAG.0] |= FAST_FLAG.1;
        reserved[EXTENDED_FLAG.0] |= EXTENDED_FLAG.1;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[DHT_FLAG.0] & DHT_FLAG.1 != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[FAST_FLAG.0] & FAST_FLAG.1 != 0
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[EXTENDED_FLAG.0] & EXTENDED_FLAG.1 != 0
    }

    /// Returns the length of the handshake, in bytes. Always 68.
    pub const fn len(&self) -> usize {
        19 + 49
    }
}

/// The codec for the handshake exchange at the start of a connection.
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        buf.reserve(handshake_len());
        buf.put_u8(prot.len() as u8);
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

const fn handshake_len() -> usize {
    1 + 19 + 8 + 20 + 20
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol string length is checked before waiting for the
        // full handshake so that garbage is rejected as early as possible
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::Protocol(ProtocolError::InvalidProtocolString));
        }
        if buf.len() < handshake_len() {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::Protocol(ProtocolError::InvalidProtocolString));
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The byte identifying each message on the wire.
///
/// The gaps in the numbering are deliberate: ids 10 to 12 belong to
/// historical extensions this engine doesn't speak.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    Extended = 20,
}

impl MessageId {
    /// Returns true for messages a peer may only send after negotiating
    /// the fast extension.
    pub fn requires_fast(&self) -> bool {
        matches!(
            self,
            Self::Suggest
                | Self::HaveAll
                | Self::HaveNone
                | Self::Reject
                | Self::AllowedFast
        )
    }
}

impl TryFrom<u8> for MessageId {
    type Error = ProtocolError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            13 => Ok(Self::Suggest),
            14 => Ok(Self::HaveAll),
            15 => Ok(Self::HaveNone),
            16 => Ok(Self::Reject),
            17 => Ok(Self::AllowedFast),
            20 => Ok(Self::Extended),
            _ => Err(ProtocolError::UnknownMessageId(id)),
        }
    }
}

/// A message of the peer wire protocol, after the handshake.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    /// The payload of a `piece` wire message: a single block of a piece.
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// The UDP port of the peer's DHT node (BEP 5).
    Port(u16),
    /// A hint that we'd do well to download this piece (BEP 6).
    Suggest {
        piece_index: PieceIndex,
    },
    /// Fast extension stand-in for an all-set bitfield (BEP 6).
    HaveAll,
    /// Fast extension stand-in for an all-clear bitfield (BEP 6).
    HaveNone,
    /// The peer won't serve this request (BEP 6).
    Reject(BlockInfo),
    /// The peer lets us request this piece even while choked (BEP 6).
    AllowedFast {
        piece_index: PieceIndex,
    },
    /// An extended message (BEP 10): the negotiated extension id followed
    /// by its payload, opaque at this layer.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// Returns the message's wire id, or `None` for keepalives, which have
    /// no id of their own.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
            Self::Suggest { .. } => Some(MessageId::Suggest),
            Self::HaveAll => Some(MessageId::HaveAll),
            Self::HaveNone => Some(MessageId::HaveNone),
            Self::Reject(_) => Some(MessageId::Reject),
            Self::AllowedFast { .. } => Some(MessageId::AllowedFast),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

/// The codec of the post-handshake protocol: a 4 byte big endian length
/// prefix, a message id byte (except for keepalives), and the payload.
pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("fixed message id") as u8);
            }
            Have { piece_index } | Suggest { piece_index }
            | AllowedFast { piece_index } => {
                let id = msg.id().expect("fixed message id");
                buf.put_u32(1 + 4);
                buf.put_u8(id as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                debug_assert_eq!(bitfield.len() % 8, 0);
                buf.put_u32(1 + (bitfield.len() / 8) as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bitfield.as_slice());
            }
            Request(block) => {
                encode_block_info(MessageId::Request, block, buf);
            }
            Cancel(block) => {
                encode_block_info(MessageId::Cancel, block, buf);
            }
            Reject(block) => {
                encode_block_info(MessageId::Reject, block, buf);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
        }

        Ok(())
    }
}

fn encode_block_info(id: MessageId, block: BlockInfo, buf: &mut BytesMut) {
    buf.put_u32(1 + 12);
    buf.put_u8(id as u8);
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        // peek at the length prefix without consuming it, as the rest of
        // the message may not have arrived yet
        let msg_len = {
            let mut peek = Cursor::new(&buf[..]);
            peek.get_u32() as usize
        };
        if buf.len() < 4 + msg_len {
            // a large length prefix is not necessarily an attack (a seed's
            // bitfield of a large torrent is tens of kilobytes), but grow
            // the buffer in one go rather than per read
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: buf.get_u32() as PieceIndex,
            },
            MessageId::Bitfield => {
                let mut data = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut data);
                Message::Bitfield(Bitfield::from_vec(data))
            }
            MessageId::Request => Message::Request(decode_block_info(buf)),
            MessageId::Block => {
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let mut data = vec![0; msg_len - 9];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => Message::Cancel(decode_block_info(buf)),
            MessageId::Port => Message::Port(buf.get_u16()),
            MessageId::Suggest => Message::Suggest {
                piece_index: buf.get_u32() as PieceIndex,
            },
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Reject => Message::Reject(decode_block_info(buf)),
            MessageId::AllowedFast => Message::AllowedFast {
                piece_index: buf.get_u32() as PieceIndex,
            },
            MessageId::Extended => {
                let id = buf.get_u8();
                let mut payload = vec![0; msg_len - 2];
                buf.copy_to_slice(&mut payload);
                Message::Extended { id, payload }
            }
        };

        Ok(Some(msg))
    }
}

fn decode_block_info(buf: &mut BytesMut) -> BlockInfo {
    BlockInfo {
        piece_index: buf.get_u32() as PieceIndex,
        offset: buf.get_u32(),
        len: buf.get_u32(),
    }
}
