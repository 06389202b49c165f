//! The error types the engine reports to its host.
//!
//! There are three kinds of failure at this layer: protocol violations,
//! which are fatal to the offending peer connection only; transport errors,
//! which the peer layer treats the same way (reconnecting is a higher layer's
//! policy); and broken internal invariants, which poison the owning torrent.

use std::{fmt, io};

use crate::{peer::codec::MessageId, BlockInfo};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate-wide error type.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The peer violated the wire protocol. Fatal for the connection: the
    /// session is closed, its requests cancelled, and no retry is attempted.
    Protocol(ProtocolError),
    /// The transport reported a failure. Propagated identically to a fatal
    /// close.
    Transport(io::Error),
    /// A routing table or bitfield invariant was broken. This is a bug: the
    /// owning torrent is poisoned and must not continue.
    InvariantViolation(&'static str),
    /// The torrent has been poisoned by an earlier invariant violation and
    /// refuses new connections.
    Poisoned,
    /// The torrent is at its connection limit and refuses new peers.
    ConnectionLimitReached,
    /// A torrent with the same info hash is already registered with the
    /// engine.
    TorrentExists,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol violation: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::InvariantViolation(what) => {
                write!(f, "invariant violation: {}", what)
            }
            Self::Poisoned => write!(f, "torrent is poisoned"),
            Self::ConnectionLimitReached => {
                write!(f, "connection limit reached")
            }
            Self::TorrentExists => write!(f, "torrent already exists"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// A peer protocol violation. Every variant closes the connection.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The handshake did not start with the "BitTorrent protocol" identifier.
    InvalidProtocolString,
    /// The info hash in the peer's handshake doesn't match the torrent's.
    InvalidInfoHash,
    /// The peer id in the handshake differs from the id we already know this
    /// peer by.
    InvalidPeerId,
    /// A message arrived before the handshake completed.
    MessageBeforeHandshake,
    /// A handshake arrived on an already connected session.
    UnexpectedHandshake,
    /// The peer sent a message reserved for a capability it did not
    /// negotiate (a fast peer message without the fast extension, or an
    /// extended message without extended messaging).
    CapabilityViolation(MessageId),
    /// A request's length was outside `[MIN_REQUEST_LEN, MAX_REQUEST_LEN]`
    /// or the block doesn't fit its piece.
    InvalidRequest(BlockInfo),
    /// A message referred to a piece index the torrent doesn't have.
    InvalidPieceIndex(usize),
    /// The extended handshake payload was not a valid bencoded dictionary.
    InvalidExtendedPayload,
    /// The message id is not part of the protocol vocabulary.
    UnknownMessageId(u8),
}

impl ProtocolError {
    /// The reason string handed to the transport when the connection is
    /// closed over this violation.
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::InvalidProtocolString => "Invalid handshake",
            Self::InvalidInfoHash => "Info hash mismatch",
            Self::InvalidPeerId => "Peer id mismatch",
            Self::MessageBeforeHandshake => "Message before handshake",
            Self::UnexpectedHandshake => "Unexpected handshake",
            Self::CapabilityViolation(_) => "Capability violation",
            Self::InvalidRequest(_) => "Malformed request",
            Self::InvalidPieceIndex(_) => "Invalid piece index",
            Self::InvalidExtendedPayload => "Malformed extended message",
            Self::UnknownMessageId(_) => "Unknown message",
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidProtocolString => {
                write!(f, "invalid protocol identifier")
            }
            Self::InvalidInfoHash => write!(f, "info hash mismatch"),
            Self::InvalidPeerId => write!(f, "peer id mismatch"),
            Self::MessageBeforeHandshake => {
                write!(f, "message received before handshake")
            }
            Self::UnexpectedHandshake => {
                write!(f, "handshake on a connected session")
            }
            Self::CapabilityViolation(id) => {
                write!(f, "message {:?} without negotiated capability", id)
            }
            Self::InvalidRequest(block) => {
                write!(f, "malformed request {:?}", block)
            }
            Self::InvalidPieceIndex(index) => {
                write!(f, "invalid piece index {}", index)
            }
            Self::InvalidExtendedPayload => {
                write!(f, "malformed extended message payload")
            }
            Self::UnknownMessageId(id) => write!(f, "unknown message id {}", id),
        }
    }
}

impl std::error::Error for ProtocolError {}
