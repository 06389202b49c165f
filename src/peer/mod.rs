//! The per-connection state of a peer.
//!
//! A [`PeerSession`] is a passive record: it is created after a successful
//! transport handshake, mutated by the message dispatcher and the torrent's
//! tick loop (never concurrently, see the crate's scheduling model), and
//! destroyed on disconnect, protocol violation, or inactivity eviction.

pub mod codec;
pub mod extensions;

use std::{
    collections::{HashSet, VecDeque},
    io,
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    counter::ThruputMonitor,
    error::Result,
    peer::codec::{Handshake, HandshakeCodec, Message, PeerCodec},
    peer::extensions::ExtendedHandshake,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// Who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Where the session is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The transport is up but the protocol handshake hasn't completed.
    /// Any message other than the handshake is a protocol violation here.
    Handshaking,
    /// The normal state, in which any message may be exchanged.
    Connected,
}

/// Per-connection state of a single peer.
pub struct PeerSession {
    /// The remote address of the peer.
    pub addr: SocketAddr,
    /// Who connected to whom.
    pub direction: Direction,
    /// Where the session is in its life.
    pub state: SessionState,

    /// The peer's id, either learned from the tracker before connecting or
    /// adopted from the peer's handshake on first contact.
    pub peer_id: Option<PeerId>,
    /// The client name and version from the extended handshake, if any.
    pub client_version: Option<String>,

    /// Whether the peer negotiated the fast extension (BEP 6).
    pub supports_fast: bool,
    /// Whether the peer negotiated extended messaging (BEP 10).
    pub supports_extended: bool,
    /// Whether the peer advertises a DHT node (BEP 5).
    pub supports_dht: bool,

    /// Which pieces the peer has. Starts out all clear; bits are set by
    /// `Have`, `HaveAll`, and `Bitfield` messages.
    pub bitfield: Bitfield,

    /// We are not serving piece data to the peer.
    pub am_choking: bool,
    /// The peer has pieces we want.
    pub am_interested: bool,
    /// The peer is not serving piece data to us.
    pub peer_choking: bool,
    /// The peer wants pieces we have.
    pub peer_interested: bool,

    /// Pieces we may request from the peer even while choked.
    pub allowed_fast_from_peer: HashSet<PieceIndex>,
    /// Pieces the peer may request from us even while we choke it.
    pub allowed_fast_to_peer: HashSet<PieceIndex>,
    /// Pieces the peer suggested we download (BEP 6).
    pub suggested_pieces: HashSet<PieceIndex>,

    /// Messages waiting for the transport to pick up, in send order.
    outbound: VecDeque<Message>,
    /// Disk reads issued for the peer's requests but not yet completed, in
    /// request order.
    pending_reads: Vec<BlockInfo>,
    /// Our requests in flight to the peer, i.e. the blocks we're expecting.
    outgoing_requests: Vec<BlockInfo>,
    /// How many of the peer's requests we've accepted but not yet sent the
    /// block for (pending disk reads plus queued `Piece` messages).
    peer_request_count: usize,

    /// How many `Have` messages the peer has sent us over the session.
    pub have_messages_received: usize,
    /// How many blocks the peer has delivered to us.
    pub pieces_received: usize,
    /// How many requests we may keep in flight to this peer, recomputed
    /// every tick from throughput and the peer's advertised queue depth.
    pub max_pending_requests: usize,
    /// The request queue depth the peer advertised in its extended
    /// handshake, clamped to at least 1.
    pub peer_advertised_max: Option<usize>,

    /// The listen port from the peer's extended handshake, if nonzero.
    pub peer_listen_port: Option<u16>,
    /// The peer's DHT node port from a `Port` message, handed to the DHT
    /// subsystem by the host.
    pub dht_port: Option<u16>,

    /// The peer's extended handshake, kept for its extension id registry.
    pub peer_extensions: Option<ExtendedHandshake>,
    /// Whether a peer exchange manager is attached to this session.
    pub pex_attached: bool,

    /// When we last handed a message to the transport.
    pub last_message_sent: Instant,
    /// When we last heard from the peer.
    pub last_message_received: Instant,
    /// When the session entered the connected state.
    pub connected_at: Instant,
    /// Whether the transport is currently writing this session's queue.
    /// Maintained by the transport glue; the tick loop only signals
    /// a drain when no send is in flight.
    pub send_in_flight: bool,

    /// Throughput bookkeeping towards this peer.
    pub counters: ThruputMonitor,
}

impl PeerSession {
    pub fn new(
        addr: SocketAddr,
        direction: Direction,
        piece_count: usize,
        now: Instant,
    ) -> Self {
        let mut bitfield = Bitfield::new();
        bitfield.resize(piece_count, false);
        Self {
            addr,
            direction,
            state: SessionState::Handshaking,
            peer_id: None,
            client_version: None,
            supports_fast: false,
            supports_extended: false,
            supports_dht: false,
            bitfield,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            allowed_fast_from_peer: HashSet::new(),
            allowed_fast_to_peer: HashSet::new(),
            suggested_pieces: HashSet::new(),
            outbound: VecDeque::new(),
            pending_reads: Vec::new(),
            outgoing_requests: Vec::new(),
            peer_request_count: 0,
            have_messages_received: 0,
            pieces_received: 0,
            // an optimistic starting depth; the tick loop rescales it from
            // measured throughput
            max_pending_requests: 4,
            peer_advertised_max: None,
            peer_listen_port: None,
            dht_port: None,
            peer_extensions: None,
            pex_attached: false,
            last_message_sent: now,
            last_message_received: now,
            connected_at: now,
            send_in_flight: false,
            counters: ThruputMonitor::default(),
        }
    }

    /// True if the peer has every piece.
    pub fn is_seeder(&self) -> bool {
        self.bitfield.all()
    }

    /// Appends a message to the outbound queue. The transport drains the
    /// queue asynchronously, preserving this order.
    pub fn enqueue(&mut self, msg: Message) {
        self.outbound.push_back(msg);
    }

    /// The messages waiting for the transport, in send order.
    pub fn outbound(&self) -> impl Iterator<Item = &Message> {
        self.outbound.iter()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Hands the next message to the transport, stamping the send time.
    pub fn dequeue(&mut self, now: Instant) -> Option<Message> {
        let msg = self.outbound.pop_front()?;
        self.last_message_sent = now;
        if let Message::Block { data, .. } = &msg {
            self.peer_request_count = self.peer_request_count.saturating_sub(1);
            self.counters.up.add(data.len() as u64);
        }
        Some(msg)
    }

    /// Drops all queued messages. Used when the session closes.
    pub fn clear_outbound(&mut self) {
        self.outbound.clear();
    }

    /// Notes an accepted request from the peer: the read is issued to the
    /// disk layer by the host and its completion fed back through
    /// [`PeerSession::read_completed`].
    pub fn queue_read(&mut self, block: BlockInfo) {
        self.pending_reads.push(block);
        self.peer_request_count += 1;
    }

    /// The disk reads issued for the peer but not yet completed.
    pub fn pending_reads(&self) -> &[BlockInfo] {
        &self.pending_reads
    }

    /// How many of the peer's requests we've accepted but not yet served.
    pub fn peer_request_count(&self) -> usize {
        self.peer_request_count
    }

    /// Turns a completed disk read into a queued `Piece` message. Returns
    /// false if the read was cancelled while in flight, in which case the
    /// data is discarded.
    pub fn read_completed(&mut self, block: BlockInfo, data: Vec<u8>) -> bool {
        let pos = match self.pending_reads.iter().position(|b| *b == block) {
            Some(pos) => pos,
            None => return false,
        };
        debug_assert_eq!(data.len(), block.len as usize);
        self.pending_reads.remove(pos);
        self.enqueue(Message::Block {
            piece_index: block.piece_index,
            offset: block.offset,
            data,
        });
        true
    }

    /// Handles the peer taking back a request: removes the matching queued
    /// `Piece` message, or failing that the matching pending read. At most
    /// one match is removed per call. Returns true if anything matched.
    pub fn cancel(&mut self, block: BlockInfo) -> bool {
        let queued = self.outbound.iter().position(|msg| {
            matches!(
                msg,
                Message::Block { piece_index, offset, data }
                    if *piece_index == block.piece_index
                        && *offset == block.offset
                        && data.len() == block.len as usize
            )
        });
        if let Some(pos) = queued {
            self.outbound.remove(pos);
            self.peer_request_count = self.peer_request_count.saturating_sub(1);
            return true;
        }
        if let Some(pos) = self.pending_reads.iter().position(|b| *b == block)
        {
            self.pending_reads.remove(pos);
            self.peer_request_count = self.peer_request_count.saturating_sub(1);
            return true;
        }
        false
    }

    /// Our requests in flight to the peer.
    pub fn outgoing_requests(&self) -> &[BlockInfo] {
        &self.outgoing_requests
    }

    pub fn requesting_count(&self) -> usize {
        self.outgoing_requests.len()
    }

    /// Registers requests we just queued towards the peer.
    pub fn register_requests(&mut self, blocks: &[BlockInfo]) {
        self.outgoing_requests.extend_from_slice(blocks);
    }

    /// Notes that a requested block arrived. Returns true if we were in
    /// fact expecting it.
    pub fn block_arrived(&mut self, block: BlockInfo) -> bool {
        match self.outgoing_requests.iter().position(|b| *b == block) {
            Some(pos) => {
                self.outgoing_requests.remove(pos);
                self.pieces_received += 1;
                self.counters.down.add(block.len as u64);
                true
            }
            None => false,
        }
    }

    /// Removes a single in-flight request, if present. Used when the peer
    /// rejects it.
    pub fn unregister_request(&mut self, block: BlockInfo) -> bool {
        match self.outgoing_requests.iter().position(|b| *b == block) {
            Some(pos) => {
                self.outgoing_requests.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Forgets all in-flight requests. Used when the peer chokes us
    /// without the fast extension, and on close.
    pub fn clear_outgoing_requests(&mut self) {
        self.outgoing_requests.clear();
    }
}

/// Exchanges handshakes over a fresh connection and switches the stream
/// over to the peer message framing.
///
/// We always send our handshake first; on an outbound connection the peer
/// is waiting for it, on an inbound one it costs nothing as both sides may
/// send eagerly. The read and write buffers of the handshake codec are
/// carried over to the message codec, as the peer may have sent messages
/// right behind its handshake.
pub async fn establish(
    socket: TcpStream,
    handshake: Handshake,
) -> Result<(Handshake, Framed<TcpStream, PeerCodec>)> {
    let mut socket = Framed::new(socket, HandshakeCodec);
    socket.send(handshake).await?;

    let peer_handshake = match socket.next().await {
        Some(handshake) => handshake?,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer hung up before handshaking",
            )
            .into())
        }
    };

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    // reuse buffers of previous codec
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let socket = Framed::from_parts(new_parts);

    Ok((peer_handshake, socket))
}

/// Computes the allowed fast set for a peer (BEP 6): the deterministic set
/// of pieces the peer may request while choked.
///
/// The generator hashes the peer's address, truncated to its /24 network,
/// together with the info hash, then keeps hashing the digest and deriving
/// piece indices from it until the set is full. Both sides can compute the
/// same set without communicating.
///
/// Returns an empty set for non-IPv4 peers, for which the canonical
/// generator is not defined.
pub fn allowed_fast_set(
    ip: &IpAddr,
    info_hash: &Sha1Hash,
    piece_count: usize,
    set_size: usize,
) -> HashSet<PieceIndex> {
    let mut set = HashSet::new();
    let octets = match ip {
        IpAddr::V4(ip) => ip.octets(),
        IpAddr::V6(_) => return set,
    };
    let k = set_size.min(piece_count);
    if k == 0 {
        return set;
    }

    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&[octets[0], octets[1], octets[2], 0]);
    x.extend_from_slice(info_hash);

    while set.len() < k {
        let digest = Sha1::digest(&x);
        x = digest.to_vec();
        for chunk in digest.chunks_exact(4) {
            if set.len() >= k {
                break;
            }
            let index = u32::from_be_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3],
            ]) % piece_count as u32;
            set.insert(index as PieceIndex);
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use pretty_assertions::assert_eq;

    use super::*;

    fn session() -> PeerSession {
        PeerSession::new(
            "127.0.0.1:51413".parse().unwrap(),
            Direction::Outbound,
            100,
            Instant::now(),
        )
    }

    fn block(piece_index: PieceIndex) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset: 0,
            len: 0x4000,
        }
    }

    #[test]
    fn test_cancel_removes_queued_block() {
        let mut session = session();
        session.queue_read(block(3));
        let before = session.peer_request_count();
        assert_eq!(before, 1);

        assert!(session.read_completed(block(3), vec![0; 0x4000]));
        // the count covers the queued message until it is actually sent
        assert_eq!(session.peer_request_count(), 1);

        assert!(session.cancel(block(3)));
        assert_eq!(session.peer_request_count(), 0);
        assert!(!session.has_outbound());
        // a second cancel for the same block finds nothing
        assert!(!session.cancel(block(3)));
    }

    #[test]
    fn test_cancel_falls_back_to_pending_read() {
        let mut session = session();
        session.queue_read(block(5));
        assert!(session.cancel(block(5)));
        assert!(session.pending_reads().is_empty());
        assert_eq!(session.peer_request_count(), 0);
        // the read completion arriving afterwards is discarded
        assert!(!session.read_completed(block(5), vec![0; 0x4000]));
        assert!(!session.has_outbound());
    }

    #[test]
    fn test_cancel_removes_at_most_one() {
        let mut session = session();
        // the same block both queued and pending (a pathological peer
        // requesting twice); cancel must only take one
        session.queue_read(block(7));
        session.queue_read(block(7));
        assert!(session.read_completed(block(7), vec![0; 0x4000]));
        assert_eq!(session.peer_request_count(), 2);

        assert!(session.cancel(block(7)));
        assert_eq!(session.peer_request_count(), 1);
        // the queued message went first; the pending read remains
        assert!(!session.has_outbound());
        assert_eq!(session.pending_reads().len(), 1);
    }

    #[test]
    fn test_dequeue_settles_block_accounting() {
        let mut session = session();
        session.queue_read(block(1));
        session.read_completed(block(1), vec![0; 0x4000]);

        let now = Instant::now();
        let msg = session.dequeue(now).expect("queued message");
        assert!(matches!(msg, Message::Block { .. }));
        assert_eq!(session.peer_request_count(), 0);
        assert_eq!(session.last_message_sent, now);
    }

    #[test]
    fn test_block_arrival_accounting() {
        let mut session = session();
        session.register_requests(&[block(1), block(2)]);
        assert_eq!(session.requesting_count(), 2);

        assert!(session.block_arrived(block(1)));
        assert_eq!(session.requesting_count(), 1);
        assert_eq!(session.pieces_received, 1);

        // an unsolicited block is flagged
        assert!(!session.block_arrived(block(9)));
        assert_eq!(session.pieces_received, 1);
    }

    #[test]
    fn test_allowed_fast_set_is_deterministic() {
        let ip: IpAddr = "80.4.4.200".parse().unwrap();
        let info_hash = [0xaa; 20];
        let a = allowed_fast_set(&ip, &info_hash, 1313, 7);
        let b = allowed_fast_set(&ip, &info_hash, 1313, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 7);
        assert!(a.iter().all(|&index| index < 1313));
    }

    #[test]
    fn test_allowed_fast_set_ignores_low_octet() {
        // the generator only sees the /24 network of the address
        let info_hash = [0xaa; 20];
        let a = allowed_fast_set(
            &"80.4.4.200".parse().unwrap(),
            &info_hash,
            1313,
            7,
        );
        let b = allowed_fast_set(
            &"80.4.4.1".parse().unwrap(),
            &info_hash,
            1313,
            7,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_allowed_fast_set_caps_at_piece_count() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let set = allowed_fast_set(&ip, &[0x55; 20], 4, 10);
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_allowed_fast_set_empty_without_metadata() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(allowed_fast_set(&ip, &[0x55; 20], 0, 10).is_empty());
    }

    #[tokio::test]
    async fn test_establish_exchanges_handshakes() {
        let info_hash = [0x21; 20];
        let server_id = *b"pc-see00000000000000";
        let client_id = *b"pc-lee00000000000000";

        let bind_addr: std::net::SocketAddr = "127.0.0.1:0".parse().expect("parse addr");
        let mut listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let (peer_handshake, mut socket) =
                establish(socket, Handshake::new(info_hash, server_id))
                    .await
                    .expect("server handshake");
            // a message right behind the handshake must survive the codec
            // switchover on the other side
            socket.send(Message::Interested).await.expect("send");
            peer_handshake
        });

        let socket = TcpStream::connect(addr).await.expect("connect");
        let (peer_handshake, mut socket) =
            establish(socket, Handshake::new(info_hash, client_id))
                .await
                .expect("client handshake");
        assert_eq!(peer_handshake.peer_id, server_id);
        assert_eq!(peer_handshake.info_hash, info_hash);

        let msg = socket
            .next()
            .await
            .expect("message")
            .expect("valid message");
        assert_eq!(msg, Message::Interested);

        let server_saw = server.await.expect("server task");
        assert_eq!(server_saw.peer_id, client_id);
    }
}
