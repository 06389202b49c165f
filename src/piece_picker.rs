//! The interface to the piece selection policy.
//!
//! Which piece to download next is a policy decision with many viable
//! strategies (rarest first, sequential, random first piece), none of which
//! concern the protocol engine. The engine only reports what happened on the
//! wire and asks for the next batch of requests.

use crate::{peer::PeerSession, BlockInfo};

/// The piece picker of a torrent.
///
/// One picker instance serves all of a torrent's peer sessions, so it can
/// weigh global availability when choosing. All calls are made from the
/// torrent's own task, in wire receive order.
pub trait Picker: Send {
    /// Picks up to `up_to` block requests to send to this peer.
    ///
    /// The returned blocks become the engine's in-flight requests to the
    /// peer; the picker must not hand the same block to another session
    /// until it is cancelled or times out.
    fn pick_requests(
        &mut self,
        session: &PeerSession,
        up_to: usize,
    ) -> Vec<BlockInfo>;

    /// Cancels a single in-flight request to this peer, releasing the block
    /// for other sessions. Invoked when the peer rejects a request.
    fn cancel_request(&mut self, session: &PeerSession, block: BlockInfo);

    /// Cancels all in-flight requests to this peer. Invoked when the peer
    /// chokes us without the fast extension and when the session closes.
    fn cancel_all(&mut self, session: &PeerSession);

    /// A requested block arrived from this peer.
    fn piece_received(
        &mut self,
        session: &PeerSession,
        block: BlockInfo,
        data: Vec<u8>,
    );

    /// Returns true if the peer has at least one piece we still want. The
    /// dispatcher uses this to recompute our interest whenever the peer's
    /// availability changes.
    fn is_interesting(&self, session: &PeerSession) -> bool;
}
