//! The per-torrent engine: the session table, the periodic bookkeeping
//! tick, and the seams to the collaborating subsystems.
//!
//! A torrent runs single threaded and cooperatively: the message
//! dispatcher (see the `dispatch` module) and [`Torrent::tick`] are never
//! invoked concurrently for the same torrent, so session state needs no
//! locking. Different torrents may live on different workers.

pub(crate) mod dispatch;
#[cfg(test)]
pub(crate) mod test_util;

use std::{
    collections::HashMap,
    mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    clock::Clock,
    conf::TorrentConf,
    counter::Monitor,
    error::{Error, Result},
    peer::{
        allowed_fast_set,
        codec::Message,
        extensions::ExtendedHandshake,
        Direction, PeerSession, SessionState,
    },
    piece_picker::Picker,
    tracker::{AnnounceEvent, TrackerManager},
    Bitfield, PeerId, PieceIndex, Sha1Hash,
};

/// Identifies a peer session within its torrent. Sessions refer to each
/// other and to the torrent by key only, so there are no ownership cycles.
pub type PeerKey = u32;

/// How long a quiet link goes before we nudge it with a keepalive.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(90);

/// A peer silent for this long is disconnected outright.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(180);

/// A peer that owes us blocks and has been silent this long is dropped.
const REQUEST_STALL_TIMEOUT: Duration = Duration::from_secs(50);

/// How often the inactive peer pass runs, in milliseconds of tick time.
const INACTIVE_POLL_INTERVAL_MS: u64 = 5000;

/// A peer that has never produced a block within this time while we wanted
/// some is considered dead weight when connections are scarce.
const INACTIVE_PEER_TIMEOUT: Duration = Duration::from_secs(60);

/// Webseeds are held back this long to give the swarm a chance first.
const WEBSEED_HOLDBACK: Duration = Duration::from_secs(60);

/// The most peer candidates kept around waiting for a free connection.
const CANDIDATE_POOL_MAX: usize = 100;

/// Where a batch of discovered peers came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Webseed,
}

/// The torrent's mode, deciding which bookkeeping the tick loop runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentState {
    Downloading,
    Seeding,
}

/// The choke algorithm, consumed as a black box.
///
/// The engine invokes one review at most every
/// `TorrentConf::min_time_between_reviews`; everything else, including
/// which peers to choke and optimistic unchoke rotation, is the
/// implementation's business.
pub trait ReciprocityController: Send {
    fn review(&mut self, peers: &mut HashMap<PeerKey, PeerSession>);
}

/// The connection layer of a torrent.
///
/// The engine enqueues messages into sessions and then signals the
/// transport to drain them; it never performs I/O itself.
pub trait Transport: Send {
    /// The session's queue has messages and no send is in flight.
    fn process_queue(&mut self, peer: PeerKey);
    /// Severs the connection. `reason` is a human readable explanation
    /// that ends up in the event stream.
    fn close(&mut self, peer: PeerKey, reason: &str);
}

/// Gets notified of torrent lifecycle events. Delivery is synchronous on
/// the torrent's task.
#[allow(unused_variables)]
pub trait Observer: Send {
    fn peer_connected(&mut self, peer: PeerKey, direction: Direction) {}
    fn peer_disconnected(&mut self, peer: PeerKey) {}
    fn peers_found(&mut self, added: usize, offered: usize, source: PeerSource) {
    }
}

/// A handler for an extension message id outside the built-in registry.
pub trait ExtensionHandler: Send {
    fn handle(&mut self, peer: PeerKey, payload: &[u8]);
}

/// Everything a torrent needs at construction.
pub struct TorrentParams {
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub piece_count: usize,
    /// The nominal piece length, in bytes.
    pub piece_len: u32,
    /// The length of the last piece, which may be shorter than the rest.
    pub last_piece_len: u32,
    /// The raw bencoded info dictionary, if available. Serves metadata
    /// requests (BEP 9) and gates allowed fast set generation.
    pub metadata: Option<Vec<u8>>,
    /// The port our own listener accepts peers on, advertised in the
    /// extended handshake.
    pub listen_port: Option<u16>,
    /// HTTP seeds to fall back on if the swarm underperforms.
    pub webseeds: Vec<String>,
    pub conf: TorrentConf,
    pub clock: Arc<dyn Clock>,
    pub picker: Box<dyn Picker>,
    pub choker: Box<dyn ReciprocityController>,
    pub tracker: Box<dyn TrackerManager>,
    pub monitor: Box<dyn Monitor>,
    pub transport: Box<dyn Transport>,
}

/// A single torrent's engine state.
pub struct Torrent {
    pub(crate) info_hash: Sha1Hash,
    pub(crate) client_id: PeerId,
    pub(crate) piece_count: usize,
    pub(crate) piece_len: u32,
    pub(crate) last_piece_len: u32,
    pub(crate) metadata: Option<Vec<u8>>,
    pub(crate) listen_port: Option<u16>,
    pub(crate) conf: TorrentConf,

    /// Which pieces we have verified on disk. Only the verification
    /// subsystem flips bits, via [`Torrent::piece_verified`], and only
    /// from false to true.
    pub(crate) own_bitfield: Bitfield,
    /// Pieces verified since the last tick, awaiting `Have` broadcast.
    pub(crate) finished_pieces: Vec<PieceIndex>,

    pub(crate) state: TorrentState,
    /// Set when an internal invariant breaks. A poisoned torrent refuses
    /// new connections and waits for the host to tear it down.
    pub(crate) poisoned: bool,

    pub(crate) peers: HashMap<PeerKey, PeerSession>,
    next_peer_key: PeerKey,
    /// Addresses we could connect to if a slot opens, fed by PeX and the
    /// host's discovery sources.
    pub(crate) candidates: Vec<SocketAddr>,
    webseeds: Vec<String>,
    webseeds_attached: bool,

    pub(crate) clock: Arc<dyn Clock>,
    started_at: Instant,
    last_review: Option<Instant>,

    pub(crate) picker: Box<dyn Picker>,
    choker: Box<dyn ReciprocityController>,
    tracker: Box<dyn TrackerManager>,
    monitor: Box<dyn Monitor>,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) observers: Vec<Box<dyn Observer>>,
    pub(crate) ext_handlers: HashMap<u8, Box<dyn ExtensionHandler>>,
}

impl Torrent {
    pub fn new(params: TorrentParams) -> Self {
        let TorrentParams {
            info_hash,
            client_id,
            piece_count,
            piece_len,
            last_piece_len,
            metadata,
            listen_port,
            webseeds,
            conf,
            clock,
            picker,
            choker,
            tracker,
            monitor,
            transport,
        } = params;
        let mut own_bitfield = Bitfield::new();
        own_bitfield.resize(piece_count, false);
        let started_at = clock.now();
        Self {
            info_hash,
            client_id,
            piece_count,
            piece_len,
            last_piece_len,
            metadata,
            listen_port,
            conf,
            own_bitfield,
            finished_pieces: Vec::new(),
            state: TorrentState::Downloading,
            poisoned: false,
            peers: HashMap::new(),
            next_peer_key: 0,
            candidates: Vec::new(),
            webseeds,
            webseeds_attached: false,
            clock,
            started_at,
            last_review: None,
            picker,
            choker,
            tracker,
            monitor,
            transport,
            observers: Vec::new(),
            ext_handlers: HashMap::new(),
        }
    }

    pub fn info_hash(&self) -> &Sha1Hash {
        &self.info_hash
    }

    pub fn state(&self) -> TorrentState {
        self.state
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.own_bitfield
    }

    pub fn peers(&self) -> &HashMap<PeerKey, PeerSession> {
        &self.peers
    }

    pub fn peer(&self, key: PeerKey) -> Option<&PeerSession> {
        self.peers.get(&key)
    }

    pub fn peer_mut(&mut self, key: PeerKey) -> Option<&mut PeerSession> {
        self.peers.get_mut(&key)
    }

    /// Subscribes an observer to the torrent's events.
    pub fn subscribe(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Registers a handler for an extension message id outside the
    /// built-in registry. Inbound extended messages with this id are
    /// delivered to the handler instead of being dropped.
    pub fn register_extension(
        &mut self,
        id: u8,
        handler: Box<dyn ExtensionHandler>,
    ) {
        self.ext_handlers.insert(id, handler);
    }

    /// The length of the piece at the given index.
    pub(crate) fn piece_len(&self, index: PieceIndex) -> Option<u32> {
        if index + 1 == self.piece_count {
            Some(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Some(self.piece_len)
        } else {
            None
        }
    }

    /// Registers a freshly established transport connection and returns
    /// the key its session is tracked under. The protocol handshake is
    /// still ahead of the session at this point.
    pub fn connect_peer(
        &mut self,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<PeerKey> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }
        if self.peers.len() >= self.conf.max_connections {
            return Err(Error::ConnectionLimitReached);
        }
        let key = self.next_peer_key;
        self.next_peer_key += 1;
        let session = PeerSession::new(
            addr,
            direction,
            self.piece_count,
            self.clock.now(),
        );
        log::info!(
            "Peer {} (key {}) connected ({:?})",
            addr,
            key,
            direction
        );
        self.peers.insert(key, session);
        Ok(key)
    }

    /// Tears down a session: drops its queued messages, cancels its
    /// requests with the picker, closes the transport, and publishes the
    /// disconnect.
    pub fn close_session(&mut self, key: PeerKey, reason: &str) {
        let mut session = match self.peers.remove(&key) {
            Some(session) => session,
            None => return,
        };
        log::info!("Closing peer {} (key {}): {}", session.addr, key, reason);
        session.clear_outbound();
        self.picker.cancel_all(&session);
        self.transport.close(key, reason);
        for observer in &mut self.observers {
            observer.peer_disconnected(key);
        }
    }

    /// Notes a piece that passed hash verification. The piece is
    /// broadcast to connected peers on the next tick.
    ///
    /// Completion of the last piece flips the torrent to seeding and
    /// announces the fact to the tracker.
    pub fn piece_verified(&mut self, index: PieceIndex) -> Result<()> {
        if index >= self.piece_count {
            self.poison("verified piece index out of range");
            return Err(Error::InvariantViolation(
                "verified piece index out of range",
            ));
        }
        if self.own_bitfield[index] {
            log::warn!("Piece {} verified twice", index);
            return Ok(());
        }
        self.own_bitfield.set(index, true);
        self.finished_pieces.push(index);

        if self.own_bitfield.all() && self.state == TorrentState::Downloading {
            log::info!("Torrent {} complete, seeding", hex::encode(self.info_hash));
            self.state = TorrentState::Seeding;
            self.tracker.announce(AnnounceEvent::Completed);
        }
        Ok(())
    }

    /// Marks the torrent as unusable after a broken invariant. New
    /// connections are refused; the host is expected to shut the torrent
    /// down.
    pub(crate) fn poison(&mut self, what: &'static str) {
        if !self.poisoned {
            log::error!(
                "Torrent {} poisoned: {}",
                hex::encode(self.info_hash),
                what
            );
            self.poisoned = true;
        }
    }

    /// Runs one round of the torrent's periodic bookkeeping.
    ///
    /// The host invokes this at a fixed cadence (`conf.tick_interval`,
    /// 50 ms by default) with a monotonically increasing counter.
    pub fn tick(&mut self, counter: u64) {
        let now = self.clock.now();
        let tick_ms = self.conf.tick_interval.as_millis().max(1) as u64;

        // once a second, refresh the rate accounting
        if counter % (1000 / tick_ms).max(1) == 0 {
            self.monitor.tick();
            for session in self.peers.values_mut() {
                session.counters.tick();
            }
        }

        if !self.finished_pieces.is_empty() {
            self.broadcast_finished_pieces();
        }

        // rescale each connected peer's request pipeline from its measured
        // throughput, bounded by what the peer advertised
        for session in self.peers.values_mut() {
            if session.state != SessionState::Connected {
                continue;
            }
            let down_kbps = session.counters.down.avg() / 1024;
            let scaled = self.conf.normal_request_queue_len
                + (down_kbps / self.conf.request_bonus_per_kbps.max(1))
                    as usize;
            let mut max = scaled.min(session.requesting_count() + 2);
            if let Some(advertised) = session.peer_advertised_max {
                max = max.min(advertised);
            }
            session.max_pending_requests = max.max(2);
        }

        match self.state {
            TorrentState::Downloading => {
                self.maybe_attach_webseeds(now);
                if counter % (INACTIVE_POLL_INTERVAL_MS / tick_ms).max(1) == 0
                {
                    self.evict_inactive_peers(now);
                }
                self.maybe_review(now);
            }
            TorrentState::Seeding => {
                self.maybe_review(now);
            }
        }

        self.post_tick(now);
        self.maybe_announce(now);
    }

    /// Broadcasts `Have` messages for the pieces verified since the last
    /// tick.
    ///
    /// A peer that already has the piece triggers an interest
    /// recomputation (we may want nothing from it anymore) and, with have
    /// suppression on, is spared the announcement.
    fn broadcast_finished_pieces(&mut self) {
        let finished = mem::take(&mut self.finished_pieces);
        let Self {
            peers,
            picker,
            conf,
            ..
        } = self;
        for session in peers.values_mut() {
            if session.state != SessionState::Connected {
                continue;
            }
            for &piece in &finished {
                let peer_has = session.bitfield[piece];
                if peer_has {
                    dispatch::update_interest(picker.as_mut(), session);
                }
                if !peer_has || !conf.have_suppression_enabled {
                    session.enqueue(Message::Have { piece_index: piece });
                }
            }
        }
    }

    /// Attaches the torrent's webseeds, at most once per torrent
    /// lifetime, once the swarm has had a minute and is still below the
    /// configured rate.
    fn maybe_attach_webseeds(&mut self, now: Instant) {
        if self.webseeds_attached || self.webseeds.is_empty() {
            return;
        }
        if now.duration_since(self.started_at) < WEBSEED_HOLDBACK {
            return;
        }
        let limit = self.conf.add_webseeds_speed_limit;
        if limit > 0 && self.monitor.download_rate() >= limit * 1024 {
            return;
        }

        let offered = self.webseeds.len();
        log::info!("Attaching {} webseed(s)", offered);
        self.webseeds.clear();
        self.webseeds_attached = true;
        for observer in &mut self.observers {
            observer.peers_found(offered, offered, PeerSource::Webseed);
        }
    }

    /// Disconnects peers that never delivered a block despite our
    /// interest, once connections are scarce. Runs every 5 seconds of
    /// tick time.
    fn evict_inactive_peers(&mut self, now: Instant) {
        if self.peers.len() < self.conf.max_connections {
            return;
        }
        let stale: Vec<PeerKey> = self
            .peers
            .iter()
            .filter(|(_, session)| {
                session.state == SessionState::Connected
                    && session.am_interested
                    && session.pieces_received == 0
                    && now.duration_since(session.connected_at)
                        > INACTIVE_PEER_TIMEOUT
            })
            .map(|(&key, _)| key)
            .collect();
        for key in stale {
            self.close_session(key, "Inactive");
        }
    }

    /// Invokes the choke algorithm, unless one ran too recently or the
    /// upload link is already saturated.
    fn maybe_review(&mut self, now: Instant) {
        let pct = self.conf.percent_of_max_rate_to_skip_review;
        if pct > 0 && self.conf.max_upload_rate > 0 {
            let threshold = self.conf.max_upload_rate * pct / 100;
            if self.monitor.upload_rate() >= threshold {
                return;
            }
        }
        if let Some(last) = self.last_review {
            if now.duration_since(last) < self.conf.min_time_between_reviews {
                return;
            }
        }
        self.choker.review(&mut self.peers);
        self.last_review = Some(now);
    }

    /// The per-session post pass: queue drains, keepalives, and the
    /// inactivity disconnects.
    fn post_tick(&mut self, now: Instant) {
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            let session = match self.peers.get_mut(&key) {
                Some(session) => session,
                None => continue,
            };
            if session.state != SessionState::Connected {
                continue;
            }

            if session.has_outbound() && !session.send_in_flight {
                self.transport.process_queue(key);
            }

            let session = self.peers.get_mut(&key).expect("looked up above");
            if now.duration_since(session.last_message_sent)
                > KEEPALIVE_TIMEOUT
            {
                session.enqueue(Message::KeepAlive);
                session.last_message_sent = now;
            }

            let quiet = now.duration_since(session.last_message_received);
            if quiet > INACTIVITY_TIMEOUT {
                self.close_session(key, "Inactivity");
            } else if quiet > REQUEST_STALL_TIMEOUT
                && session.requesting_count() > 0
            {
                self.close_session(key, "Didn't send pieces");
            }
        }
    }

    /// Issues at most one announce per tick, paced by the tracker's
    /// intervals: the regular one after a success, the retry one after
    /// a failure.
    fn maybe_announce(&mut self, now: Instant) {
        if self.tracker.current().is_none() {
            return;
        }
        let wait = if self.tracker.update_succeeded() {
            self.tracker.update_interval()
        } else {
            self.tracker.min_update_interval()
        };
        let due = self
            .tracker
            .last_updated()
            .map_or(true, |last| now.duration_since(last) >= wait);
        if due {
            self.tracker.announce(AnnounceEvent::None);
        }
    }

    /// Sends the post-handshake bundle and publishes the connect event.
    /// Invoked by the dispatcher once the handshake verifies.
    pub(crate) fn on_handshake_completed(&mut self, key: PeerKey) {
        let metadata_size = self.metadata.as_ref().map(|m| m.len() as u32);
        let session = match self.peers.get_mut(&key) {
            Some(session) => session,
            None => return,
        };

        // the bundle opens with a bitfield class message: fast peers get
        // the compact HaveAll/HaveNone forms where applicable
        if session.supports_fast && self.own_bitfield.not_any() {
            session.enqueue(Message::HaveNone);
        } else if session.supports_fast && self.own_bitfield.all() {
            session.enqueue(Message::HaveAll);
        } else {
            let mut bitfield = self.own_bitfield.clone();
            // the wire form is padded to a whole number of bytes
            bitfield.resize((bitfield.len() + 7) / 8 * 8, false);
            session.enqueue(Message::Bitfield(bitfield));
        }

        if session.supports_extended {
            let ours =
                ExtendedHandshake::ours(self.listen_port, metadata_size);
            match ours.to_bytes() {
                Ok(payload) => session.enqueue(Message::Extended {
                    id: crate::peer::extensions::EXT_HANDSHAKE_ID,
                    payload,
                }),
                Err(e) => {
                    log::error!("Failed to encode extended handshake: {}", e)
                }
            }
        }

        let mut fast: Vec<PieceIndex> =
            session.allowed_fast_to_peer.iter().copied().collect();
        fast.sort_unstable();
        for piece_index in fast {
            session.enqueue(Message::AllowedFast { piece_index });
        }

        let direction = session.direction;
        for observer in &mut self.observers {
            observer.peer_connected(key, direction);
        }
    }

    /// Feeds discovered peer addresses into the candidate pool and
    /// publishes the discovery. Used by the PeX path internally and by the
    /// host for tracker and DHT results.
    ///
    /// Returns how many addresses were actually kept; duplicates and
    /// overflow beyond the pool bound are dropped.
    pub fn peers_discovered(
        &mut self,
        addrs: &[SocketAddr],
        source: PeerSource,
    ) -> usize {
        let offered = addrs.len();
        let mut added = 0;
        for addr in addrs {
            if self.candidates.len() >= CANDIDATE_POOL_MAX {
                break;
            }
            if self.candidates.contains(addr) {
                continue;
            }
            self.candidates.push(*addr);
            added += 1;
        }
        log::debug!(
            "Offered {} peer(s) from {:?}, kept {}",
            offered,
            source,
            added
        );
        for observer in &mut self.observers {
            observer.peers_found(added, offered, source);
        }
        added
    }

    /// Hands out a connection candidate for the host to dial.
    pub fn pop_candidate(&mut self) -> Option<SocketAddr> {
        self.candidates.pop()
    }

    /// Computes the allowed fast set for a peer at the given address.
    pub(crate) fn allowed_fast_for(
        &self,
        addr: &SocketAddr,
    ) -> std::collections::HashSet<PieceIndex> {
        allowed_fast_set(
            &addr.ip(),
            &self.info_hash,
            self.piece_count,
            self.conf.allowed_fast_set_size,
        )
    }
}
