//! Shared fixtures for the dispatcher and tick loop tests: a torrent wired
//! up to recording mocks of all its collaborators and a virtual clock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    clock::test::VirtualClock,
    conf::TorrentConf,
    counter::ThruputMonitor,
    peer::{codec::Handshake, codec::Message, Direction, PeerSession},
    piece_picker::Picker,
    tracker::{AnnounceEvent, Tracker, TrackerManager},
    BlockInfo, PieceIndex,
};

use super::{
    Observer, PeerKey, PeerSource, ReciprocityController, Torrent,
    TorrentParams, Transport,
};

pub(crate) const INFO_HASH: [u8; 20] = [0x21; 20];
pub(crate) const CLIENT_ID: &[u8; 20] = b"pc-00000000000000000";
pub(crate) const PIECE_COUNT: usize = 100;
pub(crate) const PIECE_LEN: u32 = 0x4000;
pub(crate) const LAST_PIECE_LEN: u32 = 1234;

#[derive(Default)]
pub(crate) struct PickerCalls {
    pub cancel_all: usize,
    pub cancel_request: Vec<BlockInfo>,
    pub received: Vec<BlockInfo>,
    pub pick_calls: usize,
}

/// A picker that records what the engine asks of it and hands out
/// a preconfigured batch of requests.
pub(crate) struct MockPicker {
    pub calls: Arc<Mutex<PickerCalls>>,
    /// What `is_interesting` answers.
    pub interesting: Arc<Mutex<bool>>,
    /// Blocks handed out by the next `pick_requests` calls, in order.
    pub to_pick: Arc<Mutex<Vec<BlockInfo>>>,
}

impl MockPicker {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(PickerCalls::default())),
            interesting: Arc::new(Mutex::new(true)),
            to_pick: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Picker for MockPicker {
    fn pick_requests(
        &mut self,
        _session: &PeerSession,
        up_to: usize,
    ) -> Vec<BlockInfo> {
        let mut calls = self.calls.lock().unwrap();
        calls.pick_calls += 1;
        let mut pool = self.to_pick.lock().unwrap();
        let count = up_to.min(pool.len());
        pool.drain(..count).collect()
    }

    fn cancel_request(&mut self, _session: &PeerSession, block: BlockInfo) {
        self.calls.lock().unwrap().cancel_request.push(block);
    }

    fn cancel_all(&mut self, _session: &PeerSession) {
        self.calls.lock().unwrap().cancel_all += 1;
    }

    fn piece_received(
        &mut self,
        _session: &PeerSession,
        block: BlockInfo,
        _data: Vec<u8>,
    ) {
        self.calls.lock().unwrap().received.push(block);
    }

    fn is_interesting(&self, _session: &PeerSession) -> bool {
        *self.interesting.lock().unwrap()
    }
}

/// A choke controller that only counts its reviews.
pub(crate) struct MockChoker {
    pub reviews: Arc<Mutex<usize>>,
}

impl MockChoker {
    pub fn new() -> Self {
        Self {
            reviews: Arc::new(Mutex::new(0)),
        }
    }
}

impl ReciprocityController for MockChoker {
    fn review(&mut self, _peers: &mut HashMap<PeerKey, PeerSession>) {
        *self.reviews.lock().unwrap() += 1;
    }
}

/// A tracker manager with scriptable pacing state.
pub(crate) struct MockTracker {
    pub announces: Arc<Mutex<Vec<AnnounceEvent>>>,
    pub tracker: Option<Tracker>,
    pub last_updated: Arc<Mutex<Option<Instant>>>,
    pub succeeded: Arc<Mutex<bool>>,
    pub update_interval: Duration,
    pub min_update_interval: Duration,
}

impl MockTracker {
    pub fn new() -> Self {
        Self {
            announces: Arc::new(Mutex::new(Vec::new())),
            tracker: Some(Tracker {
                url: "http://tracker.example/announce".into(),
            }),
            last_updated: Arc::new(Mutex::new(None)),
            succeeded: Arc::new(Mutex::new(true)),
            update_interval: Duration::from_secs(1800),
            min_update_interval: Duration::from_secs(60),
        }
    }
}

impl TrackerManager for MockTracker {
    fn current(&self) -> Option<&Tracker> {
        self.tracker.as_ref()
    }

    fn announce(&mut self, event: AnnounceEvent) {
        self.announces.lock().unwrap().push(event);
    }

    fn last_updated(&self) -> Option<Instant> {
        *self.last_updated.lock().unwrap()
    }

    fn update_succeeded(&self) -> bool {
        *self.succeeded.lock().unwrap()
    }

    fn update_interval(&self) -> Duration {
        self.update_interval
    }

    fn min_update_interval(&self) -> Duration {
        self.min_update_interval
    }
}

/// A transport that records drain signals and closes.
pub(crate) struct MockTransport {
    pub processed: Arc<Mutex<Vec<PeerKey>>>,
    pub closed: Arc<Mutex<Vec<(PeerKey, String)>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Transport for MockTransport {
    fn process_queue(&mut self, peer: PeerKey) {
        self.processed.lock().unwrap().push(peer);
    }

    fn close(&mut self, peer: PeerKey, reason: &str) {
        self.closed.lock().unwrap().push((peer, reason.to_string()));
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Event {
    Connected(PeerKey, Direction),
    Disconnected(PeerKey),
    PeersFound(usize, usize, PeerSource),
}

pub(crate) struct RecordingObserver {
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl Observer for RecordingObserver {
    fn peer_connected(&mut self, peer: PeerKey, direction: Direction) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Connected(peer, direction));
    }

    fn peer_disconnected(&mut self, peer: PeerKey) {
        self.events.lock().unwrap().push(Event::Disconnected(peer));
    }

    fn peers_found(&mut self, added: usize, offered: usize, source: PeerSource) {
        self.events
            .lock()
            .unwrap()
            .push(Event::PeersFound(added, offered, source));
    }
}

/// A torrent wired to mocks, with handles to everything the tests assert
/// on.
pub(crate) struct Harness {
    pub torrent: Torrent,
    pub clock: Arc<VirtualClock>,
    pub picker_calls: Arc<Mutex<PickerCalls>>,
    pub picker_interesting: Arc<Mutex<bool>>,
    pub picker_to_pick: Arc<Mutex<Vec<BlockInfo>>>,
    pub reviews: Arc<Mutex<usize>>,
    pub announces: Arc<Mutex<Vec<AnnounceEvent>>>,
    pub tracker_last_updated: Arc<Mutex<Option<Instant>>>,
    pub tracker_succeeded: Arc<Mutex<bool>>,
    pub processed: Arc<Mutex<Vec<PeerKey>>>,
    pub closed: Arc<Mutex<Vec<(PeerKey, String)>>>,
    pub events: Arc<Mutex<Vec<Event>>>,
}

pub(crate) fn harness(conf: TorrentConf) -> Harness {
    harness_with(conf, Some(vec![0xab; 20_000]), Vec::new())
}

pub(crate) fn harness_with(
    conf: TorrentConf,
    metadata: Option<Vec<u8>>,
    webseeds: Vec<String>,
) -> Harness {
    let clock = Arc::new(VirtualClock::new());
    let picker = MockPicker::new();
    let choker = MockChoker::new();
    let tracker = MockTracker::new();
    let transport = MockTransport::new();

    let picker_calls = Arc::clone(&picker.calls);
    let picker_interesting = Arc::clone(&picker.interesting);
    let picker_to_pick = Arc::clone(&picker.to_pick);
    let reviews = Arc::clone(&choker.reviews);
    let announces = Arc::clone(&tracker.announces);
    let tracker_last_updated = Arc::clone(&tracker.last_updated);
    let tracker_succeeded = Arc::clone(&tracker.succeeded);
    let processed = Arc::clone(&transport.processed);
    let closed = Arc::clone(&transport.closed);

    let mut torrent = Torrent::new(TorrentParams {
        info_hash: INFO_HASH,
        client_id: *CLIENT_ID,
        piece_count: PIECE_COUNT,
        piece_len: PIECE_LEN,
        last_piece_len: LAST_PIECE_LEN,
        metadata,
        listen_port: Some(6881),
        webseeds,
        conf,
        clock: Arc::clone(&clock) as Arc<dyn crate::clock::Clock>,
        picker: Box::new(picker),
        choker: Box::new(choker),
        tracker: Box::new(tracker),
        monitor: Box::new(ThruputMonitor::default()),
        transport: Box::new(transport),
    });

    let events = Arc::new(Mutex::new(Vec::new()));
    torrent.subscribe(Box::new(RecordingObserver {
        events: Arc::clone(&events),
    }));

    Harness {
        torrent,
        clock,
        picker_calls,
        picker_interesting,
        picker_to_pick,
        reviews,
        announces,
        tracker_last_updated,
        tracker_succeeded,
        processed,
        closed,
        events,
    }
}

/// Registers a connection and walks it through a successful handshake,
/// with or without the fast and extended capabilities.
pub(crate) fn connect(h: &mut Harness, fast: bool, extended: bool) -> PeerKey {
    let key = h
        .torrent
        .connect_peer("10.1.2.3:51413".parse().unwrap(), Direction::Inbound)
        .expect("connection slot");
    let mut handshake = Handshake::new(INFO_HASH, [0x99; 20]);
    if !fast {
        handshake.reserved[7] &= !0x04;
    }
    if !extended {
        handshake.reserved[5] &= !0x10;
    }
    h.torrent
        .handle_handshake(key, handshake)
        .expect("handshake");
    key
}

pub(crate) fn clear_queue(h: &mut Harness, key: PeerKey) {
    h.torrent.peer_mut(key).unwrap().clear_outbound();
}

pub(crate) fn queued(h: &Harness, key: PeerKey) -> Vec<Message> {
    h.torrent
        .peer(key)
        .map(|s| s.outbound().cloned().collect())
        .unwrap_or_default()
}

pub(crate) fn block(piece_index: PieceIndex, len: u32) -> BlockInfo {
    BlockInfo {
        piece_index,
        offset: 0,
        len,
    }
}
