//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

use crate::PeerId;

/// The default peercore client id.
pub const PEERCORE_CLIENT_ID: &PeerId = b"pc-00000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults. It uses the
    /// default peercore client id, [`PEERCORE_CLIENT_ID`].
    pub fn new() -> Self {
        Self {
            engine: EngineConf {
                client_id: *PEERCORE_CLIENT_ID,
            },
            torrent: TorrentConf::default(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The max number of connected peers the torrent should have.
    pub max_connections: usize,

    /// The interval at which the torrent's periodic bookkeeping runs. All
    /// timeouts below are measured on this loop's clock.
    pub tick_interval: Duration,

    /// Whether the torrent is private (BEP 27). Private torrents never use
    /// peer exchange or the DHT to find peers.
    pub private: bool,

    /// Whether to withhold a `Have` announcement from peers that already
    /// have the piece. Saves a few bytes per finished piece on large swarms.
    pub have_suppression_enabled: bool,

    /// Whether peer exchange is enabled for this torrent at all. Ignored on
    /// private torrents, which never exchange peers.
    pub enable_peer_exchange: bool,

    /// The least time that must pass between two runs of the choke
    /// algorithm.
    pub min_time_between_reviews: Duration,

    /// If the torrent's upload rate is above this percentage of the upload
    /// rate limit, the periodic choke review is skipped, as reshuffling
    /// a link that is already saturated only costs us. Zero disables the
    /// shortcut.
    pub percent_of_max_rate_to_skip_review: u64,

    /// The torrent's upload rate limit, in bytes per second, used only by
    /// the review-skip shortcut above. Zero means unlimited.
    pub max_upload_rate: u64,

    /// Webseeds are only attached once the download has had time to get off
    /// the ground and is still slower than this many KiB/s. Zero disables
    /// the speed gate, attaching webseeds unconditionally.
    pub add_webseeds_speed_limit: u64,

    /// The number of requests to keep pipelined to a peer before throughput
    /// based scaling kicks in.
    pub normal_request_queue_len: usize,

    /// One extra pipelined request is allowed per this many KiB/s of
    /// download throughput measured from the peer.
    pub request_bonus_per_kbps: u64,

    /// The number of pieces each peer may request while choked, per the
    /// fast extension's allowed fast set.
    pub allowed_fast_set_size: usize,
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self {
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connections: 50,
            tick_interval: Duration::from_millis(50),
            private: false,
            have_suppression_enabled: false,
            enable_peer_exchange: true,
            min_time_between_reviews: Duration::from_secs(30),
            percent_of_max_rate_to_skip_review: 90,
            max_upload_rate: 0,
            add_webseeds_speed_limit: 15,
            normal_request_queue_len: 8,
            request_bonus_per_kbps: 10,
            allowed_fast_set_size: 10,
        }
    }
}
