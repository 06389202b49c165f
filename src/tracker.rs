//! The interface to the tracker subsystem.
//!
//! The announce and scrape transports (HTTP and UDP alike) live outside the
//! engine; the tick loop only decides *when* the next announce is due and
//! which event it carries.

use std::time::{Duration, Instant};

/// The event field of an announce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// A periodic announce with no event.
    None,
    /// The torrent has just started.
    Started,
    /// The download completed; the torrent is now seeding.
    Completed,
    /// The torrent is shutting down.
    Stopped,
}

/// A tracker the torrent may currently announce to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tracker {
    /// The announce URL, opaque to the engine.
    pub url: String,
}

/// The tracker list of a torrent.
///
/// The implementation owns tier fallback, transport, and retry policy. The
/// tick loop issues at most one announce per tick, pacing itself by
/// [`TrackerManager::update_interval`] after a successful announce and
/// [`TrackerManager::min_update_interval`] after a failed one.
pub trait TrackerManager: Send {
    /// The tracker an announce would currently go to, if any.
    fn current(&self) -> Option<&Tracker>;

    /// Fires an announce towards the current tracker.
    fn announce(&mut self, event: AnnounceEvent);

    /// When the last announce finished, successfully or not. `None` before
    /// the first announce completes.
    fn last_updated(&self) -> Option<Instant>;

    /// Whether the last announce succeeded.
    fn update_succeeded(&self) -> bool;

    /// The interval the tracker asked us to keep between announces.
    fn update_interval(&self) -> Duration;

    /// The retry interval after a failed announce.
    fn min_update_interval(&self) -> Duration;
}
