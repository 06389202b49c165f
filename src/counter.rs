//! Throughput accounting for torrents and peer sessions.
//!
//! Rates are refreshed about once a second by the torrent's tick loop, so
//! a "round" below is a one second window.

/// The rate monitor of a torrent, consumed by the tick loop.
///
/// The host may implement this on top of whatever global rate limiting
/// machinery it uses; [`ThruputMonitor`] is a ready-made implementation.
pub trait Monitor: Send {
    /// Closes the current measurement round. Called about once a second.
    fn tick(&mut self);
    /// The current download rate, in bytes per second.
    fn download_rate(&self) -> u64;
    /// The current upload rate, in bytes per second.
    fn upload_rate(&self) -> u64;
}

/// Measures the throughput of a single direction of a transfer.
///
/// The counter keeps a running average over a 5 second sliding window: each
/// round's byte count is folded into the average with a weight of one fifth.
/// This smooths out the burstiness of piece arrivals without reacting too
/// slowly to a genuine rate change.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThruputCounter {
    /// The number of bytes recorded in the current round.
    round: u64,
    /// The running average, in bytes per second.
    avg: u64,
    /// The highest rate ever measured.
    peak: u64,
    /// The total number of bytes recorded since the counter was created.
    total: u64,
}

impl ThruputCounter {
    /// Records some bytes transferred in the current round.
    pub fn add(&mut self, bytes: u64) {
        self.round += bytes;
        self.total += bytes;
    }

    /// Closes the current round, folding it into the running average.
    pub fn tick(&mut self) {
        self.avg = (4 * self.avg + self.round) / 5;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
        self.round = 0;
    }

    /// The current rate, in bytes per second.
    pub fn avg(&self) -> u64 {
        self.avg
    }

    /// The highest rate measured over the counter's lifetime.
    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// The total number of bytes recorded.
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// A [`Monitor`] made of two [`ThruputCounter`]s, one per direction.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThruputMonitor {
    pub down: ThruputCounter,
    pub up: ThruputCounter,
}

impl Monitor for ThruputMonitor {
    fn tick(&mut self) {
        self.down.tick();
        self.up.tick();
    }

    fn download_rate(&self) -> u64 {
        self.down.avg()
    }

    fn upload_rate(&self) -> u64 {
        self.up.avg()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_converges_on_steady_rate() {
        let mut counter = ThruputCounter::default();
        for _ in 0..30 {
            counter.add(5000);
            counter.tick();
        }
        // the average should have converged close to the steady rate
        assert!(counter.avg() > 4500);
        assert!(counter.avg() <= 5000);
        assert_eq!(counter.total(), 30 * 5000);
    }

    #[test]
    fn test_avg_decays_when_idle() {
        let mut counter = ThruputCounter::default();
        counter.add(50_000);
        counter.tick();
        let busy = counter.avg();
        for _ in 0..20 {
            counter.tick();
        }
        assert!(counter.avg() < busy / 10);
        assert_eq!(counter.peak(), busy);
    }
}
