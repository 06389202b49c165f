//! The top of the library: a table of torrents keyed by info hash.
//!
//! Sessions and subsystems never hold references into each other; they
//! address a torrent by its info hash through the engine and a peer by its
//! key within the torrent, so there are no ownership cycles to manage.

use std::collections::HashMap;

use crate::{
    conf::Conf,
    error::{Error, Result},
    torrent::Torrent,
    Sha1Hash,
};

/// All state of the torrent engine.
pub struct Engine {
    conf: Conf,
    torrents: HashMap<Sha1Hash, Torrent>,
}

impl Engine {
    pub fn new(conf: Conf) -> Self {
        Self {
            conf,
            torrents: HashMap::new(),
        }
    }

    pub fn conf(&self) -> &Conf {
        &self.conf
    }

    /// Registers a torrent with the engine. Its info hash must be unique
    /// within the application.
    pub fn add_torrent(&mut self, torrent: Torrent) -> Result<()> {
        let info_hash = *torrent.info_hash();
        if self.torrents.contains_key(&info_hash) {
            log::warn!("Torrent {} already added", hex::encode(info_hash));
            return Err(Error::TorrentExists);
        }
        log::info!("Adding torrent {}", hex::encode(info_hash));
        self.torrents.insert(info_hash, torrent);
        Ok(())
    }

    /// Removes and returns a torrent. The host is responsible for closing
    /// its connections.
    pub fn remove_torrent(&mut self, info_hash: &Sha1Hash) -> Option<Torrent> {
        log::info!("Removing torrent {}", hex::encode(info_hash));
        self.torrents.remove(info_hash)
    }

    pub fn torrent(&self, info_hash: &Sha1Hash) -> Option<&Torrent> {
        self.torrents.get(info_hash)
    }

    pub fn torrent_mut(
        &mut self,
        info_hash: &Sha1Hash,
    ) -> Option<&mut Torrent> {
        self.torrents.get_mut(info_hash)
    }

    pub fn torrents(&self) -> impl Iterator<Item = &Torrent> {
        self.torrents.values()
    }

    /// Drives the periodic bookkeeping of every healthy torrent. Poisoned
    /// torrents are left alone until the host tears them down.
    pub fn tick(&mut self, counter: u64) {
        for torrent in self.torrents.values_mut() {
            if !torrent.is_poisoned() {
                torrent.tick(counter);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{conf::TorrentConf, torrent::test_util};

    use super::*;

    #[test]
    fn test_duplicate_torrent_is_refused() {
        let mut engine = Engine::new(Conf::new());
        let first = test_util::harness(TorrentConf::default()).torrent;
        let second = test_util::harness(TorrentConf::default()).torrent;

        engine.add_torrent(first).expect("first add");
        let err = engine.add_torrent(second).unwrap_err();
        assert!(matches!(err, Error::TorrentExists));
        assert_eq!(engine.torrents().count(), 1);
    }

    #[test]
    fn test_torrent_lookup_by_info_hash() {
        let mut engine = Engine::new(Conf::new());
        let torrent = test_util::harness(TorrentConf::default()).torrent;
        let info_hash = *torrent.info_hash();
        engine.add_torrent(torrent).expect("add");

        assert!(engine.torrent(&info_hash).is_some());
        assert!(engine.torrent_mut(&info_hash).is_some());
        assert!(engine.remove_torrent(&info_hash).is_some());
        assert!(engine.torrent(&info_hash).is_none());
    }
}
