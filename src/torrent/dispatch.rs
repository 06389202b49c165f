//! Validates incoming peer messages against the session's negotiated
//! capabilities and applies their state transitions.
//!
//! Dispatch is exhaustive over the message vocabulary: an id outside it
//! never gets this far (the codec rejects it), so "unknown message" is
//! a compile time concern here, not a runtime check.
//!
//! Every violation is fatal for the connection only: the session is closed,
//! its requests cancelled with the picker, and the disconnect published.
//! The torrent itself carries on.

use std::collections::HashSet;

use crate::{
    error::{Error, ProtocolError, Result},
    peer::{
        codec::{Handshake, Message, MessageId, PROTOCOL_STRING},
        extensions::{
            metadata_msg_type, ExtendedHandshake, MetadataMessage, PexMessage,
            EXT_HANDSHAKE_ID, UT_METADATA_ID, UT_PEX_ID,
        },
        PeerSession, SessionState,
    },
    piece_picker::Picker,
    Bitfield, BlockInfo, PieceIndex, MAX_REQUEST_LEN, MIN_REQUEST_LEN,
};

use super::{PeerKey, PeerSource, Torrent};

impl Torrent {
    /// Verifies a peer's handshake and, on success, promotes the session
    /// to connected and sends the opening message bundle.
    ///
    /// Any mismatch is fatal: the session is closed before the error is
    /// returned.
    pub fn handle_handshake(
        &mut self,
        key: PeerKey,
        handshake: Handshake,
    ) -> Result<()> {
        match self.verify_handshake(key, handshake) {
            Ok(()) => {
                self.on_handshake_completed(key);
                Ok(())
            }
            Err(e) => self.fatal(key, e),
        }
    }

    /// Validates and applies a message from a connected peer.
    ///
    /// On a protocol violation the session is closed before the error is
    /// returned; the caller needs no further cleanup.
    pub fn handle_message(
        &mut self,
        key: PeerKey,
        msg: Message,
    ) -> Result<()> {
        match self.dispatch(key, msg) {
            Ok(()) => Ok(()),
            Err(e) => self.fatal(key, e),
        }
    }

    /// Protocol violations close the offending session; broken invariants
    /// poison the torrent.
    fn fatal(&mut self, key: PeerKey, e: Error) -> Result<()> {
        match &e {
            Error::Protocol(violation) => {
                log::warn!("Peer {} violation: {}", key, violation);
                self.close_session(key, violation.close_reason());
            }
            Error::Transport(_) => {
                self.close_session(key, "Transport error");
            }
            Error::InvariantViolation(what) => self.poison(*what),
            _ => {}
        }
        Err(e)
    }

    fn verify_handshake(
        &mut self,
        key: PeerKey,
        handshake: Handshake,
    ) -> Result<()> {
        let now = self.clock.now();
        let (addr, state, known_id) = {
            let session = self.peers.get(&key).ok_or(
                Error::InvariantViolation("handshake for unknown peer key"),
            )?;
            (session.addr, session.state, session.peer_id)
        };

        if state != SessionState::Handshaking {
            return Err(ProtocolError::UnexpectedHandshake.into());
        }
        if handshake.prot[..] != *PROTOCOL_STRING.as_bytes() {
            return Err(ProtocolError::InvalidProtocolString.into());
        }
        if handshake.info_hash != self.info_hash {
            log::info!("Peer {} handshake invalid info hash", addr);
            return Err(ProtocolError::InvalidInfoHash.into());
        }
        // a peer learned from the tracker by id must present that id; on
        // first contact (compact form) we adopt whatever it advertises
        if let Some(known) = known_id {
            if known != handshake.peer_id {
                log::info!("Peer {} handshake invalid peer id", addr);
                return Err(ProtocolError::InvalidPeerId.into());
            }
        }

        let allowed_fast = if handshake.supports_fast()
            && self.metadata.is_some()
        {
            self.allowed_fast_for(&addr)
        } else {
            HashSet::new()
        };

        let session = self.peers.get_mut(&key).expect("looked up above");
        session.peer_id = Some(handshake.peer_id);
        session.supports_fast = handshake.supports_fast();
        session.supports_extended = handshake.supports_extended();
        session.supports_dht = handshake.supports_dht();
        session.allowed_fast_to_peer = allowed_fast;
        session.state = SessionState::Connected;
        session.connected_at = now;
        session.last_message_received = now;
        log::info!("Peer {} handshake complete", addr);

        Ok(())
    }

    fn dispatch(&mut self, key: PeerKey, msg: Message) -> Result<()> {
        let now = self.clock.now();
        {
            let session = self.peers.get_mut(&key).ok_or(
                Error::InvariantViolation("message for unknown peer key"),
            )?;
            if session.state != SessionState::Connected {
                return Err(ProtocolError::MessageBeforeHandshake.into());
            }
            session.last_message_received = now;

            // capability gating: fast peer messages need the fast
            // extension, extended messages other than the extended
            // handshake need negotiated extended messaging
            if let Some(id) = msg.id() {
                if id.requires_fast() && !session.supports_fast {
                    return Err(ProtocolError::CapabilityViolation(id).into());
                }
            }
            if let Message::Extended { id, .. } = &msg {
                if *id != EXT_HANDSHAKE_ID && !session.supports_extended {
                    return Err(ProtocolError::CapabilityViolation(
                        MessageId::Extended,
                    )
                    .into());
                }
            }
        }

        log::debug!("Peer {} sent {:?}", key, msg.id());

        match msg {
            Message::KeepAlive => {
                // the receive timestamp refresh above is all a keepalive is
            }
            Message::Have { piece_index } => {
                self.validate_piece_index(piece_index)?;
                let session =
                    self.peers.get_mut(&key).expect("session checked");
                session.have_messages_received += 1;
                session.bitfield.set(piece_index, true);
                // a piece we lack makes the peer interesting; duplicate
                // announcements must not produce duplicate Interested
                if !self.own_bitfield[piece_index] && !session.am_interested {
                    session.am_interested = true;
                    session.enqueue(Message::Interested);
                }
            }
            Message::HaveAll => {
                let piece_count = self.piece_count;
                let Self { peers, picker, .. } = self;
                let session = peers.get_mut(&key).expect("session checked");
                session.bitfield = Bitfield::repeat(true, piece_count);
                update_interest(picker.as_mut(), session);
            }
            Message::HaveNone => {
                let piece_count = self.piece_count;
                let session =
                    self.peers.get_mut(&key).expect("session checked");
                session.bitfield = Bitfield::repeat(false, piece_count);
                if session.am_interested {
                    session.am_interested = false;
                    session.enqueue(Message::NotInterested);
                }
            }
            Message::Bitfield(mut bitfield) => {
                // the wire form is padded to a byte boundary, so slice it
                // back to the actual piece count
                bitfield.resize(self.piece_count, false);
                let Self { peers, picker, .. } = self;
                let session = peers.get_mut(&key).expect("session checked");
                session.bitfield = bitfield;
                update_interest(picker.as_mut(), session);
            }
            Message::Request(block) => {
                self.validate_request(block)?;
                let session =
                    self.peers.get_mut(&key).expect("session checked");
                if !session.am_choking {
                    session.queue_read(block);
                } else if session.supports_fast
                    && session.allowed_fast_to_peer.contains(&block.piece_index)
                {
                    session.queue_read(block);
                } else if session.supports_fast {
                    session.enqueue(Message::Reject(block));
                } else {
                    log::warn!(
                        "Peer {} requested {:?} while choked",
                        session.addr,
                        block
                    );
                }
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                let Self { peers, picker, .. } = self;
                let session = peers.get_mut(&key).expect("session checked");
                if session.block_arrived(block) {
                    picker.piece_received(session, block, data);
                    // a slot opened in the pipeline
                    make_requests(picker.as_mut(), session);
                } else {
                    log::warn!(
                        "Peer {} sent block we didn't request: {:?}",
                        session.addr,
                        block
                    );
                }
            }
            Message::Cancel(block) => {
                let session =
                    self.peers.get_mut(&key).expect("session checked");
                if !session.cancel(block) {
                    log::debug!(
                        "Peer {} cancelled unknown request {:?}",
                        session.addr,
                        block
                    );
                }
            }
            Message::Choke => {
                let Self { peers, picker, .. } = self;
                let session = peers.get_mut(&key).expect("session checked");
                if !session.peer_choking {
                    session.peer_choking = true;
                    if !session.supports_fast {
                        // without the fast extension a choke voids all our
                        // outstanding requests
                        picker.cancel_all(session);
                        session.clear_outgoing_requests();
                    }
                }
            }
            Message::Unchoke => {
                let Self { peers, picker, .. } = self;
                let session = peers.get_mut(&key).expect("session checked");
                if session.peer_choking {
                    session.peer_choking = false;
                    make_requests(picker.as_mut(), session);
                }
            }
            Message::Interested => {
                let session =
                    self.peers.get_mut(&key).expect("session checked");
                session.peer_interested = true;
            }
            Message::NotInterested => {
                let session =
                    self.peers.get_mut(&key).expect("session checked");
                session.peer_interested = false;
            }
            Message::Port(port) => {
                let session =
                    self.peers.get_mut(&key).expect("session checked");
                // handed to the DHT subsystem by the host
                session.dht_port = Some(port);
            }
            Message::Suggest { piece_index } => {
                self.validate_piece_index(piece_index)?;
                let session =
                    self.peers.get_mut(&key).expect("session checked");
                session.suggested_pieces.insert(piece_index);
            }
            Message::AllowedFast { piece_index } => {
                self.validate_piece_index(piece_index)?;
                let own_has = self.own_bitfield[piece_index];
                let session =
                    self.peers.get_mut(&key).expect("session checked");
                if !own_has {
                    session.allowed_fast_from_peer.insert(piece_index);
                }
            }
            Message::Reject(block) => {
                let Self { peers, picker, .. } = self;
                let session = peers.get_mut(&key).expect("session checked");
                if session.unregister_request(block) {
                    picker.cancel_request(session, block);
                } else {
                    log::debug!(
                        "Peer {} rejected unknown request {:?}",
                        session.addr,
                        block
                    );
                }
            }
            Message::Extended { id, payload } => {
                self.on_extended(key, id, payload)?;
            }
        }

        Ok(())
    }

    fn validate_piece_index(&self, index: PieceIndex) -> Result<()> {
        if index < self.piece_count {
            Ok(())
        } else {
            Err(ProtocolError::InvalidPieceIndex(index).into())
        }
    }

    fn validate_request(&self, block: BlockInfo) -> Result<()> {
        let piece_len = match self.piece_len(block.piece_index) {
            Some(len) => len,
            None => return Err(ProtocolError::InvalidRequest(block).into()),
        };
        if block.len < MIN_REQUEST_LEN || block.len > MAX_REQUEST_LEN {
            return Err(ProtocolError::InvalidRequest(block).into());
        }
        let fits = block
            .offset
            .checked_add(block.len)
            .map_or(false, |end| end <= piece_len);
        if !fits {
            return Err(ProtocolError::InvalidRequest(block).into());
        }
        Ok(())
    }

    fn on_extended(
        &mut self,
        key: PeerKey,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        match id {
            EXT_HANDSHAKE_ID => self.on_extended_handshake(key, &payload),
            UT_PEX_ID => {
                self.on_pex(key, &payload);
                Ok(())
            }
            UT_METADATA_ID => {
                self.on_metadata(key, &payload);
                Ok(())
            }
            other => {
                if let Some(handler) = self.ext_handlers.get_mut(&other) {
                    handler.handle(key, &payload);
                } else {
                    log::debug!(
                        "Dropping extended message with unregistered id {}",
                        other
                    );
                }
                Ok(())
            }
        }
    }

    fn on_extended_handshake(
        &mut self,
        key: PeerKey,
        payload: &[u8],
    ) -> Result<()> {
        let theirs = ExtendedHandshake::from_bytes(payload).map_err(|e| {
            log::warn!("Peer {} extended handshake unparseable: {}", key, e);
            Error::from(ProtocolError::InvalidExtendedPayload)
        })?;

        let pex_allowed = !self.conf.private
            && self.conf.enable_peer_exchange
            && self.metadata.is_some();

        let session = self.peers.get_mut(&key).expect("session checked");
        if let Some(reqq) = theirs.reqq {
            session.peer_advertised_max = Some(reqq.max(1));
        }
        match theirs.p {
            Some(port) if port != 0 => session.peer_listen_port = Some(port),
            _ => {}
        }
        session.client_version = theirs.v.clone();
        let speaks_pex = theirs.ut_pex_id().is_some();
        session.peer_extensions = Some(theirs);
        if speaks_pex && pex_allowed {
            session.pex_attached = true;
        }

        Ok(())
    }

    fn on_pex(&mut self, key: PeerKey, payload: &[u8]) {
        if self.conf.private || !self.conf.enable_peer_exchange {
            log::debug!("Ignoring PeX from peer {}", key);
            return;
        }
        let msg = match PexMessage::from_bytes(payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Peer {} sent unparseable PeX: {}", key, e);
                return;
            }
        };

        self.peers_discovered(&msg.added_peers(), PeerSource::Pex);
    }

    fn on_metadata(&mut self, key: PeerKey, payload: &[u8]) {
        let header = match MetadataMessage::from_bytes(payload) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("Peer {} sent unparseable metadata msg: {}", key, e);
                return;
            }
        };

        match header.msg_type {
            metadata_msg_type::REQUEST => {
                // replies go out under the id the peer asked for in its
                // own extended handshake
                let reply_id = self
                    .peers
                    .get(&key)
                    .and_then(|s| s.peer_extensions.as_ref())
                    .and_then(|e| e.ut_metadata_id());
                let reply_id = match reply_id {
                    Some(id) => id,
                    None => {
                        log::debug!(
                            "Peer {} requested metadata without an id",
                            key
                        );
                        return;
                    }
                };

                let response = match &self.metadata {
                    Some(metadata)
                        if header.piece
                            < MetadataMessage::piece_count(
                                metadata.len() as u32
                            ) =>
                    {
                        MetadataMessage::data(header.piece, metadata)
                    }
                    _ => MetadataMessage::reject(header.piece).to_bytes(),
                };
                match response {
                    Ok(payload) => {
                        let session = self
                            .peers
                            .get_mut(&key)
                            .expect("session checked");
                        session.enqueue(Message::Extended {
                            id: reply_id,
                            payload,
                        });
                    }
                    Err(e) => {
                        log::error!("Failed to encode metadata reply: {}", e)
                    }
                }
            }
            metadata_msg_type::DATA | metadata_msg_type::REJECT => {
                // we serve metadata but don't fetch it over this channel
                log::debug!("Ignoring metadata transfer from peer {}", key);
            }
            other => {
                log::debug!("Unknown metadata message type {}", other);
            }
        }
    }
}

/// Recomputes our interest in the peer from the picker's verdict, queueing
/// the `Interested`/`NotInterested` transition if it changed.
pub(crate) fn update_interest(
    picker: &mut dyn Picker,
    session: &mut PeerSession,
) {
    let interesting = picker.is_interesting(session);
    if interesting && !session.am_interested {
        session.am_interested = true;
        session.enqueue(Message::Interested);
    } else if !interesting && session.am_interested {
        session.am_interested = false;
        session.enqueue(Message::NotInterested);
    }
}

/// Tops up the request pipeline towards the peer from the picker, up to
/// the session's current depth.
pub(crate) fn make_requests(picker: &mut dyn Picker, session: &mut PeerSession) {
    // while choked we can only draw on the allowed fast set; the picker
    // sees the session and restricts itself accordingly
    if session.peer_choking && session.allowed_fast_from_peer.is_empty() {
        return;
    }
    let up_to = session
        .max_pending_requests
        .saturating_sub(session.requesting_count());
    if up_to == 0 {
        return;
    }
    let blocks = picker.pick_requests(session, up_to);
    if blocks.is_empty() {
        return;
    }
    log::trace!("Requesting {} blocks from peer {}", blocks.len(), session.addr);
    session.register_requests(&blocks);
    for block in blocks {
        session.enqueue(Message::Request(block));
    }
}
