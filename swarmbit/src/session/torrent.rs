use std::{
    collections::VecDeque,
    net::SocketAddr,
    path::PathBuf,
    time::{Duration, Instant},
};

use bytes::Bytes;
use slotmap::SlotMap;

use crate::{
    wire::{Handshake, Message, WireError},
    ChokePolicy, PeerId, PickOrder, PieceBitfield, PieceIdx, PiecePicker, PieceStore, Sha1,
    SwarmTally, TallyError, TorrentInfo, TorrentView, TorrentViewPeer,
};

use super::{PeerIo, PeerKey, PeerSession, SendError, TorrentSender};

#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Directory the torrent's files are created under
    pub root: PathBuf,
    pub listen_addr: Option<SocketAddr>,
    pub peer_id: PeerId,
    /// How often the piece picker is asked for new requests
    pub request_interval: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Capacity of every peer's outbound queue
    pub peer_queue_capacity: usize,
    pub max_active_pieces: usize,
    /// Requested blocks are requested again after this long without an answer
    pub retry_timeout: Duration,
    /// Longest block we serve
    pub max_serve_length: u32,
    /// Requests from a single peer waiting for room in its queue, more are rejected
    pub max_pending_requests: usize,
    pub pick_order: PickOrder,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            listen_addr: None,
            peer_id: PeerId::generate(),
            request_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(20),
            peer_queue_capacity: 32,
            max_active_pieces: 10,
            retry_timeout: Duration::from_secs(30),
            max_serve_length: 32 * 1024,
            max_pending_requests: 256,
            pick_order: PickOrder::RarestFirst,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    index: PieceIdx,
    begin: u32,
    length: u32,
}

#[derive(Debug)]
struct PeerEntry {
    session: PeerSession,
    /// accepted requests not yet queued
    pending: VecDeque<PendingRequest>,
    /// rejected requests
    strikes: u32,
    downloaded: u64,
    uploaded: u64,
}

/// Everything the coordinator loop owns. Only ever touched from that loop.
pub struct TorrentState {
    config: TorrentConfig,
    info: TorrentInfo,
    store: PieceStore,
    tally: SwarmTally,
    owned: PieceBitfield,
    picker: Box<dyn PiecePicker>,
    choker: Box<dyn ChokePolicy>,
    peers: SlotMap<PeerKey, PeerEntry>,
    sender: TorrentSender,
}

impl TorrentState {
    /// Validate whatever the store already holds and seed the tally with it.
    pub fn new(
        info: TorrentInfo,
        config: TorrentConfig,
        mut store: PieceStore,
        picker: Box<dyn PiecePicker>,
        choker: Box<dyn ChokePolicy>,
        sender: TorrentSender,
    ) -> Result<Self, crate::Error> {
        if store.pieces_count() != info.pieces_count() {
            return Err(TallyError::LengthMismatch {
                expected: info.pieces_count(),
                actual: store.pieces_count(),
            }
            .into());
        }

        let owned = store.validate_all()?;
        tracing::info!(
            info_hash = %info.info_hash(),
            "validated {}/{} pieces",
            owned.num_set(),
            owned.len()
        );
        Ok(Self {
            tally: SwarmTally::with_owned(&owned),
            owned,
            config,
            info,
            store,
            picker,
            choker,
            peers: Default::default(),
            sender,
        })
    }

    pub fn info_hash(&self) -> Sha1 {
        self.info.info_hash()
    }

    pub fn peer_id(&self) -> PeerId {
        self.config.peer_id
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.config.handshake_timeout
    }

    pub fn choke_interval(&self) -> Duration {
        self.choker.refresh_interval()
    }

    pub fn sender(&self) -> TorrentSender {
        self.sender.clone()
    }

    pub fn view(&self) -> TorrentView {
        let peers = self
            .peers
            .values()
            .map(|entry| TorrentViewPeer {
                id: entry.session.id(),
                addr: entry.session.addr(),
                flags: entry.session.flags(),
                strikes: entry.strikes,
                downloaded: entry.downloaded,
                uploaded: entry.uploaded,
            })
            .collect();

        TorrentView {
            info_hash: self.info.info_hash(),
            piece_count: self.owned.len(),
            owned: self.owned.num_set(),
            tally: self.tally.as_slice().to_vec(),
            progress: match self.owned.len() {
                0 => 1.0,
                n => f64::from(self.owned.num_set()) / f64::from(n),
            },
            active_pieces: self.picker.active_count(),
            peers,
        }
    }
}

impl TorrentState {
    pub fn on_peer_handshake(
        &mut self,
        handshake: Handshake,
        addr: Option<SocketAddr>,
        peer_io: PeerIo,
    ) {
        if handshake.peer_id == self.config.peer_id {
            tracing::debug!("dropping connection to ourselves");
            return;
        }
        if self
            .peers
            .values()
            .any(|entry| entry.session.id() == handshake.peer_id)
        {
            tracing::debug!(peer = %handshake.peer_id, "dropping duplicate connection");
            return;
        }

        let key = self.peers.insert_with_key(|key| PeerEntry {
            session: PeerSession::spawn(
                key,
                handshake.peer_id,
                addr,
                peer_io,
                self.sender.clone(),
                self.config.peer_queue_capacity,
                self.config.keepalive_interval,
            ),
            pending: Default::default(),
            strikes: 0,
            downloaded: 0,
            uploaded: 0,
        });
        tracing::info!(peer = %handshake.peer_id, addr = ?addr, "peer connected");

        let bitfield = Message::Bitfield {
            bitfield: Bytes::copy_from_slice(self.owned.bytes()),
        };
        if let Err(error) = self.peers[key].session.send(bitfield) {
            tracing::debug!(peer = %handshake.peer_id, "failed to queue bitfield: {error}");
        }
    }

    pub fn on_peer_message(&mut self, peer_key: PeerKey, message: Message) {
        let peer = match self.peers.get(peer_key) {
            Some(entry) => entry.session.clone(),
            None => return,
        };

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                tracing::debug!(peer = %peer.id(), "peer choked us");
                peer.set_peer_choking(true);
                peer.with_bitfield(|bitfield| {
                    if let Some(bitfield) = bitfield {
                        self.picker.peer_removed(bitfield);
                    }
                });
            }
            Message::Unchoke => {
                tracing::debug!(peer = %peer.id(), "peer unchoked us");
                peer.set_peer_choking(false);
            }
            Message::Interested => peer.set_peer_interested(true),
            Message::NotInterested => peer.set_peer_interested(false),
            Message::Have { index } => {
                if !self.info.piece_index_valid(index) {
                    tracing::debug!(peer = %peer.id(), piece = %index, "invalid have");
                    self.disconnect(peer_key);
                    return;
                }
                if peer.mark_piece(index, self.info.pieces_count()) {
                    self.tally_update(|tally| tally.add_index(index));
                }
            }
            Message::Bitfield { bitfield } => {
                let bitfield =
                    match PieceBitfield::from_bytes(&bitfield, self.info.pieces_count()) {
                        Some(bitfield) => bitfield,
                        None => {
                            tracing::debug!(peer = %peer.id(), "invalid bitfield");
                            self.disconnect(peer_key);
                            return;
                        }
                    };
                self.tally_update(|tally| tally.add_bitfield(&bitfield));
                if let Some(previous) = peer.set_bitfield(bitfield) {
                    self.tally_update(|tally| tally.remove_bitfield(&previous));
                }
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.serve_request(peer_key, index, begin, length),
            Message::Piece { index, begin, data } => {
                self.receive_block(peer_key, index, begin, data)
            }
            Message::Cancel { index, begin, .. } => {
                // requests are answered as soon as they arrive, there is nothing to cancel
                tracing::trace!(peer = %peer.id(), piece = %index, begin, "cancel");
            }
            Message::Unknown { id, .. } => {
                tracing::debug!(peer = %peer.id(), id, "unknown message");
            }
        }
    }

    pub fn on_peer_failure(&mut self, peer_key: PeerKey, error: WireError) {
        if let Some(entry) = self.peers.get(peer_key) {
            tracing::debug!(peer = %entry.session.id(), "peer failure: {error}");
            self.disconnect(peer_key);
        }
    }

    /// Recompute interest, serve what waited for queue space, then hand the picker's blocks
    /// to every peer that can serve them.
    pub fn request_tick(&mut self, now: Instant) {
        self.update_interest();
        let keys = self.peers.keys().collect::<Vec<_>>();
        for peer_key in keys {
            self.serve_pending(peer_key);
        }
        if self.tally.is_complete() {
            return;
        }

        let mut servable = PieceBitfield::with_size(self.info.pieces_count());
        for entry in self.peers.values() {
            let flags = entry.session.flags();
            if flags.peer_choking || !flags.am_interested {
                continue;
            }
            entry.session.with_bitfield(|bitfield| {
                for index in bitfield.into_iter().flat_map(|bitfield| bitfield.pieces()) {
                    servable.set_piece(index);
                }
            });
        }

        for block in self.picker.new_requests(&self.tally, &servable, now) {
            let request = Message::Request {
                index: block.index,
                begin: block.begin,
                length: block.length,
            };
            let mut requested = false;
            for entry in self.peers.values() {
                let peer = &entry.session;
                let flags = peer.flags();
                if flags.peer_choking || !flags.am_interested || !peer.has_piece(block.index) {
                    continue;
                }
                match peer.send(request.clone()) {
                    Ok(()) => requested = true,
                    Err(error) => {
                        tracing::trace!(peer = %peer.id(), piece = %block.index, "request not queued: {error}")
                    }
                }
            }
            if !requested {
                self.picker.reschedule(&block);
            }
        }
    }

    pub fn choke_tick(&mut self) {
        let sessions = self
            .peers
            .values()
            .map(|entry| entry.session.clone())
            .collect::<Vec<_>>();
        for peer_key in self.choker.decide(&sessions) {
            let Some(entry) = self.peers.get(peer_key) else {
                continue;
            };
            match entry.session.set_am_choking(false) {
                Ok(()) => tracing::debug!(peer = %entry.session.id(), "unchoked peer"),
                Err(error) => {
                    tracing::debug!(peer = %entry.session.id(), "failed to unchoke peer: {error}")
                }
            }
        }
    }
}

impl TorrentState {
    fn serve_request(&mut self, peer_key: PeerKey, index: PieceIdx, begin: u32, length: u32) {
        let entry = &mut self.peers[peer_key];
        let peer = entry.session.clone();

        let rejection = if peer.am_choking() {
            Some("peer is choked")
        } else if !self.tally.is_owned(index) {
            Some("piece not owned")
        } else if length > self.config.max_serve_length {
            Some("block too long")
        } else if !self.info.piece_request_valid(index, begin, length) {
            Some("out of bounds")
        } else if entry.pending.len() >= self.config.max_pending_requests {
            Some("too many pending requests")
        } else {
            None
        };
        if let Some(reason) = rejection {
            entry.strikes += 1;
            tracing::debug!(peer = %peer.id(), piece = %index, begin, length, "rejecting request: {reason}");
            return;
        }

        entry.pending.push_back(PendingRequest {
            index,
            begin,
            length,
        });
        self.serve_pending(peer_key);
    }

    /// Answer accepted requests in order while the peer's queue has room.
    fn serve_pending(&mut self, peer_key: PeerKey) {
        let Some(entry) = self.peers.get_mut(peer_key) else {
            return;
        };
        if entry.session.am_choking() {
            entry.pending.clear();
            return;
        }

        while let Some(&request) = entry.pending.front() {
            if !entry.session.has_capacity() {
                break;
            }
            let data = match self
                .store
                .read_block(request.index, request.begin, request.length)
            {
                Ok(data) => data,
                Err(error) => {
                    tracing::warn!(piece = %request.index, "failed to read block: {error}");
                    entry.pending.pop_front();
                    continue;
                }
            };

            let message = Message::Piece {
                index: request.index,
                begin: request.begin,
                data: Bytes::from(data),
            };
            match entry.session.send(message) {
                Ok(()) => {
                    entry.uploaded += u64::from(request.length);
                    entry.pending.pop_front();
                }
                Err(SendError::Full) => break,
                Err(SendError::Closed) => {
                    entry.pending.clear();
                    break;
                }
            }
        }
    }

    fn receive_block(&mut self, peer_key: PeerKey, index: PieceIdx, begin: u32, data: Bytes) {
        let length = data.len() as u32;
        let complete = match self.picker.piece_received(index, begin, length) {
            Ok(complete) => complete,
            Err(error) => {
                tracing::trace!("ignoring block: {error}");
                return;
            }
        };
        self.peers[peer_key].downloaded += u64::from(length);

        match self.store.write_block(index, begin, &data, complete) {
            Ok(false) if complete => self.piece_verified(index),
            Ok(false) => {}
            Ok(true) => {
                tracing::warn!(piece = %index, "piece failed verification, discarding");
                self.picker.abandon(index);
            }
            Err(error) => {
                tracing::warn!(piece = %index, "failed to write block: {error}");
                self.picker.abandon(index);
            }
        }
    }

    fn piece_verified(&mut self, index: PieceIdx) {
        self.owned.set_piece(index);
        self.tally_update(|tally| tally.mark_owned(index));
        tracing::info!(
            piece = %index,
            "piece complete {}/{}",
            self.owned.num_set(),
            self.owned.len()
        );

        for entry in self.peers.values() {
            if let Err(error) = entry.session.send(Message::Have { index }) {
                tracing::debug!(peer = %entry.session.id(), "have not queued: {error}");
            }
        }
        if self.tally.is_complete() {
            tracing::info!(info_hash = %self.info.info_hash(), "torrent complete");
        }
    }

    fn update_interest(&mut self) {
        for entry in self.peers.values() {
            let peer = &entry.session;
            let target = peer.with_bitfield(|bitfield| match bitfield {
                Some(bitfield) => bitfield.pieces().any(|index| !self.tally.is_owned(index)),
                None => false,
            });
            if target == peer.am_interested() {
                continue;
            }
            if let Err(error) = peer.set_am_interested(target) {
                tracing::debug!(peer = %peer.id(), "failed to update interest: {error}");
            }
        }
    }

    fn disconnect(&mut self, peer_key: PeerKey) {
        let Some(entry) = self.peers.remove(peer_key) else {
            return;
        };
        entry.session.with_bitfield(|bitfield| {
            if let Some(bitfield) = bitfield {
                self.tally_update(|tally| tally.remove_bitfield(bitfield));
                self.picker.peer_removed(bitfield);
            }
        });
        tracing::info!(peer = %entry.session.id(), addr = ?entry.session.addr(), "peer disconnected");
    }

    fn tally_update(&mut self, f: impl FnOnce(&mut SwarmTally) -> Result<(), TallyError>) {
        if let Err(error) = f(&mut self.tally) {
            tracing::warn!("tally update failed: {error}");
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use tokio::{
        io::{DuplexStream, ReadHalf, WriteHalf},
        sync::mpsc::unbounded_channel,
    };

    use super::*;
    use crate::{wire, BasicPiecePicker, InterestedUnchoke, TorrentCreator, TorrentCreatorConfig};

    struct Remote {
        reader: ReadHalf<DuplexStream>,
        _writer: WriteHalf<DuplexStream>,
    }

    fn state(content: &[u8], seed: bool) -> TorrentState {
        state_with(content, seed, 10)
    }

    fn state_with(content: &[u8], seed: bool, max_active: usize) -> TorrentState {
        let mut creator = TorrentCreator::new(TorrentCreatorConfig {
            name: Some("unit".to_string()),
            piece_length: Some(16),
        });
        creator.file(PathBuf::from("unit")).push_data(content);
        let info = creator.finish().unwrap();

        let mut store = PieceStore::in_memory(&info);
        if seed {
            for (index, piece) in content.chunks(16).enumerate() {
                store
                    .write_block(PieceIdx::new(index as u32), 0, piece, true)
                    .unwrap();
            }
        }
        let (sender, _receiver) = unbounded_channel();
        TorrentState::new(
            info.clone(),
            TorrentConfig::default(),
            store,
            Box::new(BasicPiecePicker::new(info, PickOrder::RarestFirst).with_max_active(max_active)),
            Box::new(InterestedUnchoke::default()),
            sender,
        )
        .unwrap()
    }

    fn connect(state: &mut TorrentState, id: u8) -> (PeerKey, Remote) {
        let (local, remote) = tokio::io::duplex(4096);
        let (lr, lw) = tokio::io::split(local);
        let (rr, rw) = tokio::io::split(remote);
        state.on_peer_handshake(
            Handshake {
                info_hash: state.info_hash(),
                peer_id: PeerId::new([id; 20]),
            },
            None,
            PeerIo::new(lr, lw),
        );
        let key = state
            .peers
            .iter()
            .find(|(_, entry)| entry.session.id() == PeerId::new([id; 20]))
            .map(|(key, _)| key)
            .unwrap();
        (
            key,
            Remote {
                reader: rr,
                _writer: rw,
            },
        )
    }

    #[tokio::test]
    async fn seeded_store_is_owned() {
        let state = state(&[7u8; 40], true);
        let view = state.view();
        assert!(view.complete());
        assert_eq!(view.tally, vec![-1, -1, -1]);
    }

    #[tokio::test]
    async fn admitted_peer_receives_bitfield() {
        let mut state = state(&[7u8; 40], true);
        let (_, mut remote) = connect(&mut state, 1);
        assert_eq!(
            wire::read_message_async(&mut remote.reader).await.unwrap(),
            Message::Bitfield {
                bitfield: Bytes::from_static(&[0b1110_0000])
            }
        );
    }

    #[tokio::test]
    async fn bitfields_and_haves_feed_the_tally() {
        let mut state = state(&[1u8; 40], false);
        let (a, _ra) = connect(&mut state, 1);
        let (b, _rb) = connect(&mut state, 2);

        state.on_peer_message(
            a,
            Message::Bitfield {
                bitfield: Bytes::from_static(&[0b1100_0000]),
            },
        );
        state.on_peer_message(b, Message::Have { index: PieceIdx::new(1) });
        state.on_peer_message(b, Message::Have { index: PieceIdx::new(1) });
        assert_eq!(state.view().tally, vec![1, 2, 0]);

        // a replacement bitfield replaces the previous contribution
        state.on_peer_message(
            a,
            Message::Bitfield {
                bitfield: Bytes::from_static(&[0b0010_0000]),
            },
        );
        assert_eq!(state.view().tally, vec![0, 1, 1]);

        state.on_peer_failure(b, WireError::Timeout);
        assert_eq!(state.view().tally, vec![0, 0, 1]);
        assert_eq!(state.view().peers.len(), 1);

        // spare bits set, the peer is dropped
        state.on_peer_message(
            a,
            Message::Bitfield {
                bitfield: Bytes::from_static(&[0b0000_0001]),
            },
        );
        assert_eq!(state.view().tally, vec![0, 0, 0]);
        assert!(state.view().peers.is_empty());
    }

    #[tokio::test]
    async fn rejected_requests_count_strikes() {
        let mut state = state(&[9u8; 40], true);
        let (key, _remote) = connect(&mut state, 1);
        let request = Message::Request {
            index: PieceIdx::new(0),
            begin: 0,
            length: 16,
        };

        // still choked
        state.on_peer_message(key, request.clone());
        assert_eq!(state.view().peers[0].strikes, 1);

        state.on_peer_message(key, Message::Interested);
        state.choke_tick();
        assert!(!state.view().peers[0].flags.am_choking);

        state.on_peer_message(key, request);
        state.on_peer_message(
            key,
            Message::Request {
                index: PieceIdx::new(2),
                begin: 4,
                length: 8,
            },
        );
        let view = state.view();
        assert_eq!(view.peers[0].strikes, 2);
        assert_eq!(view.peers[0].uploaded, 16);
    }

    async fn next_message(remote: &mut Remote) -> Message {
        wire::read_message_async(&mut remote.reader).await.unwrap()
    }

    fn request(index: u32, length: u32) -> Message {
        Message::Request {
            index: PieceIdx::new(index),
            begin: 0,
            length,
        }
    }

    #[tokio::test]
    async fn requests_wait_for_queue_space() {
        let mut state = state(&[9u8; 40], true);
        let (key, mut remote) = connect(&mut state, 1);
        state.on_peer_message(key, Message::Interested);
        state.choke_tick();

        for _ in 0..100 {
            state.on_peer_message(key, request(0, 16));
        }
        assert_eq!(state.view().peers[0].strikes, 0);
        assert!(!state.peers[key].pending.is_empty());

        let mut served = 0;
        while served < 100 {
            if let Message::Piece { data, .. } = next_message(&mut remote).await {
                assert_eq!(data, Bytes::from_static(&[9u8; 16]));
                served += 1;
            }
            state.request_tick(Instant::now());
        }
        assert!(state.peers[key].pending.is_empty());
        assert_eq!(state.view().peers[0].uploaded, 1600);
    }

    #[tokio::test]
    async fn pending_requests_are_capped() {
        let mut state = state(&[9u8; 40], true);
        state.config.max_pending_requests = 4;
        state.config.peer_queue_capacity = 2;
        let (key, _remote) = connect(&mut state, 1);
        state.on_peer_message(key, Message::Interested);
        state.choke_tick();

        // bitfield and unchoke fill the queue
        for _ in 0..6 {
            state.on_peer_message(key, request(1, 16));
        }
        let view = state.view();
        assert_eq!(state.peers[key].pending.len(), 4);
        assert_eq!(view.peers[0].strikes, 2);
        assert_eq!(view.peers[0].uploaded, 0);
    }

    #[tokio::test]
    async fn pieces_held_by_choking_peers_do_not_block_others() {
        let mut state = state_with(&[3u8; 40], false, 1);
        let (choking, _ra) = connect(&mut state, 1);
        let (unchoking, mut remote) = connect(&mut state, 2);
        state.on_peer_message(
            choking,
            Message::Bitfield {
                bitfield: Bytes::from_static(&[0b1000_0000]),
            },
        );
        state.on_peer_message(
            unchoking,
            Message::Bitfield {
                bitfield: Bytes::from_static(&[0b0110_0000]),
            },
        );
        state.on_peer_message(unchoking, Message::Unchoke);

        state.request_tick(Instant::now());
        assert!(matches!(next_message(&mut remote).await, Message::Bitfield { .. }));
        assert_eq!(next_message(&mut remote).await, Message::Interested);
        assert_eq!(next_message(&mut remote).await, request(1, 16));
        assert_eq!(state.view().active_pieces, 1);
    }

    #[tokio::test]
    async fn corrupted_piece_is_requested_again() {
        let mut state = state(&[5u8; 40], false);
        let (key, mut remote) = connect(&mut state, 1);
        state.on_peer_message(
            key,
            Message::Bitfield {
                bitfield: Bytes::from_static(&[0b1110_0000]),
            },
        );
        state.on_peer_message(key, Message::Unchoke);

        let now = Instant::now();
        state.request_tick(now);
        assert_eq!(state.view().active_pieces, 3);
        let mut sent = Vec::new();
        for _ in 0..5 {
            sent.push(next_message(&mut remote).await);
        }
        assert_eq!(
            sent,
            vec![
                Message::Bitfield {
                    bitfield: Bytes::from_static(&[0])
                },
                Message::Interested,
                request(0, 16),
                request(1, 16),
                request(2, 8),
            ]
        );

        state.on_peer_message(
            key,
            Message::Piece {
                index: PieceIdx::new(0),
                begin: 0,
                data: Bytes::from_static(&[6u8; 16]),
            },
        );
        let view = state.view();
        assert_eq!(view.tally[0], 1);
        assert_eq!(view.owned, 0);
        assert_eq!(view.active_pieces, 2);

        state.request_tick(now);
        assert_eq!(next_message(&mut remote).await, request(0, 16));
        assert_eq!(state.view().active_pieces, 3);
    }
}
