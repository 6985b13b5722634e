use std::net::SocketAddr;

use crate::{PeerFlags, PeerId, Sha1};

#[derive(Debug, Clone)]
pub struct TorrentViewPeer {
    pub id: PeerId,
    pub addr: Option<SocketAddr>,
    pub flags: PeerFlags,
    /// requests we refused to serve
    pub strikes: u32,
    pub downloaded: u64,
    pub uploaded: u64,
}

/// Snapshot of a torrent taken by its coordinator loop.
#[derive(Debug, Clone)]
pub struct TorrentView {
    pub info_hash: Sha1,
    pub piece_count: u32,
    /// verified pieces
    pub owned: u32,
    pub tally: Vec<i32>,
    pub progress: f64,
    /// pieces with outstanding requests
    pub active_pieces: usize,
    pub peers: Vec<TorrentViewPeer>,
}

impl TorrentView {
    pub fn complete(&self) -> bool {
        self.owned == self.piece_count
    }
}
