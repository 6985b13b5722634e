use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::{PieceBitfield, PieceIdx, SwarmTally, TorrentInfo};

/// Length of a requested block, the last block of a piece may be shorter.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

const DEFAULT_MAX_ACTIVE_PIECES: usize = 10;
const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PickerError {
    #[error("{0} is not being downloaded")]
    NotRecognized(PieceIdx),

    #[error("no outstanding request for {index} at {begin} with length {length}")]
    UnrequestedBlock {
        index: PieceIdx,
        begin: u32,
        length: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceBlock {
    pub index: PieceIdx,
    pub begin: u32,
    pub length: u32,
    /// When the block was last handed out, `None` if it is due.
    pub requested_at: Option<Instant>,
}

impl PieceBlock {
    fn is_due(&self, now: Instant, retry_timeout: Duration) -> bool {
        match self.requested_at {
            Some(at) => now.saturating_duration_since(at) >= retry_timeout,
            None => true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PickOrder {
    #[default]
    RarestFirst,
    MostPopularFirst,
    Sequential,
}

/// Decides which blocks to request next.
pub trait PiecePicker: Send {
    /// Blocks that should be requested now. Every returned block is stamped with `now`.
    ///
    /// `servable` holds the pieces some peer that is not choking us can send. Pieces outside
    /// of it are neither started nor requested.
    fn new_requests(
        &mut self,
        tally: &SwarmTally,
        servable: &PieceBitfield,
        now: Instant,
    ) -> Vec<PieceBlock>;

    /// Record the arrival of a block. Returns `true` if it was the last outstanding block of
    /// its piece.
    fn piece_received(
        &mut self,
        index: PieceIdx,
        begin: u32,
        length: u32,
    ) -> Result<bool, PickerError>;

    /// Make a block due again, it was handed out but nobody took it.
    fn reschedule(&mut self, block: &PieceBlock);

    /// Expire the outstanding blocks of every piece the departing peer had.
    fn peer_removed(&mut self, bitfield: &PieceBitfield);

    /// Forget everything about a piece so it is fetched from scratch later.
    fn abandon(&mut self, index: PieceIdx);

    fn active_count(&self) -> usize;
}

#[derive(Debug)]
pub struct BasicPiecePicker {
    info: TorrentInfo,
    order: PickOrder,
    max_active: usize,
    retry_timeout: Duration,
    active: BTreeMap<PieceIdx, Vec<PieceBlock>>,
}

impl BasicPiecePicker {
    pub fn new(info: TorrentInfo, order: PickOrder) -> Self {
        Self {
            info,
            order,
            max_active: DEFAULT_MAX_ACTIVE_PIECES,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            active: Default::default(),
        }
    }

    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn with_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = retry_timeout;
        self
    }

    fn next_piece(&self, tally: &SwarmTally, servable: &PieceBitfield) -> Option<PieceIdx> {
        let candidate = |index: PieceIdx, count: i32| {
            count > 0 && contains(servable, index) && !self.active.contains_key(&index)
        };
        let picked = match self.order {
            PickOrder::RarestFirst => tally.rarest_where(candidate),
            PickOrder::MostPopularFirst => tally.most_popular_where(candidate),
            PickOrder::Sequential => tally
                .needs()
                .into_iter()
                .filter_map(|index| Some((index, tally.count(index)?)))
                .find(|&(index, count)| candidate(index, count)),
        };
        picked.map(|(index, _)| index)
    }

    fn block_count(&self, index: PieceIdx) -> usize {
        self.info
            .piece_length_from_index(index)
            .div_ceil(BLOCK_LENGTH) as usize
    }

    fn piece_blocks(&self, index: PieceIdx) -> Vec<PieceBlock> {
        let piece_length = self.info.piece_length_from_index(index);
        let mut blocks = Vec::with_capacity(self.block_count(index));
        let mut begin = 0;
        while begin < piece_length {
            let length = (piece_length - begin).min(BLOCK_LENGTH);
            blocks.push(PieceBlock {
                index,
                begin,
                length,
                requested_at: None,
            });
            begin += length;
        }
        blocks
    }
}

impl PiecePicker for BasicPiecePicker {
    fn new_requests(
        &mut self,
        tally: &SwarmTally,
        servable: &PieceBitfield,
        now: Instant,
    ) -> Vec<PieceBlock> {
        let untouched = self
            .active
            .iter()
            .filter(|(index, blocks)| blocks.len() == self.block_count(**index))
            .map(|(index, _)| *index)
            .collect::<Vec<_>>();
        for index in untouched {
            if !contains(servable, index) {
                tracing::trace!(piece = %index, "releasing piece nobody can serve");
                self.active.remove(&index);
            }
        }
        self.active.retain(|&index, _| !tally.is_owned(index));

        let mut requests = Vec::new();
        for (index, blocks) in self.active.iter_mut() {
            if !contains(servable, *index) {
                continue;
            }
            for block in blocks.iter_mut() {
                if block.is_due(now, self.retry_timeout) {
                    block.requested_at = Some(now);
                    requests.push(*block);
                }
            }
        }

        while self.active.len() < self.max_active {
            let Some(index) = self.next_piece(tally, servable) else {
                break;
            };
            let mut blocks = self.piece_blocks(index);
            for block in blocks.iter_mut() {
                block.requested_at = Some(now);
                requests.push(*block);
            }
            tracing::trace!(piece = %index, blocks = blocks.len(), "activating piece");
            self.active.insert(index, blocks);
        }

        requests
    }

    fn piece_received(
        &mut self,
        index: PieceIdx,
        begin: u32,
        length: u32,
    ) -> Result<bool, PickerError> {
        let blocks = self
            .active
            .get_mut(&index)
            .ok_or(PickerError::NotRecognized(index))?;
        let position = blocks
            .iter()
            .position(|b| b.begin == begin && b.length == length)
            .ok_or(PickerError::UnrequestedBlock {
                index,
                begin,
                length,
            })?;
        blocks.swap_remove(position);
        let complete = blocks.is_empty();
        if complete {
            self.active.remove(&index);
        }
        Ok(complete)
    }

    fn reschedule(&mut self, block: &PieceBlock) {
        if let Some(blocks) = self.active.get_mut(&block.index) {
            for b in blocks.iter_mut() {
                if b.begin == block.begin && b.length == block.length {
                    b.requested_at = None;
                }
            }
        }
    }

    fn peer_removed(&mut self, bitfield: &PieceBitfield) {
        for (index, blocks) in self.active.iter_mut() {
            if contains(bitfield, *index) {
                for block in blocks.iter_mut() {
                    block.requested_at = None;
                }
            }
        }
    }

    fn abandon(&mut self, index: PieceIdx) {
        self.active.remove(&index);
    }

    fn active_count(&self) -> usize {
        self.active.len()
    }
}

fn contains(bitfield: &PieceBitfield, index: PieceIdx) -> bool {
    index.0 < bitfield.len() && bitfield.has_piece(index)
}
