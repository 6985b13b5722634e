use thiserror::Error;

use crate::{PieceBitfield, PieceIdx};

/// Tally value of a piece we own. Owned pieces are never counted again.
pub const OWNED: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TallyError {
    #[error("bitfield has {actual} pieces but the tally tracks {expected}")]
    LengthMismatch { expected: u32, actual: u32 },

    #[error("piece index {index} out of range for {len} pieces")]
    IndexOutOfRange { index: u32, len: u32 },
}

/// Swarm wide availability of every piece.
///
/// Each entry is either [`OWNED`] or the number of connected peers that advertise the piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmTally(Vec<i32>);

impl SwarmTally {
    pub fn new(pieces_count: u32) -> Self {
        Self(vec![0; pieces_count as usize])
    }

    pub fn with_owned(owned: &PieceBitfield) -> Self {
        let mut tally = Self::new(owned.len());
        tally.fill_owned(owned);
        tally
    }

    /// Reset every entry: owned pieces to [`OWNED`], everything else to zero.
    pub fn initialize_owned(&mut self, owned: &PieceBitfield) -> Result<(), TallyError> {
        self.check_bitfield(owned)?;
        self.fill_owned(owned);
        Ok(())
    }

    pub fn add_bitfield(&mut self, bitfield: &PieceBitfield) -> Result<(), TallyError> {
        self.check_bitfield(bitfield)?;
        for index in bitfield.pieces() {
            let count = &mut self.0[index.as_usize()];
            if *count != OWNED {
                *count += 1;
            }
        }
        Ok(())
    }

    pub fn remove_bitfield(&mut self, bitfield: &PieceBitfield) -> Result<(), TallyError> {
        self.check_bitfield(bitfield)?;
        for index in bitfield.pieces() {
            let count = &mut self.0[index.as_usize()];
            if *count > 0 {
                *count -= 1;
            }
        }
        Ok(())
    }

    /// Count one more peer advertising `index`, usually after a `Have`.
    pub fn add_index(&mut self, index: PieceIdx) -> Result<(), TallyError> {
        let count = self.entry_mut(index)?;
        if *count != OWNED {
            *count += 1;
        }
        Ok(())
    }

    pub fn mark_owned(&mut self, index: PieceIdx) -> Result<(), TallyError> {
        *self.entry_mut(index)? = OWNED;
        Ok(())
    }

    /// Pieces we do not own yet, ascending.
    pub fn needs(&self) -> Vec<PieceIdx> {
        self.unowned().map(|(index, _)| index).collect()
    }

    pub fn is_owned(&self, index: PieceIdx) -> bool {
        self.0.get(index.as_usize()) == Some(&OWNED)
    }

    pub fn count(&self, index: PieceIdx) -> Option<i32> {
        self.0.get(index.as_usize()).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.0.iter().all(|&count| count == OWNED)
    }

    pub fn most_popular(&self) -> Option<(PieceIdx, i32)> {
        self.most_popular_where(|_, _| true)
    }

    pub fn rarest(&self) -> Option<(PieceIdx, i32)> {
        self.rarest_where(|_, _| true)
    }

    /// Highest count among unowned pieces accepted by `filter`. Lowest index wins ties.
    pub fn most_popular_where<F>(&self, mut filter: F) -> Option<(PieceIdx, i32)>
    where
        F: FnMut(PieceIdx, i32) -> bool,
    {
        let mut best: Option<(PieceIdx, i32)> = None;
        for (index, count) in self.unowned() {
            if !filter(index, count) {
                continue;
            }
            if best.map_or(true, |(_, best_count)| count > best_count) {
                best = Some((index, count));
            }
        }
        best
    }

    /// Lowest count among unowned pieces accepted by `filter`. Lowest index wins ties.
    pub fn rarest_where<F>(&self, mut filter: F) -> Option<(PieceIdx, i32)>
    where
        F: FnMut(PieceIdx, i32) -> bool,
    {
        let mut best: Option<(PieceIdx, i32)> = None;
        for (index, count) in self.unowned() {
            if !filter(index, count) {
                continue;
            }
            if best.map_or(true, |(_, best_count)| count < best_count) {
                best = Some((index, count));
            }
        }
        best
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    pub fn len(&self) -> u32 {
        self.0.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn unowned(&self) -> impl Iterator<Item = (PieceIdx, i32)> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, &count)| count != OWNED)
            .map(|(index, &count)| (PieceIdx::new(index as u32), count))
    }

    fn fill_owned(&mut self, owned: &PieceBitfield) {
        for (index, count) in self.0.iter_mut().enumerate() {
            *count = if owned.has_piece(PieceIdx::new(index as u32)) {
                OWNED
            } else {
                0
            };
        }
    }

    fn check_bitfield(&self, bitfield: &PieceBitfield) -> Result<(), TallyError> {
        if bitfield.len() != self.len() {
            return Err(TallyError::LengthMismatch {
                expected: self.len(),
                actual: bitfield.len(),
            });
        }
        Ok(())
    }

    fn entry_mut(&mut self, index: PieceIdx) -> Result<&mut i32, TallyError> {
        let len = self.len();
        self.0
            .get_mut(index.as_usize())
            .ok_or(TallyError::IndexOutOfRange {
                index: u32::from(index),
                len,
            })
    }
}
