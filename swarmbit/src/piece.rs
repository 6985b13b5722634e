#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIdx(pub(crate) u32);

impl std::fmt::Display for PieceIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Piece({})", self.0)
    }
}

impl From<PieceIdx> for u32 {
    fn from(value: PieceIdx) -> Self {
        value.0
    }
}

impl From<u32> for PieceIdx {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl PieceIdx {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// Which pieces a peer (or we) have. Bit 0 of byte 0 is the high bit, as on the wire.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct PieceBitfield {
    data: Vec<u8>,
    size: u32,
}

impl PieceBitfield {
    // size is the number of bits required
    pub fn with_size(size: u32) -> Self {
        let data = vec![0u8; Self::required_vec_capacity(size)];
        Self { data, size }
    }

    /// Parse a wire bitfield for a torrent with `size` pieces.
    ///
    /// Returns `None` if the byte length does not match or any spare trailing bit is set.
    pub fn from_bytes(bytes: &[u8], size: u32) -> Option<Self> {
        if bytes.len() != Self::required_vec_capacity(size) {
            return None;
        }
        let bitfield = Self {
            data: bytes.to_vec(),
            size,
        };
        if (size..bitfield.piece_capacity()).any(|i| bitfield.bit(i)) {
            return None;
        }
        Some(bitfield)
    }

    /// Panics if `index` is not below `len()`.
    pub fn has_piece(&self, index: PieceIdx) -> bool {
        self.check_index(index);
        self.bit(index.0)
    }

    /// Returns true if the piece was not set before.
    pub fn set_piece(&mut self, index: PieceIdx) -> bool {
        self.check_index(index);
        let (byte_index, bit_index) = Self::get_indices(index.0);
        let previous = self.data[byte_index];
        self.data[byte_index] = previous | (1 << bit_index);
        previous != self.data[byte_index]
    }

    fn piece_capacity(&self) -> u32 {
        (self.data.len() * 8) as u32
    }

    pub fn num_set(&self) -> u32 {
        self.pieces().count() as u32
    }

    pub fn complete(&self) -> bool {
        self.num_set() == self.size
    }

    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bytes(&self) -> &[u8] {
        self.as_ref()
    }

    /// Iterator over pieces that this bitfield contains
    pub fn pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        (0..self.len())
            .filter(move |p| self.bit(*p))
            .map(PieceIdx::new)
    }

    fn bit(&self, index: u32) -> bool {
        let (byte_index, bit_index) = Self::get_indices(index);
        (self.data[byte_index] & (1 << bit_index)) > 0
    }

    fn check_index(&self, index: PieceIdx) {
        if index.0 >= self.size {
            panic!(
                "bitfield of {} pieces not large enough for index {}",
                self.size, index.0
            );
        }
    }

    // returns (byte_index, bit_index)
    fn get_indices(index: u32) -> (usize, usize) {
        let byte_index = index as usize / 8;
        let bit_index = 7 - index as usize % 8;
        (byte_index, bit_index)
    }

    fn required_vec_capacity(num_bits: u32) -> usize {
        num_bits.div_ceil(8) as usize
    }
}

impl std::fmt::Debug for PieceBitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceBitfield")
            .field("bits", &self.size)
            .field("set", &self.num_set())
            .finish()
    }
}

impl AsRef<[u8]> for PieceBitfield {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn creation() {
        let bf = PieceBitfield::with_size(33);
        assert_eq!(bf.piece_capacity(), 40);
        assert_eq!(bf.bytes().len(), 5);
    }

    #[test]
    fn creation_all_zeros() {
        let bf = PieceBitfield::with_size(32);
        for i in 0..bf.len() {
            assert!(!bf.has_piece(PieceIdx::new(i)));
        }
    }

    #[test]
    fn setting_bits() {
        let mut bf = PieceBitfield::with_size(32);
        assert!(bf.set_piece(PieceIdx::new(5)));
        assert!(bf.set_piece(PieceIdx::new(9)));
        assert!(bf.set_piece(PieceIdx::new(30)));
        assert!(!bf.set_piece(PieceIdx::new(30)));

        assert_eq!(
            bf.pieces().collect::<Vec<_>>(),
            vec![PieceIdx::new(5), PieceIdx::new(9), PieceIdx::new(30)]
        );
        assert_eq!(bf.num_set(), 3);
    }

    #[test]
    fn high_bit_first() {
        let mut bf = PieceBitfield::with_size(10);
        bf.set_piece(PieceIdx::new(0));
        bf.set_piece(PieceIdx::new(9));
        assert_eq!(bf.bytes(), &[0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn from_bytes_checks_length_and_spare_bits() {
        let bf = PieceBitfield::from_bytes(&[0b1010_0000], 3).unwrap();
        assert!(bf.has_piece(PieceIdx::new(0)));
        assert!(!bf.has_piece(PieceIdx::new(1)));
        assert!(bf.has_piece(PieceIdx::new(2)));

        assert!(PieceBitfield::from_bytes(&[0, 0], 3).is_none());
        assert!(PieceBitfield::from_bytes(&[0b0001_0000], 3).is_none());
    }

    #[test]
    fn complete() {
        let mut bf = PieceBitfield::with_size(2);
        assert!(!bf.complete());
        bf.set_piece(PieceIdx::new(0));
        bf.set_piece(PieceIdx::new(1));
        assert!(bf.complete());
    }

    #[test]
    #[should_panic]
    fn index_past_size_panics() {
        let bf = PieceBitfield::with_size(3);
        bf.has_piece(PieceIdx::new(3));
    }
}
