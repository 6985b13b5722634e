use std::{
    fs::File,
    io::{Read as _, Seek as _, SeekFrom, Write as _},
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{info::piece_length_at, PieceBitfield, PieceIdx, Sha1, TorrentInfo};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block at {begin} with length {length} is outside of {index}")]
    OutOfBounds {
        index: PieceIdx,
        begin: u32,
        length: u32,
    },

    #[error("{path:?} is {actual} bytes, larger than the expected {expected}")]
    FileTooLarge {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("root {0:?} is not a directory")]
    InvalidRoot(PathBuf),

    #[error("storage of {total_length} bytes needs {expected} piece hashes, got {actual}")]
    Geometry {
        total_length: u64,
        expected: u64,
        actual: usize,
    },
}

/// A byte addressable backing store of fixed length.
pub trait Storage: Send {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> std::io::Result<()>;

    fn write_at(&mut self, data: &[u8], offset: u64) -> std::io::Result<()>;

    fn length(&self) -> u64;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStorage(Vec<u8>);

impl MemoryStorage {
    pub fn new(length: u64) -> Self {
        Self(vec![0; length as usize])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(data)
    }

    fn range(&self, offset: u64, len: usize) -> std::io::Result<std::ops::Range<usize>> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.0.len() => Ok(start..end),
            _ => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)),
        }
    }
}

impl Storage for MemoryStorage {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.0[range]);
        Ok(())
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> std::io::Result<()> {
        let range = self.range(offset, data.len())?;
        self.0[range].copy_from_slice(data);
        Ok(())
    }

    fn length(&self) -> u64 {
        self.0.len() as u64
    }
}

#[derive(Debug)]
pub struct FileStorage {
    file: File,
    length: u64,
}

impl FileStorage {
    /// Open or create the file at `path` and size it to `length`.
    ///
    /// Parent directories are created. An existing file larger than `length` is an error,
    /// a shorter one is extended with zeros.
    pub fn open(path: &Path, length: u64) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let actual = file.metadata()?.len();
        if actual > length {
            return Err(StoreError::FileTooLarge {
                path: path.to_owned(),
                expected: length,
                actual,
            });
        }
        if actual < length {
            file.set_len(length)?;
        }
        Ok(Self { file, length })
    }
}

impl Storage for FileStorage {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn length(&self) -> u64 {
        self.length
    }
}

/// Maps the piece address space onto an ordered list of storages.
pub struct PieceStore {
    segments: Vec<Box<dyn Storage>>,
    hashes: Vec<Sha1>,
    piece_length: u32,
    total_length: u64,
}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("segments", &self.segments.len())
            .field("pieces", &self.hashes.len())
            .field("piece_length", &self.piece_length)
            .field("total_length", &self.total_length)
            .finish()
    }
}

impl PieceStore {
    pub fn new(
        segments: Vec<Box<dyn Storage>>,
        hashes: Vec<Sha1>,
        piece_length: u32,
    ) -> Result<Self, StoreError> {
        let total_length = segments.iter().map(|s| s.length()).sum::<u64>();
        let expected = match piece_length {
            0 => u64::MAX,
            _ => total_length.div_ceil(u64::from(piece_length)),
        };
        if expected != hashes.len() as u64 {
            return Err(StoreError::Geometry {
                total_length,
                expected,
                actual: hashes.len(),
            });
        }
        Ok(Self {
            segments,
            hashes,
            piece_length,
            total_length,
        })
    }

    /// One [`FileStorage`] per file of the torrent, laid out under `root`.
    pub fn create(info: &TorrentInfo, root: &Path) -> Result<Self, StoreError> {
        if !root.is_dir() {
            return Err(StoreError::InvalidRoot(root.to_owned()));
        }
        let mut segments: Vec<Box<dyn Storage>> = Vec::with_capacity(info.files().len());
        for file in info.files() {
            let path = root.join(file.path());
            tracing::debug!(path = ?path, length = file.length(), "opening file");
            segments.push(Box::new(FileStorage::open(&path, file.length())?));
        }
        Self::new(segments, info.pieces().to_vec(), info.piece_length())
    }

    /// Zero filled in-memory storage with the torrent's geometry.
    pub fn in_memory(info: &TorrentInfo) -> Self {
        let segments: Vec<Box<dyn Storage>> = info
            .files()
            .iter()
            .map(|file| Box::new(MemoryStorage::new(file.length())) as Box<dyn Storage>)
            .collect();
        Self {
            segments,
            hashes: info.pieces().to_vec(),
            piece_length: info.piece_length(),
            total_length: info.total_size(),
        }
    }

    pub fn pieces_count(&self) -> u32 {
        self.hashes.len() as u32
    }

    pub fn piece_length(&self, index: PieceIdx) -> u32 {
        piece_length_at(
            self.total_length,
            self.piece_length,
            self.pieces_count(),
            index,
        )
    }

    pub fn read_block(
        &mut self,
        index: PieceIdx,
        begin: u32,
        length: u32,
    ) -> Result<Vec<u8>, StoreError> {
        let offset = self.block_offset(index, begin, length)?;
        let mut buf = vec![0u8; length as usize];
        self.read_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Write a block. With `is_final` the whole piece is hashed afterwards and the
    /// returned flag tells whether the piece should be discarded.
    pub fn write_block(
        &mut self,
        index: PieceIdx,
        begin: u32,
        data: &[u8],
        is_final: bool,
    ) -> Result<bool, StoreError> {
        let length = u32::try_from(data.len()).map_err(|_| StoreError::OutOfBounds {
            index,
            begin,
            length: u32::MAX,
        })?;
        let offset = self.block_offset(index, begin, length)?;
        self.write_at(data, offset)?;
        if !is_final {
            return Ok(false);
        }
        Ok(!self.verify_piece(index)?)
    }

    /// Hash the stored piece and compare it against the expected hash.
    pub fn verify_piece(&mut self, index: PieceIdx) -> Result<bool, StoreError> {
        let length = self.piece_length(index);
        let data = self.read_block(index, 0, length)?;
        let valid = Some(Sha1::hash(&data)) == self.hashes.get(index.as_usize()).copied();
        if !valid {
            tracing::warn!(piece = %index, "hash mismatch");
        }
        Ok(valid)
    }

    /// Hash every piece, returning the ones that are intact.
    pub fn validate_all(&mut self) -> Result<PieceBitfield, StoreError> {
        let mut bitfield = PieceBitfield::with_size(self.pieces_count());
        for index in (0..self.pieces_count()).map(PieceIdx::new) {
            if self.verify_piece(index)? {
                bitfield.set_piece(index);
            }
        }
        Ok(bitfield)
    }

    fn block_offset(&self, index: PieceIdx, begin: u32, length: u32) -> Result<u64, StoreError> {
        let piece_length = self.piece_length(index);
        let in_bounds = index.0 < self.pieces_count()
            && begin
                .checked_add(length)
                .is_some_and(|end| end <= piece_length);
        if !in_bounds {
            return Err(StoreError::OutOfBounds {
                index,
                begin,
                length,
            });
        }
        Ok(u64::from(index.0) * u64::from(self.piece_length) + u64::from(begin))
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), StoreError> {
        let mut rest = buf;
        let mut position = offset;
        let mut segment_start = 0;
        for segment in self.segments.iter_mut() {
            if rest.is_empty() {
                break;
            }
            let segment_end = segment_start + segment.length();
            if position < segment_end {
                let n = (segment_end - position).min(rest.len() as u64) as usize;
                let (head, tail) = std::mem::take(&mut rest).split_at_mut(n);
                segment.read_at(head, position - segment_start)?;
                rest = tail;
                position += n as u64;
            }
            segment_start = segment_end;
        }
        Ok(())
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> Result<(), StoreError> {
        let mut rest = data;
        let mut position = offset;
        let mut segment_start = 0;
        for segment in self.segments.iter_mut() {
            if rest.is_empty() {
                break;
            }
            let segment_end = segment_start + segment.length();
            if position < segment_end {
                let n = (segment_end - position).min(rest.len() as u64) as usize;
                let (head, tail) = rest.split_at(n);
                segment.write_at(head, position - segment_start)?;
                rest = tail;
                position += n as u64;
            }
            segment_start = segment_end;
        }
        Ok(())
    }
}
