use std::path::PathBuf;

use crate::{InfoError, Sha1, TorrentInfo};

const DEFAULT_PIECE_LENGTH: u32 = 256 * 1024;

#[derive(Debug, Default, Clone)]
pub struct TorrentCreatorConfig {
    pub name: Option<String>,
    pub piece_length: Option<u32>,
}

pub struct TorrentCreatorFile<'a> {
    creator: &'a mut TorrentCreator,
    path: PathBuf,
    length: u64,
}

impl TorrentCreatorFile<'_> {
    pub fn push_data(&mut self, data: &[u8]) {
        self.length += data.len() as u64;
        self.creator.push_data(data);
    }

    pub fn finish(self) {}
}

impl Drop for TorrentCreatorFile<'_> {
    fn drop(&mut self) {
        self.creator
            .files
            .push((std::mem::take(&mut self.path), self.length));
    }
}

/// Hashes file contents into pieces as they are pushed, producing a [`TorrentInfo`].
#[derive(Debug)]
pub struct TorrentCreator {
    config: TorrentCreatorConfig,
    piece_length: u32,
    pieces: Vec<Sha1>,
    files: Vec<(PathBuf, u64)>,
    buffer: Vec<u8>,
}

impl TorrentCreator {
    pub fn new(config: TorrentCreatorConfig) -> Self {
        let piece_length = config.piece_length.unwrap_or(DEFAULT_PIECE_LENGTH);
        Self {
            config,
            piece_length,
            pieces: Default::default(),
            files: Default::default(),
            buffer: Default::default(),
        }
    }

    fn push_data(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        let piece_length = self.piece_length as usize;
        while piece_length > 0 && self.buffer.len() >= piece_length {
            let piece_hash = Sha1::hash(&self.buffer[..piece_length]);
            self.buffer.drain(..piece_length);
            self.pieces.push(piece_hash);
        }
    }

    /// Start a new file. Data pushed through the returned handle is appended to the torrent.
    pub fn file(&mut self, path: impl Into<PathBuf>) -> TorrentCreatorFile<'_> {
        TorrentCreatorFile {
            creator: self,
            path: path.into(),
            length: 0,
        }
    }

    pub fn finish(mut self) -> Result<TorrentInfo, InfoError> {
        if !self.buffer.is_empty() {
            self.pieces.push(Sha1::hash(&self.buffer));
        }

        let name = match self.config.name {
            Some(name) => name,
            None => self
                .files
                .first()
                .map(|(path, _)| path.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        TorrentInfo::new(name, self.piece_length, self.pieces, self.files)
    }
}
