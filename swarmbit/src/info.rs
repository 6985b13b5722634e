use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{PieceIdx, Sha1};

#[derive(Debug, Error)]
pub enum InfoError {
    #[error("piece length must be greater than zero")]
    ZeroPieceLength,

    #[error("expected {expected} piece hashes for {total_size} bytes, got {actual}")]
    PieceCount {
        expected: u64,
        actual: usize,
        total_size: u64,
    },

    #[error("invalid file path: {0:?}")]
    InvalidPath(PathBuf),

    #[error("failed to decode metadata: {0}")]
    Decode(#[from] serde_json::Error),
}

struct TorrentInfoInner {
    name: String,
    piece_length: u32,
    pieces: Vec<Sha1>,
    info_hash: Sha1,
    files: Vec<TorrentFile>,
}

impl std::fmt::Debug for TorrentInfoInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Torrent \n\tName : {:?}\n\tInfo hash : {}\n\tPiece length : {:?}\n\tPieces : {}\n\tFiles : {:#?}\n",
            self.name,
            self.info_hash,
            self.piece_length,
            self.pieces.len(),
            self.files
        )
    }
}

/// Static description of a torrent: piece geometry, piece hashes and the file list.
#[derive(Clone)]
pub struct TorrentInfo(Arc<TorrentInfoInner>);

impl std::fmt::Debug for TorrentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Metainfo {
    name: String,
    piece_length: u32,
    files: Vec<MetainfoFile>,
    pieces: Vec<Sha1>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetainfoFile {
    path: Vec<String>,
    length: u64,
}

impl TorrentInfo {
    /// Build the metadata from its parts. `files` are `(relative path, length)` pairs in
    /// torrent order. The info hash is derived from the canonical encoding of all fields.
    pub fn new(
        name: impl Into<String>,
        piece_length: u32,
        pieces: Vec<Sha1>,
        files: Vec<(PathBuf, u64)>,
    ) -> Result<Self, InfoError> {
        let name = name.into();
        if piece_length == 0 {
            return Err(InfoError::ZeroPieceLength);
        }

        let mut torrent_files = Vec::with_capacity(files.len());
        let mut offset = 0;
        for (index, (path, length)) in files.into_iter().enumerate() {
            validate_path(&path)?;
            torrent_files.push(TorrentFile {
                index,
                start: offset,
                length,
                path,
            });
            offset += length;
        }

        let expected = offset.div_ceil(u64::from(piece_length));
        if expected != pieces.len() as u64 {
            return Err(InfoError::PieceCount {
                expected,
                actual: pieces.len(),
                total_size: offset,
            });
        }

        let info_hash = Sha1::hash(&canonical_encoding(
            &name,
            piece_length,
            &torrent_files,
            &pieces,
        ));

        Ok(Self(Arc::new(TorrentInfoInner {
            name,
            piece_length,
            pieces,
            info_hash,
            files: torrent_files,
        })))
    }

    /// Decode metadata previously produced by [`TorrentInfo::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, InfoError> {
        let metainfo = serde_json::from_slice::<Metainfo>(buf)?;
        let files = metainfo
            .files
            .into_iter()
            .map(|file| (file.path.iter().collect::<PathBuf>(), file.length))
            .collect();
        Self::new(
            metainfo.name,
            metainfo.piece_length,
            metainfo.pieces,
            files,
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let metainfo = Metainfo {
            name: self.0.name.clone(),
            piece_length: self.0.piece_length,
            files: self
                .0
                .files
                .iter()
                .map(|file| MetainfoFile {
                    path: path_components(&file.path),
                    length: file.length,
                })
                .collect(),
            pieces: self.0.pieces.clone(),
        };
        serde_json::to_vec_pretty(&metainfo).expect("metainfo serialization is infallible")
    }

    pub fn name(&self) -> &str {
        self.0.name.as_str()
    }

    pub fn total_size(&self) -> u64 {
        self.0.files.iter().map(|f| f.length).sum()
    }

    pub fn info_hash(&self) -> Sha1 {
        self.0.info_hash
    }

    pub fn piece_length(&self) -> u32 {
        self.0.piece_length
    }

    /// Length of the given piece, the last piece may be shorter. Zero for invalid indices.
    pub fn piece_length_from_index(&self, piece_index: PieceIdx) -> u32 {
        piece_length_at(
            self.total_size(),
            self.piece_length(),
            self.pieces_count(),
            piece_index,
        )
    }

    pub fn piece_index_valid(&self, piece_index: PieceIdx) -> bool {
        piece_index.0 < self.pieces_count()
    }

    pub fn piece_request_valid(&self, piece_index: PieceIdx, begin: u32, length: u32) -> bool {
        if !self.piece_index_valid(piece_index) {
            return false;
        }

        let piece_length = self.piece_length_from_index(piece_index);
        begin.saturating_add(length) <= piece_length
    }

    pub fn piece_hash(&self, piece_index: PieceIdx) -> Option<Sha1> {
        self.0.pieces.get(piece_index.0 as usize).copied()
    }

    pub fn pieces_count(&self) -> u32 {
        self.0.pieces.len() as u32
    }

    pub fn pieces(&self) -> &[Sha1] {
        &self.0.pieces
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.0.files
    }
}

pub(crate) fn piece_length_at(
    total_size: u64,
    piece_length: u32,
    pieces_count: u32,
    piece_index: PieceIdx,
) -> u32 {
    if piece_index.0 >= pieces_count {
        return 0;
    }
    if piece_index.0 + 1 < pieces_count {
        return piece_length;
    }
    match total_size % u64::from(piece_length) {
        0 => piece_length,
        r => r as u32,
    }
}

#[derive(Debug, Clone)]
pub struct TorrentFile {
    index: usize,
    start: u64,
    length: u64,
    path: PathBuf,
}

impl TorrentFile {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Offset of the first byte of this file in the torrent
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn validate_path(path: &Path) -> Result<(), InfoError> {
    let valid = path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(InfoError::InvalidPath(path.to_owned()))
    }
}

fn path_components(path: &Path) -> Vec<String> {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect()
}

fn canonical_encoding(
    name: &str,
    piece_length: u32,
    files: &[TorrentFile],
    pieces: &[Sha1],
) -> Vec<u8> {
    fn push_str(buf: &mut Vec<u8>, value: &str) {
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        buf.extend_from_slice(value.as_bytes());
    }

    let mut buf = Vec::new();
    push_str(&mut buf, name);
    buf.extend_from_slice(&piece_length.to_be_bytes());
    buf.extend_from_slice(&(files.len() as u32).to_be_bytes());
    for file in files {
        push_str(&mut buf, &path_components(&file.path).join("/"));
        buf.extend_from_slice(&file.length.to_be_bytes());
    }
    for piece in pieces {
        buf.extend_from_slice(piece.as_bytes());
    }
    buf
}

#[cfg(test)]
mod test_torrent_info {
    use super::*;

    fn sample() -> TorrentInfo {
        TorrentInfo::new(
            "sample",
            16,
            vec![Sha1::hash(b"0"), Sha1::hash(b"1"), Sha1::hash(b"2")],
            vec![
                (PathBuf::from("a.txt"), 10),
                (PathBuf::from("dir/b.txt"), 30),
            ],
        )
        .unwrap()
    }

    #[test]
    fn geometry() {
        let info = sample();
        insta::assert_yaml_snapshot!(info.total_size(), @"40");
        insta::assert_yaml_snapshot!(info.pieces_count(), @"3");
        assert_eq!(info.piece_length_from_index(PieceIdx::new(0)), 16);
        assert_eq!(info.piece_length_from_index(PieceIdx::new(1)), 16);
        assert_eq!(info.piece_length_from_index(PieceIdx::new(2)), 8);
        assert_eq!(info.piece_length_from_index(PieceIdx::new(3)), 0);
        assert_eq!(info.files()[1].start(), 10);
        assert!(info.piece_request_valid(PieceIdx::new(2), 0, 8));
        assert!(!info.piece_request_valid(PieceIdx::new(2), 4, 8));
        assert!(!info.piece_request_valid(PieceIdx::new(3), 0, 1));
    }

    #[test]
    fn evenly_divisible_last_piece_is_full() {
        let info = TorrentInfo::new(
            "even",
            16,
            vec![Sha1::default(), Sha1::default()],
            vec![(PathBuf::from("even"), 32)],
        )
        .unwrap();
        assert_eq!(info.piece_length_from_index(PieceIdx::new(1)), 16);
    }

    #[test]
    fn rejects_inconsistent_piece_count() {
        let result = TorrentInfo::new(
            "bad",
            16,
            vec![Sha1::default()],
            vec![(PathBuf::from("bad"), 17)],
        );
        assert!(matches!(
            result,
            Err(InfoError::PieceCount { expected: 2, .. })
        ));
    }

    #[test]
    fn rejects_escaping_paths() {
        let result = TorrentInfo::new(
            "bad",
            16,
            vec![Sha1::default()],
            vec![(PathBuf::from("../etc/passwd"), 1)],
        );
        assert!(matches!(result, Err(InfoError::InvalidPath(_))));
    }

    #[test]
    fn encode_decode_preserves_info_hash() {
        let info = sample();
        let decoded = TorrentInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded.info_hash(), info.info_hash());
        assert_eq!(decoded.files()[1].path(), Path::new("dir/b.txt"));
        assert_eq!(decoded.pieces(), info.pieces());
    }

    #[test]
    fn info_hash_depends_on_content() {
        let other = TorrentInfo::new(
            "sample",
            16,
            vec![Sha1::hash(b"0"), Sha1::hash(b"1"), Sha1::hash(b"x")],
            vec![
                (PathBuf::from("a.txt"), 10),
                (PathBuf::from("dir/b.txt"), 30),
            ],
        )
        .unwrap();
        assert_ne!(other.info_hash(), sample().info_hash());
    }
}
