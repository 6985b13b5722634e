use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::{PeerId, PieceIdx, Sha1};

const HANDSHAKE_PROTOCOL_LENGTH: u8 = 19;
const HANDSHAKE_PROTOCOL: &[u8; HANDSHAKE_PROTOCOL_LENGTH as usize] = b"BitTorrent protocol";

const HANDSHAKE_RESERVED_IDX: usize = 1 + HANDSHAKE_PROTOCOL_LENGTH as usize;
const HANDSHAKE_RESERVED_LENGTH: usize = 8;

const HANDSHAKE_INFOHASH_IDX: usize = HANDSHAKE_RESERVED_IDX + HANDSHAKE_RESERVED_LENGTH;
const HANDSHAKE_PEERID_IDX: usize = HANDSHAKE_INFOHASH_IDX + 20;

pub const HANDSHAKE_LENGTH: usize = 1 // protocol name length
    + HANDSHAKE_PROTOCOL_LENGTH as usize
    + HANDSHAKE_RESERVED_LENGTH // 8 reserved bytes, currently all zero
    + 20 // 20 byte sha1 info_hash
    + 20; // 20 byte peer id

/// Largest accepted value of a frame's length prefix.
pub const MAX_FRAME_LENGTH: u32 = 128 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake protocol name length was {0}, expected 19")]
    InvalidProtocolLength(u8),

    #[error("handshake protocol name mismatch")]
    InvalidProtocol,

    #[error("peer sent info hash {0} which does not match ours")]
    InfoHashMismatch(Sha1),

    #[error("handshake timed out")]
    Timeout,

    #[error("frame length {0} exceeds the limit of {MAX_FRAME_LENGTH} bytes")]
    FrameTooLarge(u32),

    #[error("invalid payload length {length} for message id {id}")]
    InvalidPayload { id: u8, length: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: PieceIdx,
    },
    Bitfield {
        bitfield: Bytes,
    },
    Request {
        index: PieceIdx,
        begin: u32,
        length: u32,
    },
    Piece {
        index: PieceIdx,
        begin: u32,
        data: Bytes,
    },
    Cancel {
        index: PieceIdx,
        begin: u32,
        length: u32,
    },
    /// A frame with an id we do not know. The payload has been skipped.
    Unknown {
        id: u8,
        /// Value of the length prefix, id byte included.
        length: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MessageKind {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageKind {
    fn from_u8(kind: u8) -> Option<MessageKind> {
        match kind {
            0 => Some(MessageKind::Choke),
            1 => Some(MessageKind::Unchoke),
            2 => Some(MessageKind::Interested),
            3 => Some(MessageKind::NotInterested),
            4 => Some(MessageKind::Have),
            5 => Some(MessageKind::Bitfield),
            6 => Some(MessageKind::Request),
            7 => Some(MessageKind::Piece),
            8 => Some(MessageKind::Cancel),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: Sha1,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn encode(&self) -> [u8; HANDSHAKE_LENGTH] {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        buf[0] = HANDSHAKE_PROTOCOL_LENGTH;
        buf[1..HANDSHAKE_RESERVED_IDX].copy_from_slice(HANDSHAKE_PROTOCOL);
        buf[HANDSHAKE_INFOHASH_IDX..HANDSHAKE_PEERID_IDX]
            .copy_from_slice(self.info_hash.as_bytes());
        buf[HANDSHAKE_PEERID_IDX..].copy_from_slice(self.peer_id.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HANDSHAKE_LENGTH]) -> Result<Self, WireError> {
        if buf[0] != HANDSHAKE_PROTOCOL_LENGTH {
            return Err(WireError::InvalidProtocolLength(buf[0]));
        }
        if &buf[1..HANDSHAKE_RESERVED_IDX] != HANDSHAKE_PROTOCOL {
            return Err(WireError::InvalidProtocol);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[HANDSHAKE_INFOHASH_IDX..HANDSHAKE_PEERID_IDX]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[HANDSHAKE_PEERID_IDX..]);

        Ok(Handshake {
            info_hash: Sha1::from(info_hash),
            peer_id: PeerId::from(peer_id),
        })
    }
}

pub fn write_handshake<W: Write>(mut writer: W, handshake: &Handshake) -> Result<(), WireError> {
    writer.write_all(&handshake.encode())?;
    Ok(())
}

pub fn read_handshake<R: Read>(mut reader: R) -> Result<Handshake, WireError> {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    reader.read_exact(&mut buf)?;
    Handshake::decode(&buf)
}

pub async fn write_handshake_async<W: AsyncWrite + Unpin>(
    mut writer: W,
    handshake: &Handshake,
) -> Result<(), WireError> {
    writer.write_all(&handshake.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_handshake_async<R: AsyncRead + Unpin>(
    mut reader: R,
) -> Result<Handshake, WireError> {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    reader.read_exact(&mut buf).await?;
    Handshake::decode(&buf)
}

impl Message {
    /// Serialize the message into a complete frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_length() as usize + 4);
        buf.put_u32(self.frame_length());
        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(MessageKind::Choke.to_u8()),
            Message::Unchoke => buf.put_u8(MessageKind::Unchoke.to_u8()),
            Message::Interested => buf.put_u8(MessageKind::Interested.to_u8()),
            Message::NotInterested => buf.put_u8(MessageKind::NotInterested.to_u8()),
            Message::Have { index } => {
                buf.put_u8(MessageKind::Have.to_u8());
                buf.put_u32(u32::from(*index));
            }
            Message::Bitfield { bitfield } => {
                buf.put_u8(MessageKind::Bitfield.to_u8());
                buf.put_slice(bitfield);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u8(MessageKind::Request.to_u8());
                buf.put_u32(u32::from(*index));
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u8(MessageKind::Piece.to_u8());
                buf.put_u32(u32::from(*index));
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u8(MessageKind::Cancel.to_u8());
                buf.put_u32(u32::from(*index));
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Unknown { id, length } => {
                // never sent by us, the zero payload only lets tests produce such frames
                buf.put_u8(*id);
                buf.put_bytes(0, length.saturating_sub(1) as usize);
            }
        }
        buf.freeze()
    }

    /// Value of the length prefix for this message.
    fn frame_length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { data, .. } => 9 + data.len() as u32,
            Message::Unknown { length, .. } => (*length).max(1),
        }
    }
}

/// What to do after reading a frame header.
enum FrameHeader {
    Unknown { id: u8, length: u32 },
    Known { kind: MessageKind, payload_length: u32 },
}

fn parse_header(length: u32, id: u8) -> FrameHeader {
    match MessageKind::from_u8(id) {
        Some(kind) => FrameHeader::Known {
            kind,
            payload_length: length - 1,
        },
        None => FrameHeader::Unknown { id, length },
    }
}

fn check_length(length: u32) -> Result<(), WireError> {
    if length > MAX_FRAME_LENGTH {
        return Err(WireError::FrameTooLarge(length));
    }
    Ok(())
}

fn decode_payload(kind: MessageKind, payload: Bytes) -> Result<Message, WireError> {
    let invalid = || WireError::InvalidPayload {
        id: kind.to_u8(),
        length: payload.len() as u32 + 1,
    };
    let u32_at = |offset: usize| {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&payload[offset..offset + 4]);
        u32::from_be_bytes(bytes)
    };

    let message = match kind {
        MessageKind::Choke
        | MessageKind::Unchoke
        | MessageKind::Interested
        | MessageKind::NotInterested => {
            if !payload.is_empty() {
                return Err(invalid());
            }
            match kind {
                MessageKind::Choke => Message::Choke,
                MessageKind::Unchoke => Message::Unchoke,
                MessageKind::Interested => Message::Interested,
                _ => Message::NotInterested,
            }
        }
        MessageKind::Have => {
            if payload.len() != 4 {
                return Err(invalid());
            }
            Message::Have {
                index: PieceIdx::from(u32_at(0)),
            }
        }
        MessageKind::Bitfield => Message::Bitfield { bitfield: payload },
        MessageKind::Request | MessageKind::Cancel => {
            if payload.len() != 12 {
                return Err(invalid());
            }
            let index = PieceIdx::from(u32_at(0));
            let begin = u32_at(4);
            let length = u32_at(8);
            if kind == MessageKind::Request {
                Message::Request {
                    index,
                    begin,
                    length,
                }
            } else {
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            }
        }
        MessageKind::Piece => {
            if payload.len() < 8 {
                return Err(invalid());
            }
            let index = PieceIdx::from(u32_at(0));
            let begin = u32_at(4);
            Message::Piece {
                index,
                begin,
                data: payload.slice(8..),
            }
        }
    };
    Ok(message)
}

pub fn read_message<R: Read>(mut reader: R) -> Result<Message, WireError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let length = u32::from_be_bytes(len);
    if length == 0 {
        return Ok(Message::KeepAlive);
    }
    check_length(length)?;

    let mut id = [0u8; 1];
    reader.read_exact(&mut id)?;
    match parse_header(length, id[0]) {
        FrameHeader::Unknown { id, length } => {
            let expected = u64::from(length - 1);
            let skipped = std::io::copy(&mut reader.by_ref().take(expected), &mut std::io::sink())?;
            if skipped != expected {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            Ok(Message::Unknown { id, length })
        }
        FrameHeader::Known {
            kind,
            payload_length,
        } => {
            let mut payload = vec![0u8; payload_length as usize];
            reader.read_exact(&mut payload)?;
            decode_payload(kind, Bytes::from(payload))
        }
    }
}

pub async fn read_message_async<R: AsyncRead + Unpin>(
    mut reader: R,
) -> Result<Message, WireError> {
    let length = reader.read_u32().await?;
    if length == 0 {
        return Ok(Message::KeepAlive);
    }
    check_length(length)?;

    let id = reader.read_u8().await?;
    match parse_header(length, id) {
        FrameHeader::Unknown { id, length } => {
            let expected = u64::from(length - 1);
            let mut limited = (&mut reader).take(expected);
            let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
            if skipped != expected {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            Ok(Message::Unknown { id, length })
        }
        FrameHeader::Known {
            kind,
            payload_length,
        } => {
            let mut payload = vec![0u8; payload_length as usize];
            reader.read_exact(&mut payload).await?;
            decode_payload(kind, Bytes::from(payload))
        }
    }
}

pub fn write_message<W: Write>(mut writer: W, message: &Message) -> Result<(), WireError> {
    writer.write_all(&message.encode())?;
    Ok(())
}

pub async fn write_message_async<W: AsyncWrite + Unpin>(
    mut writer: W,
    message: &Message,
) -> Result<(), WireError> {
    writer.write_all(&message.encode()).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(message: Message) {
        let encoded = message.encode();
        let mut reader = &encoded[..];
        let decoded = read_message(&mut reader).unwrap();
        assert_eq!(decoded, message);
        assert!(reader.is_empty(), "frame not fully consumed: {message:?}");
    }

    #[test]
    fn message_roundtrip() {
        let index = PieceIdx::new(0x01020304);
        let messages = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { index },
            Message::Bitfield {
                bitfield: Bytes::from_static(&[0b1010_0000, 0xff]),
            },
            Message::Bitfield {
                bitfield: Bytes::new(),
            },
            Message::Request {
                index,
                begin: 16384,
                length: 16384,
            },
            Message::Piece {
                index,
                begin: 0,
                data: Bytes::new(),
            },
            Message::Piece {
                index,
                begin: 32768,
                data: Bytes::from(vec![7u8; 32 * 1024]),
            },
            Message::Cancel {
                index,
                begin: 5,
                length: 6,
            },
            Message::Unknown { id: 20, length: 3 },
        ];
        for message in messages {
            roundtrip(message);
        }
    }

    #[test]
    fn wire_layout() {
        let request = Message::Request {
            index: PieceIdx::new(1),
            begin: 2,
            length: 3,
        };
        assert_eq!(
            &request.encode()[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
        let cancel = Message::Cancel {
            index: PieceIdx::new(1),
            begin: 2,
            length: 3,
        };
        assert_eq!(&cancel.encode()[..5], &[0, 0, 0, 13, 8]);
        assert_eq!(&Message::KeepAlive.encode()[..], &[0, 0, 0, 0]);
        assert_eq!(&Message::Interested.encode()[..], &[0, 0, 0, 1, 2]);
        let have = Message::Have {
            index: PieceIdx::new(258),
        };
        assert_eq!(&have.encode()[..], &[0, 0, 0, 5, 4, 0, 0, 1, 2]);
    }

    #[test]
    fn unknown_frame_keeps_stream_framed() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0, 0, 0, 4, 42, 0xaa, 0xbb, 0xcc]);
        stream.extend_from_slice(&Message::Have {
            index: PieceIdx::new(9),
        }
        .encode());

        let mut reader = &stream[..];
        assert_eq!(
            read_message(&mut reader).unwrap(),
            Message::Unknown { id: 42, length: 4 }
        );
        assert_eq!(
            read_message(&mut reader).unwrap(),
            Message::Have {
                index: PieceIdx::new(9)
            }
        );
        assert!(reader.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = (MAX_FRAME_LENGTH + 1).to_be_bytes();
        let result = read_message(&frame[..]);
        assert!(matches!(result, Err(WireError::FrameTooLarge(len)) if len == MAX_FRAME_LENGTH + 1));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let encoded = Message::Piece {
            index: PieceIdx::new(0),
            begin: 0,
            data: Bytes::from_static(b"abcdef"),
        }
        .encode();
        let result = read_message(&encoded[..encoded.len() - 2]);
        assert!(
            matches!(result, Err(WireError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof)
        );

        let truncated_unknown = [0u8, 0, 0, 10, 99, 1, 2];
        assert!(matches!(
            read_message(&truncated_unknown[..]),
            Err(WireError::Io(_))
        ));
    }

    #[test]
    fn wrong_fixed_payload_is_rejected() {
        let frame = [0u8, 0, 0, 3, 4, 0, 1];
        assert!(matches!(
            read_message(&frame[..]),
            Err(WireError::InvalidPayload { id: 4, length: 3 })
        ));
        let frame = [0u8, 0, 0, 2, 0, 0];
        assert!(matches!(
            read_message(&frame[..]),
            Err(WireError::InvalidPayload { id: 0, length: 2 })
        ));
    }

    #[test]
    fn handshake_roundtrip() {
        let handshake = Handshake {
            info_hash: Sha1::hash(b"swarm"),
            peer_id: PeerId::new(*b"-SB0100-abcdefghijkl"),
        };
        let encoded = handshake.encode();
        assert_eq!(encoded.len(), 68);
        assert_eq!(encoded[0], 19);
        assert_eq!(&encoded[1..20], b"BitTorrent protocol");
        assert_eq!(&encoded[20..28], &[0u8; 8]);
        assert_eq!(&encoded[28..48], handshake.info_hash.as_bytes());
        assert_eq!(&encoded[48..68], handshake.peer_id.as_bytes());

        let mut buf = Vec::new();
        write_handshake(&mut buf, &handshake).unwrap();
        assert_eq!(read_handshake(&buf[..]).unwrap(), handshake);
    }

    #[test]
    fn handshake_ignores_reserved_bits() {
        let handshake = Handshake {
            info_hash: Sha1::hash(b"swarm"),
            peer_id: PeerId::default(),
        };
        let mut encoded = handshake.encode();
        encoded[25] = 0x10;
        encoded[27] = 0x05;
        assert_eq!(Handshake::decode(&encoded).unwrap(), handshake);
    }

    #[test]
    fn handshake_rejects_other_protocols() {
        let mut encoded = Handshake {
            info_hash: Sha1::default(),
            peer_id: PeerId::default(),
        }
        .encode();
        encoded[1] = b'b';
        assert!(matches!(
            Handshake::decode(&encoded),
            Err(WireError::InvalidProtocol)
        ));
        encoded[0] = 18;
        assert!(matches!(
            Handshake::decode(&encoded),
            Err(WireError::InvalidProtocolLength(18))
        ));
    }

    #[tokio::test]
    async fn async_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let handshake = Handshake {
            info_hash: Sha1::hash(b"swarm"),
            peer_id: PeerId::generate(),
        };
        let messages = vec![
            Message::Interested,
            Message::Unknown { id: 77, length: 5 },
            Message::Piece {
                index: PieceIdx::new(3),
                begin: 16384,
                data: Bytes::from_static(b"block"),
            },
            Message::KeepAlive,
        ];

        let writer = {
            let messages = messages.clone();
            tokio::spawn(async move {
                write_handshake_async(&mut client, &handshake).await.unwrap();
                for message in messages {
                    write_message_async(&mut client, &message).await.unwrap();
                }
            })
        };

        assert_eq!(read_handshake_async(&mut server).await.unwrap(), handshake);
        for message in messages {
            assert_eq!(read_message_async(&mut server).await.unwrap(), message);
        }
        writer.await.unwrap();
    }
}
