use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncWriteExt as _, BufWriter},
    sync::mpsc::{self, error::TrySendError},
    task::AbortHandle,
};

use crate::{
    wire::{self, Handshake, Message, WireError},
    PeerId, PieceBitfield, PieceIdx, Sha1,
};

use super::{PeerIo, PeerKey, PeerReader, PeerWriter, TorrentMsg, TorrentSender};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("peer queue is full")]
    Full,

    #[error("peer session is closed")]
    Closed,
}

/// The four choke/interest flags of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    /// are we choking the peer
    pub am_choking: bool,
    /// are we interested in the peer
    pub am_interested: bool,
    /// is the peer choking us
    pub peer_choking: bool,
    /// is the peer interested in us
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

#[derive(Debug, Default)]
struct PeerState {
    flags: PeerFlags,
    /// `None` until the peer sends a bitfield or its first `Have`
    bitfield: Option<PieceBitfield>,
}

#[derive(Debug)]
struct PeerShared {
    key: PeerKey,
    id: PeerId,
    addr: Option<SocketAddr>,
    state: RwLock<PeerState>,
    closed: AtomicBool,
}

/// Handle to an established connection.
///
/// Cloning is cheap, all clones refer to the same connection. The connection is torn down once
/// every clone has been dropped.
#[derive(Debug, Clone)]
pub struct PeerSession {
    shared: Arc<PeerShared>,
    sender: mpsc::Sender<Message>,
}

impl PeerSession {
    /// Start the reader and writer tasks for an established connection.
    pub(crate) fn spawn(
        key: PeerKey,
        id: PeerId,
        addr: Option<SocketAddr>,
        peer_io: PeerIo,
        upstream: TorrentSender,
        queue_capacity: usize,
        keepalive_interval: Duration,
    ) -> Self {
        let (session, receiver) = Self::detached(key, id, addr, queue_capacity);
        let reader_handle = tokio::spawn(reader_task(
            upstream.clone(),
            session.shared.clone(),
            peer_io.reader,
        ))
        .abort_handle();
        tokio::spawn(writer_task(
            upstream,
            session.shared.clone(),
            receiver,
            peer_io.writer,
            keepalive_interval,
            reader_handle,
        ));
        session
    }

    /// A session without any tasks behind it. The receiver gets everything that is sent.
    pub(crate) fn detached(
        key: PeerKey,
        id: PeerId,
        addr: Option<SocketAddr>,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let shared = Arc::new(PeerShared {
            key,
            id,
            addr,
            state: Default::default(),
            closed: AtomicBool::new(false),
        });
        (Self { shared, sender }, receiver)
    }

    pub fn key(&self) -> PeerKey {
        self.shared.key
    }

    pub fn id(&self) -> PeerId {
        self.shared.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.shared.addr
    }

    /// Display name of the peer, its id with non printable bytes escaped.
    pub fn name(&self) -> String {
        self.shared.id.to_string()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    /// Queue a message without waiting.
    pub fn send(&self, message: Message) -> Result<(), SendError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.sender.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Whether the outbound queue has room for another message.
    pub fn has_capacity(&self) -> bool {
        self.sender.capacity() > 0
    }

    pub fn flags(&self) -> PeerFlags {
        self.read().flags
    }

    pub fn am_choking(&self) -> bool {
        self.read().flags.am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.read().flags.am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.read().flags.peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.read().flags.peer_interested
    }

    /// Send `Choke` or `Unchoke` and update the flag once the message is queued.
    pub fn set_am_choking(&self, choking: bool) -> Result<(), SendError> {
        let message = if choking {
            Message::Choke
        } else {
            Message::Unchoke
        };
        self.send(message)?;
        self.write().flags.am_choking = choking;
        Ok(())
    }

    /// Send `Interested` or `NotInterested` and update the flag once the message is queued.
    pub fn set_am_interested(&self, interested: bool) -> Result<(), SendError> {
        let message = if interested {
            Message::Interested
        } else {
            Message::NotInterested
        };
        self.send(message)?;
        self.write().flags.am_interested = interested;
        Ok(())
    }

    pub fn set_peer_choking(&self, choking: bool) {
        self.write().flags.peer_choking = choking;
    }

    pub fn set_peer_interested(&self, interested: bool) {
        self.write().flags.peer_interested = interested;
    }

    /// Whether the peer advertised the piece. False for indices past its bitfield.
    pub fn has_piece(&self, index: PieceIdx) -> bool {
        match &self.read().bitfield {
            Some(bitfield) => u32::from(index) < bitfield.len() && bitfield.has_piece(index),
            None => false,
        }
    }

    pub fn has_bitfield(&self) -> bool {
        self.read().bitfield.is_some()
    }

    pub fn with_bitfield<R>(&self, f: impl FnOnce(Option<&PieceBitfield>) -> R) -> R {
        f(self.read().bitfield.as_ref())
    }

    /// Replace the advertised bitfield, returning the previous one.
    pub fn set_bitfield(&self, bitfield: PieceBitfield) -> Option<PieceBitfield> {
        self.write().bitfield.replace(bitfield)
    }

    /// Record a `Have`. Returns true if the piece was not advertised before.
    pub fn mark_piece(&self, index: PieceIdx, pieces_count: u32) -> bool {
        let mut state = self.write();
        state
            .bitfield
            .get_or_insert_with(|| PieceBitfield::with_size(pieces_count))
            .set_piece(index)
    }

    fn read(&self) -> RwLockReadGuard<'_, PeerState> {
        self.shared.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PeerState> {
        self.shared.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

async fn reader_task(sender: TorrentSender, shared: Arc<PeerShared>, mut reader: PeerReader) {
    loop {
        match wire::read_message_async(&mut reader).await {
            Ok(Message::Unknown { id, length }) => {
                tracing::debug!(peer = %shared.id, id, length, "skipping unknown message");
            }
            Ok(message) => {
                tracing::trace!(peer = %shared.id, "received {message:?}");
                let _ = sender.send(TorrentMsg::PeerMessage {
                    peer_key: shared.key,
                    message,
                });
            }
            Err(error) => {
                shared.closed.store(true, Ordering::Release);
                let _ = sender.send(TorrentMsg::PeerFailure {
                    peer_key: shared.key,
                    error,
                });
                return;
            }
        }
    }
}

async fn writer_task(
    sender: TorrentSender,
    shared: Arc<PeerShared>,
    mut receiver: mpsc::Receiver<Message>,
    writer: PeerWriter,
    keepalive_interval: Duration,
    // aborted once the queue closes or a write fails
    reader_handle: AbortHandle,
) {
    let mut writer = BufWriter::new(writer);
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + keepalive_interval,
        keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut written = false;

    loop {
        let message = tokio::select! {
            message = receiver.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = keepalive.tick() => {
                if std::mem::take(&mut written) {
                    continue;
                }
                Message::KeepAlive
            }
        };

        let write_result = wire::write_message_async(&mut writer, &message).await;
        let flush_result = writer.flush().await.map_err(WireError::from);
        if let Err(error) = write_result.and(flush_result) {
            tracing::error!(peer = %shared.id, "failed to write message to peer: {error}");
            shared.closed.store(true, Ordering::Release);
            let _ = sender.send(TorrentMsg::PeerFailure {
                peer_key: shared.key,
                error,
            });
            break;
        }
        written = !matches!(message, Message::KeepAlive);
    }
    reader_handle.abort();
}

/// Outgoing side of the handshake: send ours, then expect theirs.
pub(crate) async fn initiate(
    peer_io: &mut PeerIo,
    info_hash: Sha1,
    peer_id: PeerId,
    timeout: Duration,
) -> Result<Handshake, WireError> {
    let exchange = async {
        wire::write_handshake_async(&mut peer_io.writer, &Handshake { info_hash, peer_id }).await?;
        let handshake = wire::read_handshake_async(&mut peer_io.reader).await?;
        check_info_hash(&handshake, info_hash)?;
        Ok::<_, WireError>(handshake)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| WireError::Timeout)?
}

/// Incoming side of the handshake: expect theirs, then reply with ours.
pub(crate) async fn respond(
    peer_io: &mut PeerIo,
    info_hash: Sha1,
    peer_id: PeerId,
    timeout: Duration,
) -> Result<Handshake, WireError> {
    let exchange = async {
        let handshake = wire::read_handshake_async(&mut peer_io.reader).await?;
        check_info_hash(&handshake, info_hash)?;
        wire::write_handshake_async(&mut peer_io.writer, &Handshake { info_hash, peer_id }).await?;
        Ok::<_, WireError>(handshake)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| WireError::Timeout)?
}

fn check_info_hash(handshake: &Handshake, info_hash: Sha1) -> Result<(), WireError> {
    if handshake.info_hash != info_hash {
        return Err(WireError::InfoHashMismatch(handshake.info_hash));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use slotmap::SlotMap;
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    fn key() -> PeerKey {
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        keys.insert(())
    }

    #[test]
    fn flags_change_only_after_queueing() {
        let (session, mut receiver) = PeerSession::detached(key(), PeerId::default(), None, 1);
        assert_eq!(session.flags(), PeerFlags::default());

        session.set_am_choking(false).unwrap();
        assert!(!session.am_choking());
        assert_eq!(session.set_am_interested(true), Err(SendError::Full));
        assert!(!session.am_interested());

        assert_eq!(receiver.try_recv().unwrap(), Message::Unchoke);
        session.set_am_interested(true).unwrap();
        assert!(session.am_interested());

        drop(receiver);
        assert_eq!(session.send(Message::KeepAlive), Err(SendError::Closed));
        assert!(session.is_closed());
    }

    #[test]
    fn bitfield_accessors() {
        let (session, _receiver) = PeerSession::detached(key(), PeerId::default(), None, 4);
        assert!(!session.has_bitfield());
        assert!(!session.has_piece(PieceIdx::new(0)));

        assert!(session.mark_piece(PieceIdx::new(2), 4));
        assert!(!session.mark_piece(PieceIdx::new(2), 4));
        assert!(session.has_piece(PieceIdx::new(2)));
        assert!(!session.has_piece(PieceIdx::new(9)));

        let previous = session.set_bitfield(PieceBitfield::with_size(4));
        assert_eq!(previous.map(|bf| bf.num_set()), Some(1));
        assert_eq!(session.with_bitfield(|bf| bf.map(|bf| bf.num_set())), Some(0));
    }

    #[tokio::test]
    async fn handshake_exchange() {
        let info_hash = Sha1::hash(b"torrent");
        let (a, b) = tokio::io::duplex(256);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut outgoing = PeerIo::new(ar, aw);
        let mut incoming = PeerIo::new(br, bw);
        let timeout = Duration::from_secs(5);

        let alice = PeerId::new(*b"-SB0100-aaaaaaaaaaaa");
        let bob = PeerId::new(*b"-SB0100-bbbbbbbbbbbb");
        let (initiated, responded) = tokio::join!(
            initiate(&mut outgoing, info_hash, alice, timeout),
            respond(&mut incoming, info_hash, bob, timeout),
        );
        assert_eq!(initiated.unwrap().peer_id, bob);
        assert_eq!(responded.unwrap().peer_id, alice);
    }

    #[tokio::test]
    async fn handshake_rejects_other_torrents() {
        let (a, b) = tokio::io::duplex(256);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut outgoing = PeerIo::new(ar, aw);
        let mut incoming = PeerIo::new(br, bw);
        let timeout = Duration::from_secs(5);

        let (initiated, responded) = tokio::join!(
            initiate(&mut outgoing, Sha1::hash(b"one"), PeerId::generate(), timeout),
            respond(&mut incoming, Sha1::hash(b"two"), PeerId::generate(), timeout),
        );
        assert!(matches!(responded, Err(WireError::InfoHashMismatch(_))));
        assert!(initiated.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_handshake_times_out() {
        let (a, _b) = tokio::io::duplex(256);
        let (ar, aw) = tokio::io::split(a);
        let mut peer_io = PeerIo::new(ar, aw);
        let result = initiate(
            &mut peer_io,
            Sha1::default(),
            PeerId::default(),
            Duration::from_secs(60),
        )
        .await;
        assert!(matches!(result, Err(WireError::Timeout)));
    }

    #[tokio::test]
    async fn session_forwards_messages_and_keeps_alive() {
        let (local, remote) = tokio::io::duplex(1024);
        let (lr, lw) = tokio::io::split(local);
        let (mut rr, mut rw) = tokio::io::split(remote);
        let (upstream, mut events) = unbounded_channel();
        let peer_key = key();

        let session = PeerSession::spawn(
            peer_key,
            PeerId::default(),
            None,
            PeerIo::new(lr, lw),
            upstream,
            8,
            Duration::from_millis(50),
        );

        session.send(Message::Interested).unwrap();
        assert_eq!(
            wire::read_message_async(&mut rr).await.unwrap(),
            Message::Interested
        );
        // idle connection gets a keep alive
        assert_eq!(
            wire::read_message_async(&mut rr).await.unwrap(),
            Message::KeepAlive
        );

        wire::write_message_async(&mut rw, &Message::Unknown { id: 99, length: 2 })
            .await
            .unwrap();
        wire::write_message_async(&mut rw, &Message::Have { index: PieceIdx::new(1) })
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            TorrentMsg::PeerMessage { peer_key: k, message } => {
                assert_eq!(k, peer_key);
                assert_eq!(message, Message::Have { index: PieceIdx::new(1) });
            }
            _ => panic!("expected a peer message"),
        }

        drop((rr, rw));
        match events.recv().await.unwrap() {
            TorrentMsg::PeerFailure { peer_key: k, .. } => assert_eq!(k, peer_key),
            _ => panic!("expected a peer failure"),
        }
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_suppresses_keep_alive() {
        let (local, remote) = tokio::io::duplex(1024);
        let (lr, lw) = tokio::io::split(local);
        let (mut rr, _rw) = tokio::io::split(remote);
        let (upstream, _events) = unbounded_channel();
        let session = PeerSession::spawn(
            key(),
            PeerId::default(),
            None,
            PeerIo::new(lr, lw),
            upstream,
            8,
            Duration::from_millis(200),
        );

        // one message every 20ms across several keep alive periods
        for index in 0..30 {
            let have = Message::Have {
                index: PieceIdx::new(index),
            };
            session.send(have.clone()).unwrap();
            assert_eq!(wire::read_message_async(&mut rr).await.unwrap(), have);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(
            wire::read_message_async(&mut rr).await.unwrap(),
            Message::KeepAlive
        );
    }
}
