use std::{net::SocketAddr, pin::Pin, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::AbortHandle,
};

use crate::{
    wire::{Handshake, Message, WireError},
    BasicPiecePicker, ChokePolicy, InterestedUnchoke, PeerId, PiecePicker, PieceStore, Sha1,
    TorrentInfo, TorrentView,
};

mod listener;
use listener::ListenerProc;

mod peer;
pub use peer::{PeerFlags, PeerSession, SendError};

mod torrent;
pub use torrent::TorrentConfig;
use torrent::TorrentState;

type TorrentSender = UnboundedSender<TorrentMsg>;
type TorrentReceiver = UnboundedReceiver<TorrentMsg>;

slotmap::new_key_type! {
    pub struct PeerKey;
}

type PeerReader = Pin<Box<dyn AsyncRead + Send + 'static>>;
type PeerWriter = Pin<Box<dyn AsyncWrite + Send + 'static>>;

struct PeerIo {
    reader: PeerReader,
    writer: PeerWriter,
}

impl PeerIo {
    fn new(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        }
    }
}

enum TorrentMsg {
    /// A connection completed the handshake and waits to be admitted
    PeerHandshake {
        handshake: Handshake,
        addr: Option<SocketAddr>,
        peer_io: PeerIo,
    },
    PeerMessage {
        peer_key: PeerKey,
        message: Message,
    },
    PeerFailure {
        peer_key: PeerKey,
        error: WireError,
    },
    Connect {
        address: String,
    },
    ConnectIo {
        peer_io: PeerIo,
        /// send our handshake first
        initiate: bool,
    },
    RequestTick,
    ChokeTick,
    View {
        response: oneshot::Sender<TorrentView>,
    },
    Shutdown,
}

/// Handle to a running torrent.
///
/// The torrent runs until the handle is dropped. Must be created from within a tokio runtime.
pub struct Torrent {
    sender: TorrentSender,
    info: TorrentInfo,
    listener: Option<ListenerProc>,
    task_handles: Vec<AbortHandle>,
}

impl Drop for Torrent {
    fn drop(&mut self) {
        for handle in self.task_handles.iter() {
            handle.abort();
        }
        let _ = self.sender.send(TorrentMsg::Shutdown);
    }
}

impl Torrent {
    /// Start a torrent with default configuration and its files under the current directory.
    pub fn new(info: TorrentInfo) -> Result<Self, crate::Error> {
        Self::new_with(info, Default::default())
    }

    /// Start a torrent whose files live under `config.root`.
    pub fn new_with(info: TorrentInfo, config: TorrentConfig) -> Result<Self, crate::Error> {
        let store = PieceStore::create(&info, &config.root)?;
        Self::with_store(info, store, config)
    }

    pub fn with_store(
        info: TorrentInfo,
        store: PieceStore,
        config: TorrentConfig,
    ) -> Result<Self, crate::Error> {
        let picker = BasicPiecePicker::new(info.clone(), config.pick_order)
            .with_max_active(config.max_active_pieces)
            .with_retry_timeout(config.retry_timeout);
        Self::with_policies(
            info,
            store,
            Box::new(picker),
            Box::new(InterestedUnchoke::default()),
            config,
        )
    }

    pub fn with_policies(
        info: TorrentInfo,
        store: PieceStore,
        picker: Box<dyn PiecePicker>,
        choker: Box<dyn ChokePolicy>,
        config: TorrentConfig,
    ) -> Result<Self, crate::Error> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let listener = match config.listen_addr {
            Some(addr) => Some(ListenerProc::bind(
                sender.clone(),
                addr,
                info.info_hash(),
                config.peer_id,
                config.handshake_timeout,
            )?),
            None => None,
        };

        let request_interval = config.request_interval;
        let state = TorrentState::new(
            info.clone(),
            config,
            store,
            picker,
            choker,
            sender.clone(),
        )?;
        let choke_interval = state.choke_interval();
        tokio::task::spawn_blocking(move || torrent_run(state, receiver));

        let task_handles = vec![
            spawn_ticker(sender.clone(), request_interval, || TorrentMsg::RequestTick),
            spawn_ticker(sender.clone(), choke_interval, || TorrentMsg::ChokeTick),
        ];

        Ok(Self {
            sender,
            info,
            listener,
            task_handles,
        })
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn info_hash(&self) -> Sha1 {
        self.info.info_hash()
    }

    /// Address the listener is bound to, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|listener| listener.local_addr())
    }

    /// Connect to a peer at `address`, `host:port` or `ip:port`.
    ///
    /// Failures are logged and otherwise ignored.
    pub fn connect(&self, address: &str) {
        self.send(TorrentMsg::Connect {
            address: address.to_string(),
        });
    }

    /// Connect to every address received on `addresses` until the channel closes.
    pub fn connect_from(&mut self, mut addresses: mpsc::Receiver<String>) {
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            while let Some(address) = addresses.recv().await {
                if sender.send(TorrentMsg::Connect { address }).is_err() {
                    break;
                }
            }
        })
        .abort_handle();
        self.task_handles.push(handle);
    }

    /// Run the protocol over an already established transport, sending our handshake first.
    pub fn connect_io(
        &self,
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) {
        self.send(TorrentMsg::ConnectIo {
            peer_io: PeerIo::new(reader, writer),
            initiate: true,
        });
    }

    /// Like [`Torrent::connect_io`] but waits for the remote handshake before replying.
    pub fn accept_io(
        &self,
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) {
        self.send(TorrentMsg::ConnectIo {
            peer_io: PeerIo::new(reader, writer),
            initiate: false,
        });
    }

    pub async fn view(&self) -> TorrentView {
        let (sender, receiver) = oneshot::channel();
        self.send(TorrentMsg::View { response: sender });
        receiver
            .await
            .expect("torrent loop should not exit while the handle is alive")
    }

    pub async fn completed(&self) -> bool {
        self.view().await.complete()
    }

    fn send(&self, message: TorrentMsg) {
        self.sender
            .send(message)
            .expect("torrent loop should not exit while the handle is alive")
    }
}

fn spawn_ticker(
    sender: TorrentSender,
    period: Duration,
    message: fn() -> TorrentMsg,
) -> AbortHandle {
    tokio::spawn(async move {
        while sender.send(message()).is_ok() {
            tokio::time::sleep(period).await;
        }
    })
    .abort_handle()
}

fn torrent_run(mut state: TorrentState, mut receiver: TorrentReceiver) {
    while let Some(msg) = receiver.blocking_recv() {
        let shutdown = torrent_process(&mut state, msg);
        if shutdown {
            break;
        }
    }
    tracing::debug!(info_hash = %state.info_hash(), "torrent loop stopped");
}

fn torrent_process(state: &mut TorrentState, msg: TorrentMsg) -> bool {
    match msg {
        TorrentMsg::PeerHandshake {
            handshake,
            addr,
            peer_io,
        } => state.on_peer_handshake(handshake, addr, peer_io),
        TorrentMsg::PeerMessage { peer_key, message } => state.on_peer_message(peer_key, message),
        TorrentMsg::PeerFailure { peer_key, error } => state.on_peer_failure(peer_key, error),
        TorrentMsg::Connect { address } => {
            tokio::spawn(connect(
                state.sender(),
                address,
                state.info_hash(),
                state.peer_id(),
                state.handshake_timeout(),
            ));
        }
        TorrentMsg::ConnectIo { peer_io, initiate } => {
            tokio::spawn(handshake_io(
                state.sender(),
                peer_io,
                initiate,
                state.info_hash(),
                state.peer_id(),
                state.handshake_timeout(),
            ));
        }
        TorrentMsg::RequestTick => state.request_tick(std::time::Instant::now()),
        TorrentMsg::ChokeTick => state.choke_tick(),
        TorrentMsg::View { response } => {
            let _ = response.send(state.view());
        }
        TorrentMsg::Shutdown => return true,
    }
    false
}

async fn connect(
    sender: TorrentSender,
    address: String,
    info_hash: Sha1,
    peer_id: PeerId,
    timeout: Duration,
) {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(address.as_str())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            tracing::debug!(address = %address, "failed to connect: {error}");
            return;
        }
        Err(_) => {
            tracing::debug!(address = %address, "timed out connecting");
            return;
        }
    };

    let addr = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut peer_io = PeerIo::new(reader, writer);
    match peer::initiate(&mut peer_io, info_hash, peer_id, timeout).await {
        Ok(handshake) => {
            let _ = sender.send(TorrentMsg::PeerHandshake {
                handshake,
                addr,
                peer_io,
            });
        }
        Err(error) => tracing::debug!(address = %address, "handshake failed: {error}"),
    }
}

async fn handshake_io(
    sender: TorrentSender,
    mut peer_io: PeerIo,
    initiate: bool,
    info_hash: Sha1,
    peer_id: PeerId,
    timeout: Duration,
) {
    let result = if initiate {
        peer::initiate(&mut peer_io, info_hash, peer_id, timeout).await
    } else {
        peer::respond(&mut peer_io, info_hash, peer_id, timeout).await
    };
    match result {
        Ok(handshake) => {
            let _ = sender.send(TorrentMsg::PeerHandshake {
                handshake,
                addr: None,
                peer_io,
            });
        }
        Err(error) => tracing::debug!("handshake failed: {error}"),
    }
}
