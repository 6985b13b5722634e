use std::{net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    task::AbortHandle,
};

use crate::{PeerId, Sha1};

use super::{peer, PeerIo, TorrentMsg, TorrentSender};

pub struct ListenerProc {
    handle: AbortHandle,
    local_addr: SocketAddr,
}

impl Drop for ListenerProc {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl ListenerProc {
    /// Bind right away so address errors reach the caller, then accept in the background.
    pub fn bind(
        sender: TorrentSender,
        addr: SocketAddr,
        info_hash: Sha1,
        peer_id: PeerId,
        handshake_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;
        tracing::info!("listening on {local_addr}");

        let handle = tokio::spawn(run(
            sender,
            listener,
            info_hash,
            peer_id,
            handshake_timeout,
        ))
        .abort_handle();
        Ok(Self { handle, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn run(
    sender: TorrentSender,
    listener: TcpListener,
    info_hash: Sha1,
    peer_id: PeerId,
    handshake_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(accept(
                    sender.clone(),
                    stream,
                    addr,
                    info_hash,
                    peer_id,
                    handshake_timeout,
                ));
            }
            Err(err) => {
                tracing::warn!("failed to accept connection: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept(
    sender: TorrentSender,
    stream: TcpStream,
    addr: SocketAddr,
    info_hash: Sha1,
    peer_id: PeerId,
    handshake_timeout: Duration,
) {
    let (reader, writer) = stream.into_split();
    let mut peer_io = PeerIo::new(reader, writer);
    match peer::respond(&mut peer_io, info_hash, peer_id, handshake_timeout).await {
        Ok(handshake) => {
            let _ = sender.send(TorrentMsg::PeerHandshake {
                handshake,
                addr: Some(addr),
                peer_io,
            });
        }
        Err(err) => tracing::debug!(addr = ?addr, "rejected incoming connection: {err}"),
    }
}
