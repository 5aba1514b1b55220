use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use crate::join::join_messages::JoinMessage;

/// A fresh inbound connection together with the first handshake message it sent
pub struct InboundHandshake {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub message: JoinMessage,
}

/// Accepts connections on a host's listen address. Each connection's first handshake message is
///  read in a task of its own with a timeout, so a hung peer can not stall the accept loop.
pub struct Acceptor {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Acceptor {
    pub fn start(listener: TcpListener, handshake_timeout: Duration) -> anyhow::Result<(Acceptor, mpsc::Receiver<InboundHandshake>)> {
        let local_addr = listener.local_addr()?;
        let (send, recv) = mpsc::channel(64);

        info!("listening for peer connections on {}", local_addr);
        let handle = tokio::spawn(
            accept_loop(listener, handshake_timeout, send)
                .instrument(tracing::info_span!("acceptor", addr = %local_addr))
        );

        Ok((Acceptor { local_addr, handle }, recv))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, handshake_timeout: Duration, handshakes: mpsc::Sender<InboundHandshake>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!("error accepting connection: {}", e);
                // e.g. out of file descriptors: back off instead of spinning
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        trace!("accepted connection from {}", peer_addr);

        if handshakes.is_closed() {
            debug!("handshakes are no longer processed - stopping acceptor");
            return;
        }

        let handshakes = handshakes.clone();
        tokio::spawn(async move {
            read_first_message(stream, peer_addr, handshake_timeout, handshakes).await;
        }.in_current_span());
    }
}

async fn read_first_message(mut stream: TcpStream, peer_addr: SocketAddr, handshake_timeout: Duration, handshakes: mpsc::Sender<InboundHandshake>) {
    match tokio::time::timeout(handshake_timeout, JoinMessage::read_from(&mut stream)).await {
        Ok(Ok(message)) => {
            debug!("handshake from {}: {:?}", peer_addr, message);
            let handshake = InboundHandshake {
                stream,
                peer_addr,
                message,
            };
            if handshakes.send(handshake).await.is_err() {
                debug!("dropping handshake from {}: no longer processed", peer_addr);
            }
        }
        Ok(Err(e)) => warn!("invalid handshake from {}: {}", peer_addr, e),
        Err(_) => warn!("handshake from {} timed out", peer_addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::site_id::HostId;
    use tokio::io::AsyncWriteExt;

    async fn acceptor() -> (Acceptor, mpsc::Receiver<InboundHandshake>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Acceptor::start(listener, Duration::from_millis(200)).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_first_message() {
        let (acceptor, mut handshakes) = acceptor().await;

        let mut stream = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        JoinMessage::MeshAck(HostId(4)).write_to(&mut stream).await.unwrap();

        let handshake = handshakes.recv().await.unwrap();
        assert_eq!(handshake.message, JoinMessage::MeshAck(HostId(4)));
        assert_eq!(handshake.peer_addr, stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_hung_peer_does_not_block() {
        let (acceptor, mut handshakes) = acceptor().await;

        let _silent = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        let mut garbage = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        garbage.write_all(b"\x02\0\0\0\x63\x63").await.unwrap();

        let mut stream = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        JoinMessage::MeshAck(HostId(1)).write_to(&mut stream).await.unwrap();

        let handshake = tokio::time::timeout(Duration::from_secs(5), handshakes.recv()).await.unwrap().unwrap();
        assert_eq!(handshake.message, JoinMessage::MeshAck(HostId(1)));

        // neither the silent nor the garbage connection produce a handshake
        assert!(tokio::time::timeout(Duration::from_millis(500), handshakes.recv()).await.is_err());
    }
}
