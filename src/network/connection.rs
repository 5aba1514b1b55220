use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn, Instrument};

use crate::messaging::codec::{FrameAssembler, WireCodec};
use crate::messaging::frame::Frame;
use crate::messaging::message_sender::SendError;
use crate::messaging::site_id::HostId;

/// Distinguishes successive connections to the same host, e.g. before and after a rejoin, so
///  that a loss notification for a stale connection does not affect its successor.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new_random() -> ConnectionId {
        ConnectionId(rand::random())
    }
}

/// Receives everything that arrives over peer connections. The callbacks are invoked from the
///  connection's reader task and must not block.
#[cfg_attr(test, automock)]
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, from: HostId, connection_id: ConnectionId, frame: Frame);

    /// called exactly once per connection that was not closed locally, on remote close, I/O
    ///  error or protocol desync
    fn on_connection_lost(&self, host_id: HostId, connection_id: ConnectionId);
}

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    /// number of frames; senders wait when a peer's queue is full
    pub outbound_queue_capacity: usize,
    pub socket_buffer_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            outbound_queue_capacity: 1024,
            socket_buffer_size: 2*1024*1024,
        }
    }
}

struct SharedState {
    id: ConnectionId,
    host_id: HostId,
    open: AtomicBool,
    loss_reported: AtomicBool,
    last_received: Mutex<Instant>,
    /// wakes the writer task when the reader detected a dead connection
    lost: Notify,
    handler: Arc<dyn FrameHandler>,
}

impl SharedState {
    fn on_lost(&self) {
        self.open.store(false, Ordering::Release);
        self.lost.notify_one();
        if !self.loss_reported.swap(true, Ordering::AcqRel) {
            self.handler.on_connection_lost(self.host_id, self.id);
        }
    }

    fn touch(&self) {
        *self.last_received.lock().expect("lock poisoned") = Instant::now();
    }
}

/// An established, handshaken TCP connection to a peer host. A reader task reassembles and
///  decodes incoming frames, a writer task drains the outbound queue; both run on the shared
///  tokio runtime.
pub struct Connection {
    peer_addr: SocketAddr,
    state: Arc<SharedState>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection({:?}@{}, {:?})", self.state.host_id, self.peer_addr, self.state.id)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // the writer task terminates on its own once the outbound queue is dropped
        self.reader.abort();
    }
}

impl Connection {
    pub fn start(
        stream: TcpStream,
        host_id: HostId,
        settings: &ConnectionSettings,
        codec: Arc<WireCodec>,
        handler: Arc<dyn FrameHandler>,
    ) -> anyhow::Result<Arc<Connection>> {
        let peer_addr = stream.peer_addr()?;
        configure_socket(&stream, settings);

        let state = Arc::new(SharedState {
            id: ConnectionId::new_random(),
            host_id,
            open: AtomicBool::new(true),
            loss_reported: AtomicBool::new(false),
            last_received: Mutex::new(Instant::now()),
            lost: Notify::new(),
            handler,
        });

        let (read_half, write_half) = stream.into_split();
        let (send, recv) = mpsc::channel(settings.outbound_queue_capacity);

        let span = tracing::info_span!("connection", peer = ?host_id, addr = %peer_addr);
        let reader = tokio::spawn(read_loop(read_half, state.clone(), codec).instrument(span.clone()));
        let writer = tokio::spawn(write_loop(write_half, recv, state.clone()).instrument(span));

        debug!("started connection {:?} to {:?} at {}", state.id, host_id, peer_addr);
        Ok(Arc::new(Connection {
            peer_addr,
            state,
            outbound: Mutex::new(Some(send)),
            reader,
            writer,
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    pub fn host_id(&self) -> HostId {
        self.state.host_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    pub fn last_received(&self) -> Instant {
        *self.state.last_received.lock().expect("lock poisoned")
    }

    fn sender(&self) -> Result<mpsc::Sender<Bytes>, SendError> {
        if !self.is_open() {
            return Err(SendError::ConnectionClosed(self.state.host_id));
        }
        self.outbound.lock().expect("lock poisoned")
            .clone()
            .ok_or(SendError::ConnectionClosed(self.state.host_id))
    }

    /// Queues an encoded frame. This waits while the peer's outbound queue is full, which is
    ///  how backpressure reaches the sending task.
    pub async fn queue_for_send(&self, frame: Bytes) -> Result<(), SendError> {
        let sender = self.sender()?;
        sender.send(frame).await
            .map_err(|_| SendError::ConnectionClosed(self.state.host_id))
    }

    /// Queues a frame if there is room, returning `false` if the queue is full
    pub fn try_queue_for_send(&self, frame: Bytes) -> Result<bool, SendError> {
        let sender = self.sender()?;
        match sender.try_send(frame) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(SendError::ConnectionClosed(self.state.host_id)),
        }
    }

    /// Graceful local close: frames queued so far are flushed, then the socket is shut down.
    ///  No loss notification is emitted.
    pub fn close(&self) {
        debug!("closing {:?}", self);
        self.state.loss_reported.store(true, Ordering::Release);
        self.state.open.store(false, Ordering::Release);
        self.outbound.lock().expect("lock poisoned").take();
    }

    /// Forcibly terminates the connection without flushing, and reports it as lost
    pub fn kill(&self) {
        warn!("killing {:?}", self);
        self.reader.abort();
        self.writer.abort();
        self.outbound.lock().expect("lock poisoned").take();
        self.state.on_lost();
    }

    /// stops both tasks immediately without reporting the connection as lost
    pub fn abort(&self) {
        self.state.loss_reported.store(true, Ordering::Release);
        self.state.open.store(false, Ordering::Release);
        self.reader.abort();
        self.writer.abort();
    }
}

fn configure_socket(stream: &TcpStream, settings: &ConnectionSettings) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("could not set TCP_NODELAY: {}", e);
    }

    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_send_buffer_size(settings.socket_buffer_size) {
        warn!("could not set send buffer size to {}: {}", settings.socket_buffer_size, e);
    }
    if let Err(e) = sock.set_recv_buffer_size(settings.socket_buffer_size) {
        warn!("could not set receive buffer size to {}: {}", settings.socket_buffer_size, e);
    }
}

async fn read_loop(mut stream: OwnedReadHalf, state: Arc<SharedState>, codec: Arc<WireCodec>) {
    let mut assembler = FrameAssembler::new();

    'read: loop {
        match stream.read_buf(assembler.read_buf()).await {
            Ok(0) => {
                debug!("connection closed by peer");
                break;
            }
            Ok(n) => {
                trace!("read {} bytes", n);
                state.touch();
            }
            Err(e) => {
                warn!("error reading from peer: {}", e);
                break;
            }
        }

        loop {
            match assembler.next_frame() {
                Ok(Some(raw)) => match codec.decode(raw) {
                    Ok(frame) => state.handler.on_frame(state.host_id, state.id, frame),
                    Err(e) => {
                        error!("closing connection: {}", e);
                        break 'read;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    error!("closing connection: {}", e);
                    break 'read;
                }
            }
        }
    }

    state.on_lost();
}

async fn write_loop(stream: OwnedWriteHalf, mut outbound: mpsc::Receiver<Bytes>, state: Arc<SharedState>) {
    let mut stream = BufWriter::with_capacity(64*1024, stream);

    match write_all_queued(&mut stream, &mut outbound, &state).await {
        Ok(()) => {
            debug!("outbound queue closed or connection lost - shutting down socket");
            if let Err(e) = stream.shutdown().await {
                debug!("error shutting down socket: {}", e);
            }
        }
        Err(e) => {
            warn!("error writing to peer: {}", e);
            state.on_lost();
        }
    }
}

async fn write_all_queued(stream: &mut BufWriter<OwnedWriteHalf>, outbound: &mut mpsc::Receiver<Bytes>, state: &SharedState) -> anyhow::Result<()> {
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => frame,
            _ = state.lost.notified() => None,
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        stream.write_all(&frame).await?;
        // batch whatever else is queued into the same flush
        while let Ok(frame) = outbound.try_recv() {
            stream.write_all(&frame).await?;
        }
        stream.flush().await?;
    }
}
