use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

use crate::messaging::message_sender::SendError;
use crate::messaging::site_id::HostId;
use crate::network::connection::{Connection, ConnectionId};

/// The local proxy of a live peer host. `listen_addr` is the address the peer accepts mesh
///  connections on, which identifies it in the roster; the connection's remote address may be
///  an ephemeral port.
pub struct ForeignHost {
    host_id: HostId,
    listen_addr: SocketAddr,
    connection: Arc<Connection>,
}

impl Debug for ForeignHost {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignHost({:?}@{})", self.host_id, self.listen_addr)
    }
}

impl ForeignHost {
    pub fn new(host_id: HostId, listen_addr: SocketAddr, connection: Arc<Connection>) -> Arc<ForeignHost> {
        Arc::new(ForeignHost {
            host_id,
            listen_addr,
            connection,
        })
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn is_alive(&self) -> bool {
        self.connection.is_open()
    }

    pub fn last_heard(&self) -> Instant {
        self.connection.last_received()
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), SendError> {
        self.connection.queue_for_send(frame).await
    }

    pub fn try_send(&self, frame: Bytes) -> Result<bool, SendError> {
        self.connection.try_queue_for_send(frame)
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub fn kill(&self) {
        self.connection.kill();
    }

    pub fn abort(&self) {
        self.connection.abort();
    }
}
