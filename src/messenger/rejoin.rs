//! Two-phase admission of a host into the slot of a failed host.
//!
//! ```ascii
//! rejoining host        sponsor                   other live peers
//!   |--Request(Rejoin)-->|                              |
//!   |                    |--RejoinPrepare(slot, addr)-->|
//!   |<------------------ Mesh (connect + stage) --------|
//!   |                    |<------RejoinPrepareAck-------|
//!   |<--Accepted(roster)-|                              |
//!   |                    |--RejoinCommit--------------->|  (install staged connection)
//! ```
//!
//! If any peer does not acknowledge in time, the sponsor broadcasts `RejoinRollback` instead,
//!  every staged connection is closed, and the rejoining host is rejected. Membership is not
//!  changed on any host until the commit.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::join::join_messages::{JoinAcceptedData, JoinMessage, JoinRequestData, MeshData, RejectReason};
use crate::join::socket_joiner::{check_join_request, mesh_connect, reject, JoinError};
use crate::messaging::frame::{Frame, RejoinPrepareData};
use crate::messaging::site_id::HostId;
use crate::messenger::host_messenger::HostMessenger;
use crate::messenger::messenger_events::{HostRejoinedData, MessengerEvent};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JoiningNodeInfo {
    pub host_id: HostId,
    pub hostname: String,
}

/// Claims the sponsor role for the duration of one rejoin
struct SponsorGuard<'a>(&'a AtomicBool);

impl<'a> SponsorGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<SponsorGuard<'a>> {
        match flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Some(SponsorGuard(flag)),
            Err(_) => None,
        }
    }
}

impl Drop for SponsorGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HostMessenger {
    /// picks the slot for a rejoin request, or the reason to reject it
    fn check_rejoin_request(&self, request: &JoinRequestData) -> Result<HostId, RejectReason> {
        if let Some(reason) = check_join_request(&self.config, request) {
            return Err(reason);
        }

        let view = self.membership.snapshot();
        let Some(&slot) = view.failed_hosts().first() else {
            return Err(RejectReason::RejoinNotPermitted);
        };
        if view.live_host_at(request.listen_addr).is_some() {
            return Err(RejectReason::DuplicateAddress);
        }
        if self.membership.staged_host_id().is_some() {
            return Err(RejectReason::RejoinInProgress);
        }
        Ok(slot)
    }

    #[tracing::instrument(skip(self, stream, request), fields(addr = %request.listen_addr))]
    pub(super) async fn sponsor_rejoin(self: Arc<Self>, mut stream: TcpStream, peer_addr: SocketAddr, request: JoinRequestData) {
        let handshake_timeout = self.config.handshake_timeout;

        let Some(_guard) = SponsorGuard::acquire(&self.sponsoring_rejoin) else {
            error!("rejecting rejoin request from {}: another rejoin is in progress", peer_addr);
            reject(&mut stream, RejectReason::RejoinInProgress, handshake_timeout).await;
            return;
        };

        let host_id = match self.check_rejoin_request(&request) {
            Ok(host_id) => host_id,
            Err(reason) => {
                error!("rejecting rejoin request from {} (instance {:x}): {:?}", peer_addr, request.instance_id, reason);
                reject(&mut stream, reason, handshake_timeout).await;
                return;
            }
        };
        info!("sponsoring rejoin of {} into slot {:?}", request.listen_addr, host_id);

        if !self.prepare_peers(host_id, request.listen_addr).await {
            warn!("rejoin of {:?} could not be prepared on all hosts - rolling back", host_id);
            self.broadcast_control(&Frame::RejoinRollback(host_id)).await;
            reject(&mut stream, RejectReason::RejoinPrepareFailed, handshake_timeout).await;
            return;
        }

        let mut roster = self.membership.snapshot().roster();
        for entry in roster.iter_mut().filter(|e| e.host_id == host_id) {
            entry.listen_addr = request.listen_addr;
        }
        let accepted = JoinMessage::Accepted(JoinAcceptedData {
            assigned_host_id: host_id,
            sponsor_host_id: self.host_id,
            roster,
        });
        if !matches!(timeout(handshake_timeout, accepted.write_to(&mut stream)).await, Ok(Ok(()))) {
            warn!("could not send admission to rejoining host {:?} - rolling back", host_id);
            self.broadcast_control(&Frame::RejoinRollback(host_id)).await;
            return;
        }

        let host = match self.start_foreign_host(host_id, request.listen_addr, stream) {
            Ok(host) => host,
            Err(e) => {
                warn!("could not set up connection to rejoining host {:?}: {} - rolling back", host_id, e);
                self.broadcast_control(&Frame::RejoinRollback(host_id)).await;
                return;
            }
        };
        if let Some(previous) = self.membership.install(host) {
            previous.abort();
        }

        let failed = self.broadcast_control(&Frame::RejoinCommit(host_id)).await;
        if !failed.is_empty() {
            warn!("could not send rejoin commit to {:?}", failed);
        }

        info!("host {:?} rejoined at {}", host_id, request.listen_addr);
        self.events.send_event(MessengerEvent::HostRejoined(HostRejoinedData {
            host_id,
            listen_addr: request.listen_addr,
        }));
    }

    /// asks all live peers to stage a connection to the rejoining host, returning `true` if all of
    ///  them acknowledged in time
    async fn prepare_peers(&self, host_id: HostId, addr: SocketAddr) -> bool {
        let peers: BTreeSet<HostId> = self.membership.snapshot()
            .foreign_hosts()
            .map(|h| h.host_id())
            .collect();
        if peers.is_empty() {
            return true;
        }

        let (ack_send, mut acks) = mpsc::unbounded_channel();
        *self.prepare_acks.lock().expect("lock poisoned") = Some(ack_send);

        let unreachable = self.broadcast_control(&Frame::RejoinPrepare(RejoinPrepareData { host_id, addr })).await;
        let mut pending: BTreeSet<HostId> = peers.difference(&unreachable.into_iter().collect()).copied().collect();
        let all_sent = pending.len() == peers.len();

        let deadline = Instant::now() + self.config.rejoin_prepare_timeout;
        let mut all_prepared = all_sent;
        while all_prepared && !pending.is_empty() {
            match timeout_at(deadline, acks.recv()).await {
                Ok(Some((from, ack))) if ack.host_id == host_id => {
                    if !ack.accepted {
                        warn!("host {:?} refused to prepare the rejoin of {:?}", from, host_id);
                        all_prepared = false;
                    }
                    pending.remove(&from);
                }
                Ok(Some((from, ack))) => debug!("ignoring stale acknowledgement from {:?}: {:?}", from, ack),
                _ => {
                    warn!("hosts {:?} did not acknowledge the rejoin of {:?} in time", pending, host_id);
                    all_prepared = false;
                }
            }
        }

        self.prepare_acks.lock().expect("lock poisoned").take();
        all_prepared
    }

    /// Connects to a rejoining host on behalf of a sponsor, and stages the connection without
    ///  making it visible to routing
    pub async fn prepare_rejoin(&self, host_id: HostId, addr: SocketAddr) -> Result<(), JoinError> {
        if !self.membership.snapshot().is_failed(host_id) {
            return Err(JoinError::Rejected(RejectReason::RejoinNotPermitted));
        }
        if self.membership.staged_host_id().is_some() {
            return Err(JoinError::Rejected(RejectReason::RejoinInProgress));
        }

        let mesh = MeshData {
            from_host_id: self.host_id,
            from_listen_addr: self.listen_addr,
            target_host_id: host_id,
            fingerprint: self.config.fingerprint,
        };
        let stream = mesh_connect(addr, mesh, self.config.handshake_timeout).await?;
        let host = self.start_foreign_host(host_id, addr, stream)?;

        if let Err(host) = self.membership.stage(host) {
            host.close();
            return Err(JoinError::Rejected(RejectReason::RejoinInProgress));
        }
        debug!("prepared rejoin of {:?} at {}", host_id, addr);
        Ok(())
    }

    /// Makes a staged rejoining host live. Returns `None` if it was not staged, e.g. because its
    ///  connection was lost in the meantime.
    pub fn commit_rejoin(&self, host_id: HostId) -> Option<JoiningNodeInfo> {
        let host = self.membership.take_staged(host_id)?;
        let info = JoiningNodeInfo {
            host_id,
            hostname: host.listen_addr().ip().to_string(),
        };
        let listen_addr = host.listen_addr();

        if let Some(previous) = self.membership.install(host) {
            previous.abort();
        }
        info!("host {:?} rejoined at {}", host_id, listen_addr);
        self.events.send_event(MessengerEvent::HostRejoined(HostRejoinedData {
            host_id,
            listen_addr,
        }));
        Some(info)
    }

    /// Discards a staged rejoining host; returns `false` if it was not staged
    pub fn rollback_rejoin(&self, host_id: HostId) -> bool {
        match self.membership.take_staged(host_id) {
            Some(host) => {
                info!("rolling back rejoin of {:?}", host);
                host.close();
                true
            }
            None => false,
        }
    }
}
