use std::collections::BTreeMap;
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::join::acceptor::{Acceptor, InboundHandshake};
use crate::join::fingerprint::ConfigFingerprint;
use crate::join::join_messages::{JoinAcceptedData, JoinKind, JoinMessage, JoinRequestData, MeshData, RejectReason, RosterEntry, PROTOCOL_VERSION};
use crate::messaging::site_id::HostId;
use crate::messenger::messenger_config::MessengerConfig;

/// ```ascii
/// Discovering -> Negotiating -> Admitted
///                            \-> Rejected           (terminal)
///                            \-> ProtocolViolation  (terminal)
///                            \-> FailedSocket       (transient)
/// ```
///
/// The state machine never retries by itself, that is the caller's policy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JoinState {
    Discovering,
    Negotiating,
    Admitted(HostId),
    Rejected(RejectReason),
    /// the remote side broke the handshake protocol, e.g. a peer of an incompatible build
    ProtocolViolation,
    FailedSocket,
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join rejected: {0:?}")]
    Rejected(RejectReason),
    #[error("socket failure during join: {0}")]
    FailedSocket(#[from] io::Error),
    #[error("join timed out")]
    TimedOut,
    #[error("join protocol violation: {0}")]
    Protocol(String),
}

impl JoinError {
    pub fn is_retryable(&self) -> bool {
        match self {
            JoinError::Rejected(reason) => reason.is_retryable(),
            JoinError::FailedSocket(_) => true,
            JoinError::TimedOut => true,
            JoinError::Protocol(_) => false,
        }
    }
}

impl From<anyhow::Error> for JoinError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<io::Error>() {
            Ok(e) => JoinError::FailedSocket(e),
            Err(e) => JoinError::Protocol(e.to_string()),
        }
    }
}

/// A handshaken connection to a peer, ready to be turned into a peer connection
pub struct PeerStream {
    pub host_id: HostId,
    pub listen_addr: SocketAddr,
    pub stream: TcpStream,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupJoinInfo {
    pub host_id: HostId,
    pub roster: Vec<RosterEntry>,
    /// admitted hosts that this host could not connect to; they are treated as failed
    pub unreachable_hosts: Vec<HostId>,
}

pub struct JoinedGroup {
    pub info: GroupJoinInfo,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerStream>,
    pub acceptor: Acceptor,
    /// handshakes arriving after the join, e.g. rejoin requests
    pub inbound: mpsc::Receiver<InboundHandshake>,
}

/// Checks the parts of a join request that do not depend on the cluster's current membership
pub fn check_join_request(config: &MessengerConfig, request: &JoinRequestData) -> Option<RejectReason> {
    if request.protocol_version != PROTOCOL_VERSION {
        return Some(RejectReason::VersionMismatch);
    }
    if let Some(reason) = RejectReason::check_fingerprint(&config.fingerprint, &request.fingerprint) {
        return Some(reason);
    }
    if request.expected_hosts as usize != config.expected_hosts {
        return Some(RejectReason::TopologyMismatch);
    }
    None
}

/// answers a handshake with a rejection, ignoring errors: the connection is dropped either way
pub async fn reject(stream: &mut TcpStream, reason: RejectReason, handshake_timeout: Duration) {
    if let Err(e) = timeout(handshake_timeout, JoinMessage::Rejected(reason).write_to(stream)).await {
        debug!("error sending rejection: {}", e);
    }
}

/// Connects to a peer's listen address and performs the mesh handshake
pub async fn mesh_connect(addr: SocketAddr, mesh: MeshData, handshake_timeout: Duration) -> Result<TcpStream, JoinError> {
    let target_host_id = mesh.target_host_id;
    let mut stream = timeout(handshake_timeout, TcpStream::connect(addr)).await
        .map_err(|_| JoinError::TimedOut)??;

    timeout(handshake_timeout, JoinMessage::Mesh(mesh).write_to(&mut stream)).await
        .map_err(|_| JoinError::TimedOut)??;

    let reply = timeout(handshake_timeout, JoinMessage::read_from(&mut stream)).await
        .map_err(|_| JoinError::TimedOut)??;

    match reply {
        JoinMessage::MeshAck(host_id) if host_id == target_host_id => Ok(stream),
        JoinMessage::Rejected(reason) => Err(JoinError::Rejected(reason)),
        other => Err(JoinError::Protocol(format!("unexpected reply to mesh handshake: {:?}", other))),
    }
}

/// Checks an inbound mesh handshake; `expected_target` is `None` while the own host id is not
///  known yet
pub fn check_mesh(fingerprint: &ConfigFingerprint, mesh: &MeshData, expected_target: Option<HostId>) -> Option<RejectReason> {
    if let Some(reason) = RejectReason::check_fingerprint(fingerprint, &mesh.fingerprint) {
        return Some(reason);
    }
    match expected_target {
        Some(target) if target != mesh.target_host_id => Some(RejectReason::TopologyMismatch),
        _ => None,
    }
}

/// Establishes this host's membership: forming a new cluster as its leader, joining a cluster
///  that is being formed, or taking over a failed host's slot in a running cluster.
pub struct SocketJoiner {
    config: Arc<MessengerConfig>,
    state: watch::Sender<JoinState>,
}

impl SocketJoiner {
    pub fn new(config: Arc<MessengerConfig>) -> SocketJoiner {
        let (state, _) = watch::channel(JoinState::Discovering);
        SocketJoiner {
            config,
            state,
        }
    }

    pub fn state(&self) -> JoinState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JoinState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: JoinState) {
        debug!("join state: {:?}", state);
        self.state.send_replace(state);
    }

    /// a single join attempt
    #[tracing::instrument(skip(self), fields(coordinator = %self.config.coordinator_addr))]
    pub async fn join(&self) -> Result<JoinedGroup, JoinError> {
        self.set_state(JoinState::Discovering);

        let result = match self.config.rejoin_sponsor {
            Some(sponsor) => self.rejoin(sponsor).await,
            None => match TcpListener::bind(self.config.coordinator_addr).await {
                Ok(listener) => self.lead(listener).await,
                Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable) => {
                    debug!("coordinator address is taken: joining as a regular host");
                    self.join_leader().await
                }
                Err(e) => Err(JoinError::FailedSocket(e)),
            }
        };

        match &result {
            Ok(joined) => self.set_state(JoinState::Admitted(joined.info.host_id)),
            Err(JoinError::Rejected(reason)) => self.set_state(JoinState::Rejected(*reason)),
            Err(e @ JoinError::Protocol(_)) => {
                error!("join attempt failed: {}", e);
                self.set_state(JoinState::ProtocolViolation);
            }
            Err(e) => {
                warn!("join attempt failed: {}", e);
                self.set_state(JoinState::FailedSocket);
            }
        }
        result
    }

    fn request(&self, listen_addr: SocketAddr, kind: JoinKind) -> JoinMessage {
        JoinMessage::Request(JoinRequestData {
            protocol_version: PROTOCOL_VERSION,
            fingerprint: self.config.fingerprint,
            expected_hosts: self.config.expected_hosts as u32,
            listen_addr,
            instance_id: rand::random(),
            kind,
        })
    }

    async fn lead(&self, listener: TcpListener) -> Result<JoinedGroup, JoinError> {
        let listen_addr = listener.local_addr()?;
        info!("bound coordinator address {}: leading formation of a cluster with {} hosts", listen_addr, self.config.expected_hosts);

        let (acceptor, mut inbound) = Acceptor::start(listener, self.config.handshake_timeout)?;
        self.set_state(JoinState::Negotiating);

        let mut roster = vec![RosterEntry { host_id: HostId::LEADER, listen_addr }];
        let mut admitted = Vec::new();
        let deadline = Instant::now() + self.config.join_timeout;

        while roster.len() < self.config.expected_hosts {
            let InboundHandshake { mut stream, peer_addr, message } = match timeout_at(deadline, inbound.recv()).await {
                Ok(Some(handshake)) => handshake,
                Ok(None) => return Err(JoinError::Protocol("acceptor terminated".to_string())),
                Err(_) => {
                    warn!("only {} of {} hosts joined before the timeout", roster.len(), self.config.expected_hosts);
                    return Err(JoinError::TimedOut);
                }
            };

            let JoinMessage::Request(request) = message else {
                warn!("unexpected handshake from {} during cluster formation: {:?}", peer_addr, message);
                reject(&mut stream, RejectReason::RejoinInProgress, self.config.handshake_timeout).await;
                continue;
            };

            let reason = check_join_request(&self.config, &request)
                .or_else(|| (request.kind != JoinKind::Initial).then_some(RejectReason::RejoinNotPermitted))
                .or_else(|| roster.iter().any(|e| e.listen_addr == request.listen_addr).then_some(RejectReason::DuplicateAddress));
            if let Some(reason) = reason {
                error!("rejecting join request from {} (instance {:x}): {:?}", peer_addr, request.instance_id, reason);
                reject(&mut stream, reason, self.config.handshake_timeout).await;
                continue;
            }

            let entry = RosterEntry {
                host_id: HostId(roster.len() as u32),
                listen_addr: request.listen_addr,
            };
            info!("admitting {} as host {:?}", request.listen_addr, entry.host_id);
            roster.push(entry);
            admitted.push((entry, stream));
        }

        let mut peers = Vec::new();
        let mut unreachable_hosts = Vec::new();
        for (entry, mut stream) in admitted {
            let accepted = JoinMessage::Accepted(JoinAcceptedData {
                assigned_host_id: entry.host_id,
                sponsor_host_id: HostId::LEADER,
                roster: roster.clone(),
            });
            match timeout(self.config.handshake_timeout, accepted.write_to(&mut stream)).await {
                Ok(Ok(())) => peers.push(PeerStream {
                    host_id: entry.host_id,
                    listen_addr: entry.listen_addr,
                    stream,
                }),
                Ok(Err(e)) => {
                    warn!("could not send admission to host {:?}: {}", entry.host_id, e);
                    unreachable_hosts.push(entry.host_id);
                }
                Err(_) => {
                    warn!("timeout sending admission to host {:?}", entry.host_id);
                    unreachable_hosts.push(entry.host_id);
                }
            }
        }

        Ok(JoinedGroup {
            info: GroupJoinInfo {
                host_id: HostId::LEADER,
                roster,
                unreachable_hosts,
            },
            listen_addr,
            peers,
            acceptor,
            inbound,
        })
    }

    /// binds the listener for peer connections, and connects to the coordinator or sponsor
    async fn bind_and_connect(&self, remote: SocketAddr) -> Result<(Acceptor, mpsc::Receiver<InboundHandshake>, SocketAddr, TcpStream), JoinError> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let bound_addr = listener.local_addr()?;

        let stream = timeout(self.config.handshake_timeout, TcpStream::connect(remote)).await
            .map_err(|_| JoinError::TimedOut)??;

        let advertised_ip = if bound_addr.ip().is_unspecified() {
            stream.local_addr()?.ip()
        }
        else {
            bound_addr.ip()
        };
        let listen_addr = SocketAddr::new(advertised_ip, bound_addr.port());

        let (acceptor, inbound) = Acceptor::start(listener, self.config.handshake_timeout)?;
        Ok((acceptor, inbound, listen_addr, stream))
    }

    async fn join_leader(&self) -> Result<JoinedGroup, JoinError> {
        let coordinator_addr = self.config.coordinator_addr;
        let (acceptor, mut inbound, listen_addr, mut stream) = self.bind_and_connect(coordinator_addr).await?;
        self.set_state(JoinState::Negotiating);

        timeout(self.config.handshake_timeout, self.request(listen_addr, JoinKind::Initial).write_to(&mut stream)).await
            .map_err(|_| JoinError::TimedOut)??;

        // the leader answers once all expected hosts are there
        let reply = timeout(self.config.join_timeout, JoinMessage::read_from(&mut stream)).await
            .map_err(|_| JoinError::TimedOut)??;
        let accepted = self.check_reply(reply, coordinator_addr, listen_addr)?;
        let host_id = accepted.assigned_host_id;
        info!("admitted to the cluster as host {:?}", host_id);

        let mut peers = vec![PeerStream {
            host_id: HostId::LEADER,
            listen_addr: coordinator_addr,
            stream,
        }];
        let mut unreachable_hosts = Vec::new();

        // mesh: connect to lower host ids, wait for connections from higher host ids
        for entry in accepted.roster.iter().filter(|e| e.host_id != HostId::LEADER && e.host_id < host_id) {
            let mesh = MeshData {
                from_host_id: host_id,
                from_listen_addr: listen_addr,
                target_host_id: entry.host_id,
                fingerprint: self.config.fingerprint,
            };
            match mesh_connect(entry.listen_addr, mesh, self.config.handshake_timeout).await {
                Ok(stream) => peers.push(PeerStream {
                    host_id: entry.host_id,
                    listen_addr: entry.listen_addr,
                    stream,
                }),
                Err(JoinError::Rejected(reason)) => {
                    error!("host {:?} rejected the mesh connection: {:?}", entry.host_id, reason);
                    return Err(JoinError::Rejected(reason));
                }
                Err(e) => {
                    warn!("could not connect to host {:?} at {}: {}", entry.host_id, entry.listen_addr, e);
                    unreachable_hosts.push(entry.host_id);
                }
            }
        }

        let mut expected_inbound: BTreeMap<HostId, SocketAddr> = accepted.roster.iter()
            .filter(|e| e.host_id > host_id)
            .map(|e| (e.host_id, e.listen_addr))
            .collect();
        let deadline = Instant::now() + self.config.handshake_timeout * (accepted.roster.len() as u32);
        peers.extend(self.await_meshes(&mut inbound, &mut expected_inbound, Some(host_id), deadline).await);
        unreachable_hosts.extend(expected_inbound.keys());

        Ok(JoinedGroup {
            info: GroupJoinInfo {
                host_id,
                roster: accepted.roster,
                unreachable_hosts,
            },
            listen_addr,
            peers,
            acceptor,
            inbound,
        })
    }

    fn check_reply(&self, reply: JoinMessage, remote: SocketAddr, listen_addr: SocketAddr) -> Result<JoinAcceptedData, JoinError> {
        match reply {
            JoinMessage::Accepted(accepted) => {
                let own_entry = RosterEntry {
                    host_id: accepted.assigned_host_id,
                    listen_addr,
                };
                if !accepted.roster.contains(&own_entry) {
                    return Err(JoinError::Protocol(format!("roster {:?} does not contain {:?}", accepted.roster, own_entry)));
                }
                Ok(accepted)
            }
            JoinMessage::Rejected(reason) => {
                error!("join was rejected by {}: {:?}", remote, reason);
                Err(JoinError::Rejected(reason))
            }
            other => Err(JoinError::Protocol(format!("unexpected reply to join request: {:?}", other))),
        }
    }

    /// Collects inbound mesh connections from the expected hosts until all are there or the
    ///  deadline passes. Hosts that connected are removed from `expected`.
    async fn await_meshes(
        &self,
        inbound: &mut mpsc::Receiver<InboundHandshake>,
        expected: &mut BTreeMap<HostId, SocketAddr>,
        own_host_id: Option<HostId>,
        deadline: Instant,
    ) -> Vec<PeerStream> {
        let mut result = Vec::new();
        while !expected.is_empty() {
            let handshake = match timeout_at(deadline, inbound.recv()).await {
                Ok(Some(handshake)) => handshake,
                _ => break,
            };
            if let Some((peer, _)) = self.accept_mesh(handshake, own_host_id, |from| expected.contains_key(&from)).await {
                expected.remove(&peer.host_id);
                result.push(peer);
            }
        }
        result
    }

    /// Answers an inbound handshake that is expected to be a mesh request. Returns the peer and
    ///  the host id it addressed.
    async fn accept_mesh(&self, handshake: InboundHandshake, own_host_id: Option<HostId>, is_expected: impl Fn(HostId) -> bool) -> Option<(PeerStream, HostId)> {
        let InboundHandshake { mut stream, peer_addr, message } = handshake;

        let JoinMessage::Mesh(mesh) = message else {
            warn!("unexpected handshake from {} while joining: {:?}", peer_addr, message);
            reject(&mut stream, RejectReason::RejoinInProgress, self.config.handshake_timeout).await;
            return None;
        };

        let reason = check_mesh(&self.config.fingerprint, &mesh, own_host_id)
            .or_else(|| (!is_expected(mesh.from_host_id)).then_some(RejectReason::TopologyMismatch));
        if let Some(reason) = reason {
            error!("rejecting mesh connection from {:?} at {}: {:?}", mesh.from_host_id, peer_addr, reason);
            reject(&mut stream, reason, self.config.handshake_timeout).await;
            return None;
        }

        let ack = JoinMessage::MeshAck(mesh.target_host_id);
        match timeout(self.config.handshake_timeout, ack.write_to(&mut stream)).await {
            Ok(Ok(())) => {
                debug!("mesh connection from host {:?}", mesh.from_host_id);
                Some((PeerStream {
                    host_id: mesh.from_host_id,
                    listen_addr: mesh.from_listen_addr,
                    stream,
                }, mesh.target_host_id))
            }
            _ => {
                warn!("could not acknowledge mesh connection from host {:?}", mesh.from_host_id);
                None
            }
        }
    }

    /// Takes over the slot of a failed host. The live members other than the sponsor connect to
    ///  this host while the sponsor prepares the admission, so mesh handshakes are accepted
    ///  while waiting for the sponsor's answer.
    async fn rejoin(&self, sponsor: SocketAddr) -> Result<JoinedGroup, JoinError> {
        info!("rejoining the cluster through {}", sponsor);
        let (acceptor, mut inbound, listen_addr, mut stream) = self.bind_and_connect(sponsor).await?;
        self.set_state(JoinState::Negotiating);

        timeout(self.config.handshake_timeout, self.request(listen_addr, JoinKind::Rejoin).write_to(&mut stream)).await
            .map_err(|_| JoinError::TimedOut)??;

        let mut early_meshes = Vec::new();
        let deadline = Instant::now() + self.config.join_timeout;
        let reply = {
            let read_reply = JoinMessage::read_from(&mut stream);
            tokio::pin!(read_reply);
            loop {
                tokio::select! {
                    reply = &mut read_reply => break reply?,
                    Some(handshake) = inbound.recv() => {
                        if let Some(peer) = self.accept_mesh(handshake, None, |_| true).await {
                            early_meshes.push(peer);
                        }
                    }
                    _ = sleep_until(deadline) => return Err(JoinError::TimedOut),
                }
            }
        };

        let accepted = self.check_reply(reply, sponsor, listen_addr)?;
        let host_id = accepted.assigned_host_id;
        info!("rejoined the cluster as host {:?}", host_id);

        let sponsor_entry = accepted.roster.iter()
            .find(|e| e.host_id == accepted.sponsor_host_id)
            .copied()
            .ok_or_else(|| JoinError::Protocol(format!("sponsor {:?} is not in the roster", accepted.sponsor_host_id)))?;

        let mut expected: BTreeMap<HostId, SocketAddr> = accepted.roster.iter()
            .filter(|e| e.host_id != host_id && e.host_id != accepted.sponsor_host_id)
            .map(|e| (e.host_id, e.listen_addr))
            .collect();

        let mut peers = vec![PeerStream {
            host_id: sponsor_entry.host_id,
            listen_addr: sponsor_entry.listen_addr,
            stream,
        }];
        for (peer, target) in early_meshes {
            if target == host_id && expected.remove(&peer.host_id).is_some() {
                peers.push(peer);
            }
            else {
                warn!("discarding mesh connection from host {:?} for slot {:?}", peer.host_id, target);
            }
        }

        // the sponsor answers after all members staged their connection, so they are usually all there
        let deadline = Instant::now() + self.config.handshake_timeout;
        peers.extend(self.await_meshes(&mut inbound, &mut expected, Some(host_id), deadline).await);

        Ok(JoinedGroup {
            info: GroupJoinInfo {
                host_id,
                roster: accepted.roster,
                unreachable_hosts: expected.into_keys().collect(),
            },
            listen_addr,
            peers,
            acceptor,
            inbound,
        })
    }
}
