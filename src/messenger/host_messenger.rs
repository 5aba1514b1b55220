use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::join::acceptor::{Acceptor, InboundHandshake};
use crate::join::join_messages::{JoinKind, JoinMessage, RejectReason, RosterEntry};
use crate::join::socket_joiner::{reject, JoinedGroup, SocketJoiner};
use crate::messaging::codec::{CodecError, EncodedMessage, MessageRegistry, WireCodec};
use crate::messaging::frame::{Frame, HeartbeatData, RejoinPrepareAckData, RoutedMessage};
use crate::messaging::mailbox::Mailbox;
use crate::messaging::message::{FailureSiteUpdateData, VoltMessage};
use crate::messaging::message_sender::{FanOutReport, MessageSender, SendError};
use crate::messaging::site_id::{HostId, MailboxId, SiteId};
use crate::messenger::membership::{FailureOutcome, Membership, MembershipView};
use crate::messenger::messenger_config::MessengerConfig;
use crate::messenger::messenger_events::{MessengerEvent, MessengerEventNotifier, PoisonPillData};
use crate::messenger::site_registry::SiteRegistry;
use crate::network::connection::{ConnectionId, FrameHandler};
use crate::network::foreign_host::ForeignHost;

enum ControlEvent {
    Frame {
        from: HostId,
        frame: Frame,
    },
    ConnectionLost {
        host_id: HostId,
        connection_id: ConnectionId,
    },
}

/// Routed messages are delivered directly from the connection's reader task; everything that
///  changes membership goes through the messenger's control loop, which serializes it.
struct MessengerFrameHandler {
    messenger: Weak<HostMessenger>,
    control: mpsc::UnboundedSender<ControlEvent>,
}

impl FrameHandler for MessengerFrameHandler {
    fn on_frame(&self, from: HostId, _connection_id: ConnectionId, frame: Frame) {
        match frame {
            Frame::Routed(routed) => {
                if let Some(messenger) = self.messenger.upgrade() {
                    messenger.deliver_routed(from, routed);
                }
            }
            Frame::Heartbeat(data) => trace!("heartbeat #{} from {:?}", data.counter, from),
            frame => {
                let _ = self.control.send(ControlEvent::Frame { from, frame });
            }
        }
    }

    fn on_connection_lost(&self, host_id: HostId, connection_id: ConnectionId) {
        let _ = self.control.send(ControlEvent::ConnectionLost { host_id, connection_id });
    }
}

/// The local endpoint of the cluster messaging fabric: it owns the connections to all peer hosts,
///  routes messages to local and remote mailboxes, and maintains the membership view.
pub struct HostMessenger {
    pub(super) config: Arc<MessengerConfig>,
    pub(super) host_id: HostId,
    pub(super) listen_addr: SocketAddr,
    pub(super) codec: Arc<WireCodec>,
    pub(super) frame_handler: Arc<dyn FrameHandler>,
    pub(super) membership: Membership,
    pub(super) events: MessengerEventNotifier,
    sites: SiteRegistry,
    ready_hosts: watch::Sender<BTreeSet<HostId>>,
    /// set on the sponsor while a rejoin it sponsors collects prepare acknowledgements
    pub(super) prepare_acks: Mutex<Option<mpsc::UnboundedSender<(HostId, RejoinPrepareAckData)>>>,
    pub(super) sponsoring_rejoin: AtomicBool,
    shut_down: AtomicBool,
    acceptor: Mutex<Option<Acceptor>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<HostMessenger>,
}

impl Drop for HostMessenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl HostMessenger {
    /// Joins the cluster and starts messaging. Failed join attempts are retried if the failure is
    ///  transient, until the configured join timeout is reached.
    #[tracing::instrument(skip_all, fields(coordinator = %config.coordinator_addr))]
    pub async fn start(config: MessengerConfig, registry: MessageRegistry) -> anyhow::Result<Arc<HostMessenger>> {
        config.validate()?;
        let config = Arc::new(config);

        let joiner = SocketJoiner::new(config.clone());
        let deadline = Instant::now() + config.join_timeout;
        let joined = loop {
            match joiner.join().await {
                Ok(joined) => break joined,
                Err(e) if e.is_retryable() && Instant::now() + config.join_retry_interval < deadline => {
                    info!("join attempt failed, retrying in {:?}: {}", config.join_retry_interval, e);
                    tokio::time::sleep(config.join_retry_interval).await;
                }
                Err(e) => {
                    error!("could not join the cluster: {}", e);
                    return Err(e.into());
                }
            }
        };

        Ok(Self::from_joined_group(config, registry, joined))
    }

    fn from_joined_group(config: Arc<MessengerConfig>, registry: MessageRegistry, joined: JoinedGroup) -> Arc<HostMessenger> {
        let JoinedGroup { info, listen_addr, peers, acceptor, inbound } = joined;
        let host_id = info.host_id;
        let (control_send, control_recv) = mpsc::unbounded_channel();
        let (ready_hosts, _) = watch::channel(BTreeSet::new());

        let messenger = Arc::new_cyclic(|self_ref: &Weak<HostMessenger>| HostMessenger {
            config: config.clone(),
            host_id,
            listen_addr,
            codec: Arc::new(WireCodec::new(registry)),
            frame_handler: Arc::new(MessengerFrameHandler {
                messenger: self_ref.clone(),
                control: control_send,
            }),
            membership: Membership::new(host_id, &info.roster),
            events: MessengerEventNotifier::new(),
            sites: SiteRegistry::new(host_id),
            ready_hosts,
            prepare_acks: Mutex::new(None),
            sponsoring_rejoin: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            acceptor: Mutex::new(Some(acceptor)),
            tasks: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });

        for peer in peers {
            match messenger.start_foreign_host(peer.host_id, peer.listen_addr, peer.stream) {
                Ok(host) => {
                    messenger.membership.install(host);
                }
                Err(e) => {
                    warn!("could not set up connection to host {:?}: {}", peer.host_id, e);
                    messenger.membership.mark_failed(peer.host_id, None);
                }
            }
        }
        for host_id in &info.unreachable_hosts {
            warn!("host {:?} did not come up - treating it as failed", host_id);
            messenger.membership.mark_failed(*host_id, None);
        }

        let span = tracing::info_span!("messenger", host = ?host_id);
        let weak = Arc::downgrade(&messenger);
        let tasks = vec![
            tokio::spawn(control_loop(weak.clone(), control_recv).instrument(span.clone())),
            tokio::spawn(heartbeat_loop(weak.clone(), config.heartbeat_interval).instrument(span.clone())),
            tokio::spawn(inbound_loop(weak, inbound).instrument(span)),
        ];
        *messenger.tasks.lock().expect("lock poisoned") = tasks;

        info!("host {:?} joined a cluster of {} hosts, listening on {}", host_id, info.roster.len(), listen_addr);
        messenger
    }

    pub(super) fn start_foreign_host(&self, host_id: HostId, listen_addr: SocketAddr, stream: tokio::net::TcpStream) -> anyhow::Result<Arc<ForeignHost>> {
        let connection = crate::network::connection::Connection::start(
            stream,
            host_id,
            &self.config.connection_settings(),
            self.codec.clone(),
            self.frame_handler.clone(),
        )?;
        Ok(ForeignHost::new(host_id, listen_addr, connection))
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.events.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    //------------------------------------ sites and mailboxes

    pub fn create_local_site(&self, site_id: SiteId) -> anyhow::Result<()> {
        self.sites.create_local_site(site_id)
    }

    pub fn remove_local_site(&self, site_id: SiteId) -> bool {
        self.sites.remove_local_site(site_id)
    }

    pub fn local_sites(&self) -> Vec<SiteId> {
        self.sites.local_sites()
    }

    /// Registers a mailbox at a local site. With `generate_if_zero`, a mailbox id of zero is
    ///  replaced by a generated id that is unique at the site.
    pub fn create_mailbox(&self, site_id: SiteId, mailbox_id: MailboxId, generate_if_zero: bool) -> anyhow::Result<Arc<Mailbox>> {
        let sender: Weak<dyn MessageSender> = self.self_ref.clone();
        self.sites.create_mailbox(site_id, mailbox_id, generate_if_zero, sender)
    }

    //------------------------------------ sending

    fn check_sendable(&self, message: &VoltMessage) -> Result<(), SendError> {
        if self.is_shut_down() {
            return Err(SendError::ShuttingDown);
        }
        if !self.codec.registry().is_encodable(message) {
            return Err(SendError::UnregisteredMessage(message.tag()));
        }
        Ok(())
    }

    fn encode(&self, message: &VoltMessage) -> Result<EncodedMessage, SendError> {
        self.codec.encode_message(message)
            .map_err(|e| match e {
                CodecError::UnknownTag(tag) => SendError::UnregisteredMessage(tag),
                _ => SendError::FrameTooLarge,
            })
    }

    fn resolve_host(view: &MembershipView, host_id: HostId) -> Result<Arc<ForeignHost>, SendError> {
        if let Some(host) = view.host(host_id) {
            return Ok(host.clone());
        }
        if view.is_failed(host_id) {
            Err(SendError::HostFailed(host_id))
        }
        else {
            Err(SendError::UnknownHost(host_id))
        }
    }

    /// Delivers to a local mailbox, or queues the message on the connection to the destination's
    ///  host. This waits only while the connection's outbound queue is full.
    pub async fn send(&self, destination: SiteId, mailbox_id: MailboxId, message: VoltMessage) -> Result<(), SendError> {
        self.check_sendable(&message)?;

        let host_id = destination.host_id();
        if host_id == self.host_id {
            return self.sites.deliver(destination, mailbox_id, message);
        }

        let host = Self::resolve_host(&self.membership.snapshot(), host_id)?;
        let encoded = self.encode(&message)?;
        let frame = WireCodec::routed_frame(mailbox_id, &[destination], &encoded)
            .map_err(|_| SendError::FrameTooLarge)?;
        host.send(frame).await
    }

    /// Sends a message to several sites. Each destination host is attempted independently, and the
    ///  message is serialized only once and sent once per host.
    pub async fn send_multi(&self, destinations: &[SiteId], mailbox_id: MailboxId, message: VoltMessage) -> FanOutReport {
        let mut report = FanOutReport::default();
        if let Err(e) = self.check_sendable(&message) {
            for site in destinations {
                report.add_failure(*site, e.clone());
            }
            return report;
        }

        let mut by_host: BTreeMap<HostId, BTreeSet<SiteId>> = BTreeMap::new();
        for site in destinations {
            by_host.entry(site.host_id()).or_default().insert(*site);
        }

        let view = self.membership.snapshot();
        let mut encoded = None;
        for (host_id, sites) in by_host {
            if host_id == self.host_id {
                for site in sites {
                    if let Err(e) = self.sites.deliver(site, mailbox_id, message.clone()) {
                        report.add_failure(site, e);
                    }
                }
                continue;
            }

            let sites: Vec<SiteId> = sites.into_iter().collect();
            let result = match encoded.get_or_insert_with(|| self.encode(&message)) {
                Ok(encoded) => match Self::resolve_host(&view, host_id) {
                    Ok(host) => match WireCodec::routed_frame(mailbox_id, &sites, encoded) {
                        Ok(frame) => host.send(frame).await,
                        Err(_) => Err(SendError::FrameTooLarge),
                    },
                    Err(e) => Err(e),
                },
                Err(e) => Err(e.clone()),
            };
            if let Err(e) = result {
                debug!("fan-out to host {:?} failed: {}", host_id, e);
                for site in sites {
                    report.add_failure(site, e.clone());
                }
            }
        }
        report
    }

    /// Queues a control frame to all live peers, returning the hosts it could not be queued for
    pub(super) async fn broadcast_control(&self, frame: &Frame) -> Vec<HostId> {
        let encoded = match self.codec.encode(frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("could not encode {:?}: {}", frame, e);
                return self.membership.snapshot().foreign_hosts().map(|h| h.host_id()).collect();
            }
        };

        let mut failed = Vec::new();
        for host in self.membership.snapshot().foreign_hosts() {
            if let Err(e) = host.send(encoded.clone()).await {
                debug!("could not send {:?} to {:?}: {}", frame, host, e);
                failed.push(host.host_id());
            }
        }
        failed
    }

    pub(super) async fn send_control(&self, host_id: HostId, frame: &Frame) -> Result<(), SendError> {
        let host = Self::resolve_host(&self.membership.snapshot(), host_id)?;
        let encoded = self.codec.encode(frame)
            .map_err(|_| SendError::FrameTooLarge)?;
        host.send(encoded).await
    }

    fn deliver_routed(&self, from: HostId, routed: RoutedMessage) {
        let RoutedMessage { mailbox_id, destinations, message } = routed;
        for destination in destinations {
            if destination.host_id() != self.host_id {
                warn!("host {:?} sent a message for site {:?} which is not local - dropping", from, destination);
                continue;
            }
            if let Err(e) = self.sites.deliver(destination, mailbox_id, message.clone()) {
                debug!("dropping message from {:?}: {}", from, e);
            }
        }
    }

    //------------------------------------ membership

    pub fn count_foreign_hosts(&self) -> usize {
        self.membership.snapshot().count_foreign_hosts()
    }

    /// all live hosts including this one
    pub fn live_hosts(&self) -> Vec<HostId> {
        self.membership.snapshot().live_hosts()
    }

    pub fn failed_hosts(&self) -> Vec<HostId> {
        self.membership.snapshot().failed_hosts()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.membership.snapshot().roster()
    }

    pub fn hostname_for_host(&self, host_id: HostId) -> Option<String> {
        self.membership.snapshot()
            .listen_addr(host_id)
            .map(|addr| addr.ip().to_string())
    }

    /// Forcibly kills the connection to a peer, which then goes through regular failure handling.
    ///  Returns `false` if the host is not live.
    pub fn close_foreign_host_socket(&self, host_id: HostId) -> bool {
        match self.membership.snapshot().host(host_id) {
            Some(host) => {
                host.kill();
                true
            }
            None => false,
        }
    }

    /// Removes a failed host from the membership view and notifies all local mailboxes and event
    ///  subscribers. Reporting the same failure repeatedly has no further effect.
    pub fn report_host_failure(&self, host_id: HostId) {
        self.handle_host_failure(host_id, None);
    }

    fn handle_host_failure(&self, host_id: HostId, connection_id: Option<ConnectionId>) {
        let host = match self.membership.mark_failed(host_id, connection_id) {
            FailureOutcome::Ignored => {
                debug!("redundant failure notification for host {:?}", host_id);
                return;
            }
            FailureOutcome::Failed(host) => host,
        };

        warn!("host {:?} failed", host_id);
        if let Some(host) = host {
            host.abort();
        }
        self.ready_hosts.send_modify(|ready| {
            ready.remove(&host_id);
        });

        let update = VoltMessage::FailureSiteUpdate(FailureSiteUpdateData {
            reporting_host: self.host_id,
            failed_host: host_id,
            surviving_hosts: self.membership.snapshot().live_hosts(),
        });
        for mailbox in self.sites.all_mailboxes() {
            mailbox.deliver(update.clone());
        }

        self.events.send_event(MessengerEvent::HostFailed(host_id));
    }

    fn on_connection_lost(&self, host_id: HostId, connection_id: ConnectionId) {
        if let Some(staged) = self.membership.unstage_connection(connection_id) {
            warn!("lost staged connection to rejoining {:?}", staged);
            return;
        }
        if self.is_shut_down() {
            return;
        }
        self.handle_host_failure(host_id, Some(connection_id));
    }

    //------------------------------------ readiness and poison pill

    /// Marks this host as ready and announces it to all peers
    pub async fn send_ready_message(&self) {
        self.mark_ready(self.host_id);
        let failed = self.broadcast_control(&Frame::HostReady(self.host_id)).await;
        if !failed.is_empty() {
            warn!("could not announce readiness to {:?}", failed);
        }
    }

    fn mark_ready(&self, host_id: HostId) {
        debug!("host {:?} is ready", host_id);
        self.ready_hosts.send_modify(|ready| {
            ready.insert(host_id);
        });
    }

    /// Waits until every live host announced its readiness. Returns `false` on timeout.
    pub async fn wait_for_all_hosts_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready_hosts.subscribe();
        let all_ready = ready.wait_for(|ready| {
            self.membership.snapshot()
                .live_hosts()
                .iter()
                .all(|h| ready.contains(h))
        });
        let result = tokio::time::timeout(timeout, all_ready).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Tells all peers to stop, e.g. after a fatal local inconsistency
    pub async fn send_poison_pill(&self, reason: &str) {
        error!("sending poison pill to all hosts: {}", reason);
        self.broadcast_control(&Frame::PoisonPill(reason.to_string())).await;
    }

    //------------------------------------ control loop

    async fn on_control_frame(self: &Arc<Self>, from: HostId, frame: Frame) {
        match frame {
            Frame::HostReady(host_id) => {
                self.mark_ready(host_id);
                self.events.send_event(MessengerEvent::HostReady(host_id));
            }
            Frame::PoisonPill(reason) => {
                error!("received poison pill from host {:?}: {}", from, reason);
                self.events.send_event(MessengerEvent::PoisonPill(PoisonPillData { from, reason }));
            }
            Frame::RejoinPrepare(data) => {
                let messenger = self.clone();
                tokio::spawn(async move {
                    let accepted = match messenger.prepare_rejoin(data.host_id, data.addr).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("could not prepare rejoin of host {:?} at {}: {}", data.host_id, data.addr, e);
                            false
                        }
                    };
                    let ack = Frame::RejoinPrepareAck(RejoinPrepareAckData { host_id: data.host_id, accepted });
                    if let Err(e) = messenger.send_control(from, &ack).await {
                        warn!("could not acknowledge rejoin preparation to {:?}: {}", from, e);
                    }
                }.in_current_span());
            }
            Frame::RejoinPrepareAck(data) => {
                match self.prepare_acks.lock().expect("lock poisoned").as_ref() {
                    Some(acks) => {
                        let _ = acks.send((from, data));
                    }
                    None => debug!("stale rejoin acknowledgement from {:?}: {:?}", from, data),
                }
            }
            Frame::RejoinCommit(host_id) => {
                if self.commit_rejoin(host_id).is_none() {
                    warn!("host {:?} committed the rejoin of {:?}, but it was not prepared here", from, host_id);
                }
            }
            Frame::RejoinRollback(host_id) => {
                self.rollback_rejoin(host_id);
            }
            Frame::Routed(_) | Frame::Heartbeat(_) => {
                trace!("data frame from {:?} in control loop", from);
            }
        }
    }

    fn send_heartbeats(&self, counter: u32) {
        let frame = match self.codec.encode(&Frame::Heartbeat(HeartbeatData { counter })) {
            Ok(frame) => frame,
            Err(e) => {
                error!("could not encode heartbeat: {}", e);
                return;
            }
        };

        let now = Instant::now();
        for host in self.membership.snapshot().foreign_hosts() {
            let silence = now.saturating_duration_since(host.last_heard());
            if silence > self.config.heartbeat_timeout {
                warn!("no data from {:?} for {:?} - treating it as failed", host, silence);
                host.kill();
                continue;
            }

            match host.try_send(frame.clone()) {
                Ok(true) => {}
                Ok(false) => trace!("outbound queue to {:?} is full - skipping heartbeat", host),
                Err(e) => debug!("could not send heartbeat to {:?}: {}", host, e),
            }
        }
    }

    fn on_inbound_handshake(self: &Arc<Self>, handshake: InboundHandshake) {
        let InboundHandshake { mut stream, peer_addr, message } = handshake;
        let handshake_timeout = self.config.handshake_timeout;

        match message {
            JoinMessage::Request(request) if request.kind == JoinKind::Rejoin => {
                let messenger = self.clone();
                tokio::spawn(async move {
                    messenger.sponsor_rejoin(stream, peer_addr, request).await;
                }.in_current_span());
            }
            JoinMessage::Request(request) => {
                error!("rejecting join request from {} (instance {:x}): the cluster is formed already", peer_addr, request.instance_id);
                tokio::spawn(async move {
                    reject(&mut stream, RejectReason::ClusterFull, handshake_timeout).await;
                });
            }
            other => {
                warn!("unexpected handshake from {} after joining: {:?}", peer_addr, other);
                tokio::spawn(async move {
                    reject(&mut stream, RejectReason::TopologyMismatch, handshake_timeout).await;
                });
            }
        }
    }

    /// Closes all mailboxes and connections and stops all background tasks. Sends that are in
    ///  flight either complete or fail with [SendError::ShuttingDown] or
    ///  [SendError::ConnectionClosed].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down host {:?}", self.host_id);

        if let Some(acceptor) = self.acceptor.lock().expect("lock poisoned").take() {
            acceptor.stop();
        }
        for task in self.tasks.lock().expect("lock poisoned").drain(..) {
            task.abort();
        }
        self.sites.close_all();
        for host in self.membership.clear() {
            host.close();
        }
    }
}

#[async_trait]
impl MessageSender for HostMessenger {
    async fn send(&self, destination: SiteId, mailbox_id: MailboxId, message: VoltMessage) -> Result<(), SendError> {
        HostMessenger::send(self, destination, mailbox_id, message).await
    }

    async fn send_multi(&self, destinations: &[SiteId], mailbox_id: MailboxId, message: VoltMessage) -> FanOutReport {
        HostMessenger::send_multi(self, destinations, mailbox_id, message).await
    }
}

async fn control_loop(messenger: Weak<HostMessenger>, mut control: mpsc::UnboundedReceiver<ControlEvent>) {
    while let Some(event) = control.recv().await {
        let Some(messenger) = messenger.upgrade() else {
            return;
        };
        match event {
            ControlEvent::Frame { from, frame } => messenger.on_control_frame(from, frame).await,
            ControlEvent::ConnectionLost { host_id, connection_id } => messenger.on_connection_lost(host_id, connection_id),
        }
    }
}

async fn heartbeat_loop(messenger: Weak<HostMessenger>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut counter = 0u32;

    loop {
        ticker.tick().await;
        let Some(messenger) = messenger.upgrade() else {
            return;
        };
        counter = counter.wrapping_add(1);
        messenger.send_heartbeats(counter);
    }
}

async fn inbound_loop(messenger: Weak<HostMessenger>, mut inbound: mpsc::Receiver<InboundHandshake>) {
    while let Some(handshake) = inbound.recv().await {
        let Some(messenger) = messenger.upgrade() else {
            return;
        };
        messenger.on_inbound_handshake(handshake);
    }
}
