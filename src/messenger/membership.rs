use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::join::join_messages::RosterEntry;
use crate::messaging::site_id::HostId;
use crate::network::connection::ConnectionId;
use crate::network::foreign_host::ForeignHost;

/// An immutable snapshot of cluster membership as seen by this host. The routing path works on
///  one snapshot per operation and never holds a lock while sending.
#[derive(Clone)]
pub struct MembershipView {
    local_host_id: HostId,
    /// every host that was ever admitted, with its listen address; failed hosts keep their slot
    roster: BTreeMap<HostId, SocketAddr>,
    hosts: FxHashMap<HostId, Arc<ForeignHost>>,
    failed: BTreeSet<HostId>,
}

impl MembershipView {
    pub fn local_host_id(&self) -> HostId {
        self.local_host_id
    }

    pub fn host(&self, host_id: HostId) -> Option<&Arc<ForeignHost>> {
        self.hosts.get(&host_id)
    }

    pub fn foreign_hosts(&self) -> impl Iterator<Item = &Arc<ForeignHost>> {
        self.hosts.values()
    }

    pub fn count_foreign_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_member(&self, host_id: HostId) -> bool {
        self.roster.contains_key(&host_id)
    }

    pub fn is_failed(&self, host_id: HostId) -> bool {
        self.failed.contains(&host_id)
    }

    /// live hosts including the local host, ordered by host id
    pub fn live_hosts(&self) -> Vec<HostId> {
        self.roster.keys()
            .filter(|h| !self.failed.contains(h))
            .copied()
            .collect()
    }

    pub fn failed_hosts(&self) -> Vec<HostId> {
        self.failed.iter().copied().collect()
    }

    pub fn listen_addr(&self, host_id: HostId) -> Option<SocketAddr> {
        self.roster.get(&host_id).copied()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.roster.iter()
            .map(|(&host_id, &listen_addr)| RosterEntry { host_id, listen_addr })
            .collect()
    }

    /// the live host that is listening on `addr`, if any
    pub fn live_host_at(&self, addr: SocketAddr) -> Option<HostId> {
        self.roster.iter()
            .find(|(h, a)| **a == addr && !self.failed.contains(h))
            .map(|(h, _)| *h)
    }
}

#[derive(Debug)]
pub enum FailureOutcome {
    /// the host was live, and it was removed; hosts that never connected have no ForeignHost
    Failed(Option<Arc<ForeignHost>>),
    /// redundant notification: unknown host, already failed, or a stale connection
    Ignored,
}

/// The mutable membership state. All mutations go through a single write lock and replace the
///  snapshot, so readers always see a consistent view.
pub struct Membership {
    view: RwLock<Arc<MembershipView>>,
    /// a rejoining host's connection between prepare and commit; it is not visible to routing
    staged: Mutex<Option<Arc<ForeignHost>>>,
}

impl Membership {
    pub fn new(local_host_id: HostId, roster: &[RosterEntry]) -> Membership {
        let view = MembershipView {
            local_host_id,
            roster: roster.iter()
                .map(|e| (e.host_id, e.listen_addr))
                .collect(),
            hosts: FxHashMap::default(),
            failed: BTreeSet::new(),
        };
        Membership {
            view: RwLock::new(Arc::new(view)),
            staged: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Arc<MembershipView> {
        self.view.read().expect("lock poisoned").clone()
    }

    fn update<T>(&self, f: impl FnOnce(&mut MembershipView) -> T) -> T {
        let mut view = self.view.write().expect("lock poisoned");
        let mut new_view = view.as_ref().clone();
        let result = f(&mut new_view);
        *view = Arc::new(new_view);
        result
    }

    /// Makes a host live, both during initial formation and when a rejoin is committed. Returns
    ///  a previous ForeignHost for the same id, which the caller must close.
    pub fn install(&self, host: Arc<ForeignHost>) -> Option<Arc<ForeignHost>> {
        debug!("installing {:?}", host);
        self.update(|view| {
            view.failed.remove(&host.host_id());
            view.roster.insert(host.host_id(), host.listen_addr());
            view.hosts.insert(host.host_id(), host)
        })
    }

    /// Idempotent: only the first notification for a live host changes the view. If
    ///  `connection_id` is given, the notification is ignored unless it refers to the host's
    ///  current connection, which protects a rejoined host from its predecessor's loss.
    pub fn mark_failed(&self, host_id: HostId, connection_id: Option<ConnectionId>) -> FailureOutcome {
        self.update(|view| {
            if !view.roster.contains_key(&host_id) || host_id == view.local_host_id {
                warn!("failure notification for host {:?} that is not a peer - ignoring", host_id);
                return FailureOutcome::Ignored;
            }
            if view.failed.contains(&host_id) {
                return FailureOutcome::Ignored;
            }
            if let (Some(connection_id), Some(host)) = (connection_id, view.hosts.get(&host_id)) {
                if host.connection_id() != connection_id {
                    debug!("loss of stale connection {:?} to host {:?} - ignoring", connection_id, host_id);
                    return FailureOutcome::Ignored;
                }
            }

            view.failed.insert(host_id);
            FailureOutcome::Failed(view.hosts.remove(&host_id))
        })
    }

    /// removes all hosts, returning them so the caller can close their connections
    pub fn clear(&self) -> Vec<Arc<ForeignHost>> {
        let staged = self.staged.lock().expect("lock poisoned").take();
        self.update(|view| {
            view.hosts.drain()
                .map(|(_, h)| h)
                .chain(staged)
                .collect()
        })
    }

    /// fails if another rejoin is staged already
    pub fn stage(&self, host: Arc<ForeignHost>) -> Result<(), Arc<ForeignHost>> {
        let mut staged = self.staged.lock().expect("lock poisoned");
        if staged.is_some() {
            return Err(host);
        }
        debug!("staging {:?}", host);
        *staged = Some(host);
        Ok(())
    }

    pub fn staged_host_id(&self) -> Option<HostId> {
        self.staged.lock().expect("lock poisoned")
            .as_ref()
            .map(|h| h.host_id())
    }

    pub fn take_staged(&self, host_id: HostId) -> Option<Arc<ForeignHost>> {
        let mut staged = self.staged.lock().expect("lock poisoned");
        match staged.as_ref() {
            Some(h) if h.host_id() == host_id => staged.take(),
            _ => None,
        }
    }

    /// drops the staged host if it is the one using `connection_id`
    pub fn unstage_connection(&self, connection_id: ConnectionId) -> Option<Arc<ForeignHost>> {
        let mut staged = self.staged.lock().expect("lock poisoned");
        match staged.as_ref() {
            Some(h) if h.connection_id() == connection_id => staged.take(),
            _ => None,
        }
    }
}
