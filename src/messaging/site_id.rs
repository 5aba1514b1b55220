use std::fmt::{Debug, Display, Formatter};

/// Site ids encode their owning host: `host_id * SITES_TO_HOST_DIVISOR + local_index`
pub const SITES_TO_HOST_DIVISOR: u32 = 100;
pub const MAX_SITES_PER_HOST: u32 = 64;

/// Cluster-wide unique id of a host, assigned during join. Host 0 is the leader that formed
///  the cluster.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostId(pub u32);

impl HostId {
    pub const LEADER: HostId = HostId(0);

    pub fn site(&self, local_index: u32) -> SiteId {
        SiteId::new(*self, local_index)
    }
}

impl Debug for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "H{}", self.0)
    }
}
impl Display for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An addressable unit of work inside a host, e.g. a partition replica. Messages are addressed
///  to (site, mailbox) pairs.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SiteId(pub u32);

impl SiteId {
    pub const fn new(host_id: HostId, local_index: u32) -> SiteId {
        SiteId(host_id.0 * SITES_TO_HOST_DIVISOR + local_index)
    }

    pub const fn host_id(&self) -> HostId {
        HostId(self.0 / SITES_TO_HOST_DIVISOR)
    }

    pub const fn local_index(&self) -> u32 {
        self.0 % SITES_TO_HOST_DIVISOR
    }
}

impl Debug for SiteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}:{}", self.host_id().0, self.local_index())
    }
}
impl Display for SiteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a mailbox inside a site. Zero is reserved as 'please generate an id' when creating
///  a mailbox.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MailboxId(pub u32);

impl MailboxId {
    pub const GENERATE: MailboxId = MailboxId(0);
}
