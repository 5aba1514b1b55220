use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use thiserror::Error;

use crate::messaging::message::VoltMessage;
use crate::messaging::site_id::{HostId, MailboxId, SiteId};

/// Why a message could not be handed over for delivery. A send that returns `Ok` was either
///  delivered to a local mailbox or queued on a live connection.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SendError {
    #[error("host {0} is not a member of the cluster")]
    UnknownHost(HostId),
    #[error("host {0} is known to have failed")]
    HostFailed(HostId),
    #[error("no local site {0}")]
    NoSuchSite(SiteId),
    #[error("no mailbox {1:?} at local site {0}")]
    NoSuchMailbox(SiteId, MailboxId),
    #[error("connection to host {0} is closed")]
    ConnectionClosed(HostId),
    #[error("message tag {0} is not registered")]
    UnregisteredMessage(u8),
    #[error("encoded message exceeds the maximum frame length")]
    FrameTooLarge,
    #[error("messenger is shutting down")]
    ShuttingDown,
}

/// The outcome of a fan-out send: every destination is attempted independently, so some may
///  fail while the others succeed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FanOutReport {
    pub failed: Vec<(SiteId, SendError)>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn add_failure(&mut self, site: SiteId, error: SendError) {
        self.failed.push((site, error));
    }

    pub fn failed_sites(&self) -> Vec<SiteId> {
        self.failed.iter()
            .map(|(site, _)| *site)
            .collect()
    }
}

/// The seam between mailboxes and the messenger that routes their outgoing messages
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    /// Waits only if the connection's outbound queue is full, never for delivery itself
    async fn send(&self, destination: SiteId, mailbox_id: MailboxId, message: VoltMessage) -> Result<(), SendError>;

    async fn send_multi(&self, destinations: &[SiteId], mailbox_id: MailboxId, message: VoltMessage) -> FanOutReport;
}
