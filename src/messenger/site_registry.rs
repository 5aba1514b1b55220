use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::messaging::mailbox::Mailbox;
use crate::messaging::message::VoltMessage;
use crate::messaging::message_sender::{MessageSender, SendError};
use crate::messaging::site_id::{HostId, MailboxId, SiteId, MAX_SITES_PER_HOST};

#[derive(Default)]
struct LocalSite {
    mailboxes: FxHashMap<MailboxId, Arc<Mailbox>>,
}

/// Routing table for the sites hosted locally and their mailboxes
pub struct SiteRegistry {
    host_id: HostId,
    sites: RwLock<FxHashMap<SiteId, LocalSite>>,
    next_generated_id: AtomicU32,
}

impl SiteRegistry {
    pub fn new(host_id: HostId) -> SiteRegistry {
        SiteRegistry {
            host_id,
            sites: Default::default(),
            next_generated_id: AtomicU32::new(1),
        }
    }

    /// Registers a site hosted by this host. Registering an existing site again has no effect.
    pub fn create_local_site(&self, site_id: SiteId) -> anyhow::Result<()> {
        if site_id.host_id() != self.host_id {
            bail!("site {:?} belongs to host {:?}, not to local host {:?}", site_id, site_id.host_id(), self.host_id);
        }
        if site_id.local_index() >= MAX_SITES_PER_HOST {
            bail!("site {:?} exceeds the limit of {} sites per host", site_id, MAX_SITES_PER_HOST);
        }

        let mut sites = self.sites.write().expect("lock poisoned");
        if sites.contains_key(&site_id) {
            debug!("site {:?} exists already", site_id);
        }
        else {
            debug!("created local site {:?}", site_id);
            sites.insert(site_id, LocalSite::default());
        }
        Ok(())
    }

    /// Unregisters a site and closes its mailboxes. Returns `false` if there was no such site.
    pub fn remove_local_site(&self, site_id: SiteId) -> bool {
        let removed = self.sites.write().expect("lock poisoned")
            .remove(&site_id);

        match removed {
            Some(site) => {
                debug!("removed local site {:?} with {} mailboxes", site_id, site.mailboxes.len());
                for mailbox in site.mailboxes.values() {
                    mailbox.close();
                }
                true
            }
            None => false,
        }
    }

    pub fn create_mailbox(&self, site_id: SiteId, mailbox_id: MailboxId, generate_if_zero: bool, sender: Weak<dyn MessageSender>) -> anyhow::Result<Arc<Mailbox>> {
        let mut sites = self.sites.write().expect("lock poisoned");
        let Some(site) = sites.get_mut(&site_id) else {
            bail!("no local site {:?}", site_id);
        };

        let mailbox_id = if mailbox_id == MailboxId::GENERATE {
            if !generate_if_zero {
                bail!("mailbox id 0 is reserved for generated ids");
            }
            self.generate_id(site)
        }
        else {
            mailbox_id
        };

        if site.mailboxes.contains_key(&mailbox_id) {
            bail!("mailbox {:?} exists already at site {:?}", mailbox_id, site_id);
        }

        let mailbox = Mailbox::new(site_id, mailbox_id, sender);
        site.mailboxes.insert(mailbox_id, mailbox.clone());
        debug!("created {:?}", mailbox);
        Ok(mailbox)
    }

    fn generate_id(&self, site: &LocalSite) -> MailboxId {
        loop {
            let candidate = MailboxId(self.next_generated_id.fetch_add(1, Ordering::Relaxed));
            if candidate != MailboxId::GENERATE && !site.mailboxes.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn mailbox(&self, site_id: SiteId, mailbox_id: MailboxId) -> Option<Arc<Mailbox>> {
        self.sites.read().expect("lock poisoned")
            .get(&site_id)
            .and_then(|s| s.mailboxes.get(&mailbox_id))
            .cloned()
    }

    pub fn deliver(&self, site_id: SiteId, mailbox_id: MailboxId, message: VoltMessage) -> Result<(), SendError> {
        let sites = self.sites.read().expect("lock poisoned");
        let site = sites.get(&site_id)
            .ok_or(SendError::NoSuchSite(site_id))?;
        let mailbox = site.mailboxes.get(&mailbox_id)
            .ok_or(SendError::NoSuchMailbox(site_id, mailbox_id))?;

        trace!("delivering locally to {:?}", mailbox);
        mailbox.deliver(message);
        Ok(())
    }

    pub fn local_sites(&self) -> Vec<SiteId> {
        let mut result: Vec<SiteId> = self.sites.read().expect("lock poisoned")
            .keys()
            .copied()
            .collect();
        result.sort();
        result
    }

    pub fn all_mailboxes(&self) -> Vec<Arc<Mailbox>> {
        self.sites.read().expect("lock poisoned")
            .values()
            .flat_map(|s| s.mailboxes.values().cloned())
            .collect()
    }

    /// closes all mailboxes, waking blocked receivers; the sites stay registered
    pub fn close_all(&self) {
        for mailbox in self.all_mailboxes() {
            mailbox.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::mailbox::BlockingRecv;
    use crate::messaging::subject::Subject;
    use crate::test_util::message::TrackingMessageSender;
    use rstest::rstest;

    fn sender() -> (Arc<TrackingMessageSender>, Weak<dyn MessageSender>) {
        let sender = Arc::new(TrackingMessageSender::new());
        let as_dyn: Arc<dyn MessageSender> = sender.clone();
        let weak = Arc::downgrade(&as_dyn);
        (sender, weak)
    }

    fn message(body: &'static [u8]) -> VoltMessage {
        VoltMessage::payload(32, Subject::Default, SiteId(0), body)
    }

    #[rstest]
    #[case::foreign_host(SiteId::new(HostId(2), 0))]
    #[case::index_too_large(SiteId::new(HostId(1), MAX_SITES_PER_HOST))]
    fn test_create_local_site_invalid(#[case] site_id: SiteId) {
        let registry = SiteRegistry::new(HostId(1));
        assert!(registry.create_local_site(site_id).is_err());
        assert!(registry.local_sites().is_empty());
    }

    #[test]
    fn test_create_local_site_twice() {
        let registry = SiteRegistry::new(HostId(1));
        let site = SiteId::new(HostId(1), 3);
        registry.create_local_site(site).unwrap();
        registry.create_local_site(site).unwrap();
        assert_eq!(registry.local_sites(), vec![site]);
    }

    #[test]
    fn test_create_mailbox() {
        let registry = SiteRegistry::new(HostId(0));
        let (_sender, weak) = sender();
        let site = SiteId::new(HostId(0), 1);

        assert!(registry.create_mailbox(site, MailboxId(5), false, weak.clone()).is_err());

        registry.create_local_site(site).unwrap();
        let mailbox = registry.create_mailbox(site, MailboxId(5), false, weak.clone()).unwrap();
        assert_eq!(mailbox.mailbox_id(), MailboxId(5));
        assert_eq!(mailbox.site_id(), site);

        assert!(registry.create_mailbox(site, MailboxId(5), false, weak.clone()).is_err());
        assert!(registry.create_mailbox(site, MailboxId::GENERATE, false, weak).is_err());
    }

    #[test]
    fn test_generated_ids_avoid_collisions() {
        let registry = SiteRegistry::new(HostId(0));
        let (_sender, weak) = sender();
        let site = SiteId::new(HostId(0), 0);
        registry.create_local_site(site).unwrap();

        registry.create_mailbox(site, MailboxId(1), false, weak.clone()).unwrap();
        registry.create_mailbox(site, MailboxId(2), false, weak.clone()).unwrap();

        let a = registry.create_mailbox(site, MailboxId::GENERATE, true, weak.clone()).unwrap();
        let b = registry.create_mailbox(site, MailboxId::GENERATE, true, weak).unwrap();
        assert_eq!(a.mailbox_id(), MailboxId(3));
        assert_eq!(b.mailbox_id(), MailboxId(4));
    }

    #[test]
    fn test_deliver() {
        let registry = SiteRegistry::new(HostId(0));
        let (_sender, weak) = sender();
        let site = SiteId::new(HostId(0), 0);
        registry.create_local_site(site).unwrap();
        let mailbox = registry.create_mailbox(site, MailboxId(9), false, weak).unwrap();

        registry.deliver(site, MailboxId(9), message(b"a")).unwrap();
        assert_eq!(mailbox.recv_any(), Some(message(b"a")));

        assert_eq!(registry.deliver(site, MailboxId(8), message(b"b")), Err(SendError::NoSuchMailbox(site, MailboxId(8))));
        let other = SiteId::new(HostId(0), 1);
        assert_eq!(registry.deliver(other, MailboxId(9), message(b"b")), Err(SendError::NoSuchSite(other)));
    }

    #[tokio::test]
    async fn test_remove_local_site_interrupts_receivers() {
        let registry = Arc::new(SiteRegistry::new(HostId(0)));
        let (_sender, weak) = sender();
        let site = SiteId::new(HostId(0), 0);
        registry.create_local_site(site).unwrap();
        let mailbox = registry.create_mailbox(site, MailboxId(1), false, weak).unwrap();

        let waiter = tokio::spawn(async move {
            mailbox.recv_blocking(&Subject::ALL, None).await
        });
        tokio::task::yield_now().await;

        assert!(registry.remove_local_site(site));
        assert!(!registry.remove_local_site(site));
        assert_eq!(waiter.await.unwrap(), BlockingRecv::Interrupted);
        assert!(registry.mailbox(site, MailboxId(1)).is_none());
    }
}
