use std::sync::Mutex;

use async_trait::async_trait;

use crate::messaging::message::VoltMessage;
use crate::messaging::message_sender::{FanOutReport, MessageSender, SendError};
use crate::messaging::site_id::{MailboxId, SiteId};

/// A [MessageSender] that records all sent messages instead of sending them, for tests of code
///  that sends through a mailbox
#[derive(Debug, Default)]
pub struct TrackingMessageSender {
    tracker: Mutex<Vec<(SiteId, MailboxId, VoltMessage)>>,
}

impl TrackingMessageSender {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn assert_message_sent(&self, to: SiteId, mailbox_id: MailboxId, message: VoltMessage) {
        let mut lock = self.tracker.lock().unwrap();
        if lock.is_empty() {
            panic!("no message was sent");
        }

        let (actual_to, actual_mailbox_id, actual_msg) = lock.remove(0);
        assert_eq!(actual_to, to);
        assert_eq!(actual_mailbox_id, mailbox_id);
        assert_eq!(actual_msg, message);
    }

    pub fn assert_no_remaining_messages(&self) {
        assert!(
            self.tracker.lock().unwrap()
                .is_empty()
        );
    }
}

#[async_trait]
impl MessageSender for TrackingMessageSender {
    async fn send(&self, destination: SiteId, mailbox_id: MailboxId, message: VoltMessage) -> Result<(), SendError> {
        self.tracker.lock().unwrap().push((destination, mailbox_id, message));
        Ok(())
    }

    async fn send_multi(&self, destinations: &[SiteId], mailbox_id: MailboxId, message: VoltMessage) -> FanOutReport {
        let mut lock = self.tracker.lock().unwrap();
        for site in destinations {
            lock.push((*site, mailbox_id, message.clone()));
        }
        FanOutReport::default()
    }
}
