use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::messaging::message::VoltMessage;
use crate::messaging::message_sender::{FanOutReport, MessageSender, SendError};
use crate::messaging::site_id::{MailboxId, SiteId};
use crate::messaging::subject::Subject;

/// Result of a blocking receive. Interruption (the mailbox was closed, e.g. during shutdown) is
///  distinguishable from a timeout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockingRecv {
    Message(VoltMessage),
    TimedOut,
    Interrupted,
}

impl BlockingRecv {
    pub fn message(self) -> Option<VoltMessage> {
        match self {
            BlockingRecv::Message(msg) => Some(msg),
            _ => None,
        }
    }
}

/// The inbox of one (site, mailbox id) pair, with one FIFO queue per [Subject].
///
/// Delivery never fails and is not bounded other than by memory. Receivers pick the subjects they
///  are interested in and their priority order on every call, so there is no starvation
///  between subjects that is not the caller's choice.
pub struct Mailbox {
    site_id: SiteId,
    mailbox_id: MailboxId,
    queues: Mutex<[VecDeque<VoltMessage>; Subject::COUNT]>,
    notify: Notify,
    closed: AtomicBool,
    sender: Weak<dyn MessageSender>,
}

impl Debug for Mailbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mailbox({:?}/{:?})", self.site_id, self.mailbox_id)
    }
}

impl Mailbox {
    pub fn new(site_id: SiteId, mailbox_id: MailboxId, sender: Weak<dyn MessageSender>) -> Arc<Mailbox> {
        Arc::new(Mailbox {
            site_id,
            mailbox_id,
            queues: Default::default(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            sender,
        })
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox_id
    }

    pub async fn send(&self, destination: SiteId, mailbox_id: MailboxId, message: VoltMessage) -> Result<(), SendError> {
        match self.sender.upgrade() {
            Some(sender) => sender.send(destination, mailbox_id, message).await,
            None => Err(SendError::ShuttingDown),
        }
    }

    pub async fn send_multi(&self, destinations: &[SiteId], mailbox_id: MailboxId, message: VoltMessage) -> FanOutReport {
        match self.sender.upgrade() {
            Some(sender) => sender.send_multi(destinations, mailbox_id, message).await,
            None => {
                let mut report = FanOutReport::default();
                for site in destinations {
                    report.add_failure(*site, SendError::ShuttingDown);
                }
                report
            }
        }
    }

    pub fn deliver(&self, message: VoltMessage) {
        self.enqueue(message, false);
    }

    /// enqueues the message at the head of its subject's queue, making it the next one received
    pub fn deliver_front(&self, message: VoltMessage) {
        self.enqueue(message, true);
    }

    fn enqueue(&self, message: VoltMessage, at_front: bool) {
        if self.is_closed() {
            debug!("{:?} is closed - dropping message with tag {}", self, message.tag());
            return;
        }

        trace!("{:?}: delivering message with tag {}", self, message.tag());
        {
            let mut queues = self.queues.lock().expect("mailbox lock poisoned");
            let queue = &mut queues[message.subject().index()];
            if at_front {
                queue.push_front(message);
            }
            else {
                queue.push_back(message);
            }
        }
        self.notify.notify_waiters();
    }

    /// non-blocking: returns the first available message, checking subjects in the given order
    pub fn recv(&self, subjects: &[Subject]) -> Option<VoltMessage> {
        let mut queues = self.queues.lock().expect("mailbox lock poisoned");
        subjects.iter()
            .find_map(|s| queues[s.index()].pop_front())
    }

    pub fn recv_any(&self) -> Option<VoltMessage> {
        self.recv(&Subject::ALL)
    }

    /// Suspends the calling task until a message for one of the subjects is available, the
    ///  timeout elapses or the mailbox is closed. `None` waits indefinitely.
    pub async fn recv_blocking(&self, subjects: &[Subject], timeout: Option<Duration>) -> BlockingRecv {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // register for notification before checking, so a concurrent delivery can not be lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return BlockingRecv::Interrupted;
            }
            if let Some(msg) = self.recv(subjects) {
                return BlockingRecv::Message(msg);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return match self.recv(subjects) {
                            Some(msg) => BlockingRecv::Message(msg),
                            None => BlockingRecv::TimedOut,
                        };
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn pending(&self, subject: Subject) -> usize {
        self.queues.lock().expect("mailbox lock poisoned")[subject.index()].len()
    }

    /// Closes the mailbox: pending messages are discarded, later deliveries are dropped, and all
    ///  blocked receivers return [BlockingRecv::Interrupted].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing {:?}", self);

        for q in self.queues.lock().expect("mailbox lock poisoned").iter_mut() {
            q.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
