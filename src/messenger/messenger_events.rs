use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::trace;

use crate::messaging::site_id::HostId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MessengerEvent {
    /// sent once per failure, after the host was removed from the membership view and all local
    ///  mailboxes received the failure notification
    HostFailed(HostId),
    HostRejoined(HostRejoinedData),
    HostReady(HostId),
    PoisonPill(PoisonPillData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostRejoinedData {
    pub host_id: HostId,
    pub listen_addr: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoisonPillData {
    pub from: HostId,
    pub reason: String,
}

pub struct MessengerEventNotifier {
    sender: broadcast::Sender<MessengerEvent>,
}
impl MessengerEventNotifier {
    pub fn new() -> MessengerEventNotifier {
        let (sender, _) = broadcast::channel(128);

        MessengerEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: MessengerEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
