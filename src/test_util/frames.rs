use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::Notify;

use crate::messaging::frame::Frame;
use crate::messaging::site_id::HostId;
use crate::network::connection::{ConnectionId, FrameHandler};

/// A [FrameHandler] that records everything it receives, for asserting on it later
#[derive(Default)]
pub struct RecordingFrameHandler {
    frames: Mutex<Vec<(HostId, Frame)>>,
    lost: Mutex<Vec<(HostId, ConnectionId)>>,
    notify: Notify,
}

impl RecordingFrameHandler {
    pub fn new() -> Arc<RecordingFrameHandler> {
        Default::default()
    }

    pub fn frames(&self) -> Vec<(HostId, Frame)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn lost(&self) -> Vec<(HostId, ConnectionId)> {
        self.lost.lock().unwrap().clone()
    }

    /// waits until at least `n` frames were received, and returns all received frames
    pub async fn wait_for_frames(&self, n: usize, timeout: Duration) -> anyhow::Result<Vec<(HostId, Frame)>> {
        self.wait_until(timeout, || {
            let frames = self.frames();
            (frames.len() >= n).then_some(frames)
        }).await
            .map_err(|_| anyhow!("timed out waiting for {} frames, received {:?}", n, self.frames()))
    }

    pub async fn wait_for_lost(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || (!self.lost().is_empty()).then_some(()))
            .await
            .is_ok()
    }

    async fn wait_until<T>(&self, timeout: Duration, check: impl Fn() -> Option<T>) -> Result<T, tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(result) = check() {
                    return result;
                }
                notified.await;
            }
        }).await
    }
}

impl FrameHandler for RecordingFrameHandler {
    fn on_frame(&self, from: HostId, _connection_id: ConnectionId, frame: Frame) {
        self.frames.lock().unwrap().push((from, frame));
        self.notify.notify_waiters();
    }

    fn on_connection_lost(&self, host_id: HostId, connection_id: ConnectionId) {
        self.lost.lock().unwrap().push((host_id, connection_id));
        self.notify.notify_waiters();
    }
}
