use std::sync::Arc;

use tokio::sync::watch;

/// Single-slot "latest annotated frame" broadcast.
///
/// [`FrameStreamer::send`] replaces the one buffer and wakes every
/// subscriber; there is no per-subscriber queueing, so a slow subscriber
/// only ever observes the newest frame.
#[derive(Debug)]
pub struct FrameStreamer {
    tx: watch::Sender<Option<Arc<Vec<u8>>>>,
}

impl Default for FrameStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameStreamer {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn send(&self, jpeg: Arc<Vec<u8>>) {
        self.tx.send_replace(Some(jpeg));
    }

    /// A late subscriber immediately observes the latest buffer, if any;
    /// earlier buffers are gone for good.
    pub fn subscribe(&self) -> FrameSubscriber {
        let mut rx = self.tx.subscribe();
        if rx.borrow().is_some() {
            rx.mark_changed();
        }
        FrameSubscriber { rx }
    }
}

#[derive(Debug)]
pub struct FrameSubscriber {
    rx: watch::Receiver<Option<Arc<Vec<u8>>>>,
}

impl FrameSubscriber {
    /// Waits for the next published buffer. Never yields an empty buffer;
    /// returns `None` once the streamer is gone.
    pub async fn next(&mut self) -> Option<Arc<Vec<u8>>> {
        loop {
            self.rx.changed().await.ok()?;
            let frame = self.rx.borrow_and_update().clone();
            if let Some(frame) = frame {
                return Some(frame);
            }
        }
    }
}
