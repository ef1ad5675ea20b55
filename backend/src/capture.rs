use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::Result;
use log::{info, warn};
#[cfg(test)]
use mockall::automock;

use crate::frame::Frame;

/// How many frames the capture thread may queue ahead of the consumer.
const BUFFER_DEPTH: usize = 2;

/// Pause before retrying a device that also failed to re-open.
const REOPEN_BACKOFF: Duration = Duration::from_millis(100);

/// A camera or video device owned by the capture thread.
///
/// This is the seam to whatever actually produces frames; the pipeline never
/// sees anything below it.
#[cfg_attr(test, automock)]
pub trait CaptureDevice: Send + 'static {
    /// Blocks until the device delivers the next raw frame.
    fn grab(&mut self) -> Result<Frame>;

    /// Re-initializes the device after a failed [`Self::grab`].
    fn reopen(&mut self) -> Result<()>;
}

/// Non-blocking access to the most recent captured frame.
#[cfg_attr(test, automock)]
pub trait FrameFeed: Send {
    /// Returns the newest available frame, or `None` if nothing has ever
    /// been captured.
    fn read(&self) -> Option<Arc<Frame>>;
}

#[derive(Default)]
struct BufferInner {
    queue: VecDeque<Arc<Frame>>,
    latest: Option<Arc<Frame>>,
}

/// Depth-2 latest-wins buffer between the capture thread and the detection
/// loop. The producer drops the oldest queued frame instead of blocking;
/// the consumer always sees the newest frame and never a backlog.
#[derive(Default)]
pub(crate) struct FrameBuffer {
    inner: Mutex<BufferInner>,
}

impl FrameBuffer {
    pub(crate) fn push(&self, frame: Arc<Frame>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() == BUFFER_DEPTH {
            inner.queue.pop_front();
        }
        inner.queue.push_back(frame.clone());
        inner.latest = Some(frame);
    }

    pub(crate) fn read(&self) -> Option<Arc<Frame>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.queue.pop_back() {
            Some(frame) => {
                inner.queue.clear();
                Some(frame)
            }
            None => inner.latest.clone(),
        }
    }
}

/// Owns the capture device on a dedicated thread and publishes resized
/// frames into a [`FrameBuffer`].
///
/// The thread never terminates on its own: grab failures re-open the device
/// and continue.
pub struct FrameSource {
    buffer: Arc<FrameBuffer>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSource {
    pub fn start(device: Box<dyn CaptureDevice>) -> Self {
        let buffer = Arc::new(FrameBuffer::default());
        let running = Arc::new(AtomicBool::new(true));
        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn({
                let buffer = buffer.clone();
                let running = running.clone();
                move || capture_loop(device, buffer, running)
            })
            .expect("spawnable thread");

        info!(target: "capture", "capture thread started");
        Self {
            buffer,
            running,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl FrameFeed for FrameSource {
    #[inline]
    fn read(&self) -> Option<Arc<Frame>> {
        self.buffer.read()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    buffer: Arc<FrameBuffer>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        match device.grab() {
            Ok(frame) => buffer.push(Arc::new(frame.into_target_size())),
            Err(err) => {
                warn!(target: "capture", "frame grab failed: {err}");
                if let Err(err) = device.reopen() {
                    warn!(target: "capture", "device re-open failed: {err}");
                    thread::sleep(REOPEN_BACKOFF);
                }
            }
        }
    }
}
