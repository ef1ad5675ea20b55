#[cfg(test)]
use mockall::automock;

use anyhow::Result;

use crate::{frame::Frame, models::TrackedObject};

/// The external detector/tracker.
///
/// Given a frame, it returns every object it currently tracks. Model
/// loading, device selection and the association algorithm all live behind
/// this seam; the pipeline only consumes the per-tick results.
#[cfg_attr(test, automock)]
pub trait Tracker: Send {
    fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedObject>>;
}
