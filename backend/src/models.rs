use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A single object reported by the external tracker for one frame.
///
/// Produced fresh on every tick and never retained past it. `id` is the
/// tracker-assigned track id; it is `None` while the tracker has not yet
/// associated the detection with a track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: Option<u64>,
    pub label: String,
    /// Bounding box as `[x1, y1, x2, y2]` in frame pixels.
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    pub confidence: f32,
}

impl TrackedObject {
    pub fn new(id: Option<u64>, label: impl Into<String>, bbox: [f32; 4], confidence: f32) -> Self {
        Self {
            id,
            label: label.into(),
            bbox,
            confidence,
        }
    }
}

/// The latest per-tick detection snapshot as served by `GET /detections`.
#[derive(Clone, Debug, Serialize)]
pub struct SnapshotRecord {
    pub timestamp: i64,
    pub frame_id: u64,
    pub tracked_objects: Arc<Vec<TrackedObject>>,
}
