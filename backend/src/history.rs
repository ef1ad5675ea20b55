use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::Arc,
};

use crate::models::TrackedObject;

/// How far back aggregated detection queries may reach.
pub const MAX_HISTORY_SECONDS: i64 = 30;

/// Hard cap on retained snapshots (30 s at a detection rate well above the
/// loop's nominal 10 Hz).
const MAX_HISTORY_ENTRIES: usize = MAX_HISTORY_SECONDS as usize * 30;

/// Ring of recent per-tick snapshots backing `GET /detections?from=N`.
#[derive(Debug, Default)]
pub struct DetectionHistory {
    entries: VecDeque<(i64, Arc<Vec<TrackedObject>>)>,
}

impl DetectionHistory {
    pub fn push(&mut self, timestamp_ms: i64, objects: Arc<Vec<TrackedObject>>) {
        if self.entries.len() == MAX_HISTORY_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back((timestamp_ms, objects));

        let horizon = timestamp_ms - MAX_HISTORY_SECONDS * 1_000;
        while let Some((oldest, _)) = self.entries.front() {
            if *oldest >= horizon {
                break;
            }
            self.entries.pop_front();
        }
    }

    /// Per-label count of unique objects seen in the last `seconds`.
    ///
    /// Identified objects are deduplicated by `(label, id)` across
    /// snapshots; anonymous detections each count once.
    pub fn unique_counts(&self, seconds: i64, now_ms: i64) -> BTreeMap<String, u64> {
        let cutoff = now_ms - seconds * 1_000;
        let mut identified: HashSet<(&str, u64)> = HashSet::new();
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();

        for (timestamp, objects) in &self.entries {
            if *timestamp < cutoff {
                continue;
            }
            for object in objects.iter() {
                match object.id {
                    Some(id) => {
                        if identified.insert((object.label.as_str(), id)) {
                            *counts.entry(object.label.clone()).or_default() += 1;
                        }
                    }
                    None => *counts.entry(object.label.clone()).or_default() += 1,
                }
            }
        }

        counts
    }
}
