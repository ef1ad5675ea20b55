use std::collections::HashMap;

use log::debug;

use crate::models::TrackedObject;

/// Detections at or below this confidence never reach a counter.
pub const CONFIDENCE_THRESHOLD: f32 = 0.8;

/// Tracks whose lifespan does not exceed this span are treated as
/// single-frame noise and never counted.
pub const MIN_TRACK_SPAN_MS: i64 = 300;

/// Upper bound on retained movement intervals per counter.
pub const DEFAULT_TRACK_LIMIT: usize = 10_000;

/// Minimum gap between two effective cleanups.
const CLEANUP_INTERVAL_MS: i64 = 1_000;

/// The span between first and last sighting of one track id.
///
/// Created on first sighting, `last_seen_ms` bumped on every later one,
/// never otherwise mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MovementInterval {
    pub track_id: u64,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
}

/// Time-windowed occupancy counter for a single class label.
///
/// Holds every movement interval seen since boot (bounded by
/// [`Self::cleanup`]) plus a track-id index for O(1) updates. Counting is an
/// overlap test between the query window and each interval, so a track is
/// counted at most once per window no matter how many updates it produced.
#[derive(Debug)]
pub struct OccupancyCounter {
    label: String,
    intervals: Vec<MovementInterval>,
    by_track_id: HashMap<u64, usize>,
    track_limit: usize,
    last_cleanup_ms: i64,
    count_since_boot: u64,
}

impl OccupancyCounter {
    pub fn new(label: impl Into<String>, now_ms: i64) -> Self {
        Self::with_track_limit(label, now_ms, DEFAULT_TRACK_LIMIT)
    }

    pub fn with_track_limit(label: impl Into<String>, now_ms: i64, track_limit: usize) -> Self {
        Self {
            label: label.into(),
            intervals: Vec::new(),
            by_track_id: HashMap::new(),
            track_limit,
            last_cleanup_ms: now_ms,
            count_since_boot: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Folds one tick of tracker output into the movement intervals.
    ///
    /// Only confident, identified detections of this counter's label are
    /// considered; each one either bumps its interval's `last_seen_ms` or
    /// opens a fresh `[now, now]` interval.
    pub fn update(&mut self, objects: &[TrackedObject], now_ms: i64) {
        for object in objects {
            if object.label != self.label || object.confidence <= CONFIDENCE_THRESHOLD {
                continue;
            }
            let Some(track_id) = object.id else {
                continue;
            };

            match self.by_track_id.get(&track_id) {
                Some(&index) => self.intervals[index].last_seen_ms = now_ms,
                None => {
                    self.count_since_boot += 1;
                    self.by_track_id.insert(track_id, self.intervals.len());
                    self.intervals.push(MovementInterval {
                        track_id,
                        first_seen_ms: now_ms,
                        last_seen_ms: now_ms,
                    });
                }
            }
        }
    }

    /// Number of distinct tracks whose lifespan overlaps `[from_ms, to_ms]`
    /// and exceeds the noise floor.
    ///
    /// Opportunistically runs [`Self::cleanup`] afterwards.
    pub fn get_count(&mut self, from_ms: i64, to_ms: i64, now_ms: i64) -> u64 {
        let count = self
            .intervals
            .iter()
            .filter(|interval| {
                interval.first_seen_ms < to_ms
                    && interval.last_seen_ms > from_ms
                    && interval.last_seen_ms - interval.first_seen_ms > MIN_TRACK_SPAN_MS
            })
            .count() as u64;

        self.cleanup(now_ms);

        count
    }

    /// Monotonic number of intervals ever created; unaffected by cleanup.
    pub fn get_count_since_boot(&self) -> u64 {
        self.count_since_boot
    }

    pub(crate) fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    /// Bounds memory under track-id churn by keeping only the most recently
    /// active intervals.
    ///
    /// Takes effect only once per [`CLEANUP_INTERVAL_MS`] and only when the
    /// interval list has reached the track limit. Evicted track ids lose
    /// their history: a later sighting opens a brand-new interval.
    fn cleanup(&mut self, now_ms: i64) {
        if now_ms - self.last_cleanup_ms < CLEANUP_INTERVAL_MS {
            return;
        }
        if self.intervals.len() < self.track_limit {
            return;
        }
        self.last_cleanup_ms = now_ms;

        self.intervals
            .sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));
        self.intervals.truncate(self.track_limit);
        self.by_track_id = self
            .intervals
            .iter()
            .enumerate()
            .map(|(index, interval)| (interval.track_id, index))
            .collect();

        debug!(
            target: "counter",
            "cleanup kept {} intervals for label {}",
            self.intervals.len(),
            self.label
        );
    }
}

/// Per-instance counters, lazily created on first use.
///
/// Owned by the detection loop; nothing else holds counter state.
#[derive(Debug)]
pub struct CounterRegistry {
    target_label: String,
    counters: HashMap<String, OccupancyCounter>,
}

impl CounterRegistry {
    pub fn new(target_label: impl Into<String>) -> Self {
        Self {
            target_label: target_label.into(),
            counters: HashMap::new(),
        }
    }

    pub fn counter_mut(&mut self, instance: &str, now_ms: i64) -> &mut OccupancyCounter {
        self.counters
            .entry(instance.to_string())
            .or_insert_with(|| OccupancyCounter::new(self.target_label.clone(), now_ms))
    }

    pub fn get(&self, instance: &str) -> Option<&OccupancyCounter> {
        self.counters.get(instance)
    }
}
