use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use log::{debug, error, info, warn};

use crate::{
    bus::{DetectionBus, Event, TelemetryKind},
    capture::FrameFeed,
    clock,
    counter::CounterRegistry,
    detect::Tracker,
    frame::Frame,
    models::TrackedObject,
    perf::{RollingMean, round2},
    render,
};

/// Nominal tick period of the detection loop (~10 Hz).
pub const TICK_MS: u64 = 100;

/// Floor on the post-tick sleep so an overlong tick cannot turn the loop
/// into a busy spin.
pub const MIN_SLEEP_MS: u64 = 10;

/// Consecutive failed frame reads tolerated before escalating to
/// [`Event::Crash`].
const READ_FAILURE_LIMIT: u32 = 10;

/// Ticks discarded while capture and inference timings settle.
const WARMUP_TICKS: u64 = 3;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Camera/instance identifier; keys the counter registry and shows up
    /// in every log line.
    pub instance: String,
    /// Class label fed to the occupancy counters.
    pub target_class: String,
}

/// The per-tick driver of the whole detection half.
///
/// Owns the tracker, the counter registry and the detection end of the
/// event bus. Runs on its own thread; everything it shares with the API
/// half goes through the bus.
pub struct DetectionLoop {
    config: LoopConfig,
    bus: DetectionBus,
    feed: Box<dyn FrameFeed>,
    tracker: Box<dyn Tracker>,
    registry: CounterRegistry,
    paused: bool,
    hide_overlay: bool,
    broadcast: bool,
    tick: u64,
    read_failures: u32,
    cam_read_perf: RollingMean,
    inference_perf: RollingMean,
    render_perf: RollingMean,
    last_status_log: Instant,
}

impl DetectionLoop {
    pub fn new(
        config: LoopConfig,
        bus: DetectionBus,
        feed: Box<dyn FrameFeed>,
        tracker: Box<dyn Tracker>,
    ) -> Self {
        let registry = CounterRegistry::new(config.target_class.clone());
        Self {
            config,
            bus,
            feed,
            tracker,
            registry,
            paused: false,
            hide_overlay: false,
            broadcast: false,
            tick: 0,
            read_failures: 0,
            cam_read_perf: RollingMean::default(),
            inference_perf: RollingMean::default(),
            render_perf: RollingMean::default(),
            last_status_log: Instant::now(),
        }
    }

    /// Spawns the loop on a dedicated thread.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("detection".to_string())
            .spawn(move || {
                if let Err(err) = self.run() {
                    error!(target: "detection", "detection loop exited: {err:#}");
                }
            })
            .expect("spawnable thread")
    }

    /// Ticks forever at the nominal rate, self-correcting for tick
    /// duration. Only repeated frame starvation ends the loop.
    pub fn run(mut self) -> Result<()> {
        info!(
            target: "detection",
            "detection loop started for instance {}", self.config.instance
        );

        loop {
            let started = Instant::now();
            self.step(clock::now_ms())?;

            let wait = Duration::from_millis(TICK_MS)
                .saturating_sub(started.elapsed())
                .max(Duration::from_millis(MIN_SLEEP_MS));
            thread::sleep(wait);
        }
    }

    pub(crate) fn step(&mut self, now_ms: i64) -> Result<()> {
        self.drain_events(now_ms);
        if self.paused {
            return Ok(());
        }
        self.tick += 1;

        let read_started = Instant::now();
        let Some(frame) = self.feed.read() else {
            return self.on_read_failure();
        };
        self.read_failures = 0;
        self.sample(TelemetryKind::CamRead, read_started.elapsed(), now_ms);

        let inference_started = Instant::now();
        let objects = match self.tracker.track(&frame) {
            Ok(objects) => objects,
            Err(err) => {
                error!(target: "detection", "tracker failed: {err:#}");
                return Ok(());
            }
        };
        self.sample(TelemetryKind::Inference, inference_started.elapsed(), now_ms);

        self.registry
            .counter_mut(&self.config.instance, now_ms)
            .update(&objects, now_ms);

        let objects = Arc::new(objects);
        if self.tick >= WARMUP_TICKS {
            self.bus.send(Event::TrackSnapshot {
                objects: objects.clone(),
                timestamp_ms: now_ms,
                frame_id: self.tick,
            });
        }
        if self.broadcast {
            self.visualize(&frame, &objects, now_ms);
        }

        self.log_status();
        Ok(())
    }

    fn drain_events(&mut self, now_ms: i64) {
        while let Some(event) = self.bus.try_recv() {
            match event {
                Event::SetPaused(paused) => {
                    info!(target: "detection", "paused set to {paused}");
                    self.paused = paused;
                }
                Event::SetHideOverlay(hide) => self.hide_overlay = hide,
                Event::SetBroadcast(enabled) => {
                    if enabled != self.broadcast {
                        debug!(target: "detection", "dashboard broadcast set to {enabled}");
                    }
                    self.broadcast = enabled;
                }
                Event::GetCount {
                    from_ms,
                    to_ms,
                    correlation_id,
                } => {
                    let count = self
                        .registry
                        .counter_mut(&self.config.instance, now_ms)
                        .get_count(from_ms, to_ms, now_ms);
                    self.bus.send(Event::CountReply {
                        count,
                        correlation_id,
                    });
                }
                other => debug!(target: "detection", "ignoring inbound event: {other:?}"),
            }
        }
    }

    fn on_read_failure(&mut self) -> Result<()> {
        self.read_failures += 1;
        warn!(
            target: "detection",
            "no frame from capture ({} consecutive)", self.read_failures
        );
        if self.read_failures > READ_FAILURE_LIMIT {
            self.bus.send(Event::Crash);
            bail!(
                "frame acquisition failed {} times in a row",
                self.read_failures
            );
        }
        Ok(())
    }

    fn sample(&mut self, kind: TelemetryKind, elapsed: Duration, now_ms: i64) {
        if self.tick < WARMUP_TICKS {
            return;
        }

        let value = elapsed.as_secs_f64() * 1_000.0;
        let rolling = match kind {
            TelemetryKind::CamRead => &mut self.cam_read_perf,
            TelemetryKind::Inference => &mut self.inference_perf,
            TelemetryKind::Visualization => &mut self.render_perf,
        };
        rolling.push(value);
        let mean = rolling.mean();

        if self.broadcast {
            self.bus.send(Event::Telemetry {
                kind,
                value: round2(value),
                mean: round2(mean),
                timestamp_ms: now_ms,
            });
        }
    }

    fn visualize(&mut self, frame: &Frame, objects: &[TrackedObject], now_ms: i64) {
        let render_started = Instant::now();
        let image = if self.hide_overlay {
            frame.image.clone()
        } else {
            render::annotate(&frame.image, objects)
        };

        match render::encode_jpeg(&image, render::JPEG_QUALITY) {
            Ok(jpeg) => self.bus.send(Event::VisualizationFrame {
                jpeg: Arc::new(jpeg),
                timestamp_ms: now_ms,
            }),
            Err(err) => error!(target: "detection", "visualization encode failed: {err:#}"),
        }

        self.sample(TelemetryKind::Visualization, render_started.elapsed(), now_ms);
    }

    fn log_status(&mut self) {
        if self.last_status_log.elapsed() < STATUS_LOG_INTERVAL {
            return;
        }
        self.last_status_log = Instant::now();
        info!(
            target: "detection",
            "tick {}, mean inference time {:.2}ms",
            self.tick,
            self.inference_perf.mean()
        );
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;
    use crate::{
        bus::{ApiReceiver, ApiSender, duplex},
        capture::MockFrameFeed,
        detect::MockTracker,
        frame::{FRAME_HEIGHT, FRAME_WIDTH},
    };

    const T0: i64 = 1_700_000_000_000;

    fn test_frame() -> Arc<Frame> {
        Arc::new(Frame::new(RgbImage::new(FRAME_WIDTH, FRAME_HEIGHT), T0))
    }

    fn person(id: u64) -> TrackedObject {
        TrackedObject::new(Some(id), "person", [10.0, 10.0, 60.0, 120.0], 0.92)
    }

    fn test_loop(
        feed: MockFrameFeed,
        tracker: MockTracker,
    ) -> (DetectionLoop, ApiSender, ApiReceiver) {
        let (detection_bus, api_tx, api_rx) = duplex();
        let config = LoopConfig {
            instance: "cam0".to_string(),
            target_class: "person".to_string(),
        };
        let detection_loop =
            DetectionLoop::new(config, detection_bus, Box::new(feed), Box::new(tracker));
        (detection_loop, api_tx, api_rx)
    }

    fn drain(api_rx: &mut ApiReceiver) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = api_rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn paused_loop_answers_count_requests_without_detecting() {
        let feed = MockFrameFeed::new();
        let tracker = MockTracker::new();
        let (mut detection_loop, api_tx, mut api_rx) = test_loop(feed, tracker);

        api_tx.send(Event::SetPaused(true));
        api_tx.send(Event::GetCount {
            from_ms: T0 - 10_000,
            to_ms: T0,
            correlation_id: 77,
        });
        detection_loop.step(T0).unwrap();

        let events = drain(&mut api_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Event::CountReply {
                count: 0,
                correlation_id: 77,
            }
        ));
    }

    #[test]
    fn counted_tracks_are_reported_through_the_bus() {
        let mut feed = MockFrameFeed::new();
        feed.expect_read().returning(|| Some(test_frame()));
        let mut tracker = MockTracker::new();
        tracker.expect_track().returning(|_| Ok(vec![person(5)]));
        let (mut detection_loop, api_tx, mut api_rx) = test_loop(feed, tracker);

        detection_loop.step(T0).unwrap();
        detection_loop.step(T0 + 400).unwrap();
        api_tx.send(Event::GetCount {
            from_ms: T0 - 100,
            to_ms: T0 + 500,
            correlation_id: 9,
        });
        detection_loop.step(T0 + 500).unwrap();

        let reply = drain(&mut api_rx)
            .into_iter()
            .find(|event| matches!(event, Event::CountReply { .. }))
            .unwrap();
        assert!(matches!(
            reply,
            Event::CountReply {
                count: 1,
                correlation_id: 9,
            }
        ));
    }

    #[test]
    fn snapshots_flow_after_warmup_without_broadcast() {
        let mut feed = MockFrameFeed::new();
        feed.expect_read().returning(|| Some(test_frame()));
        let mut tracker = MockTracker::new();
        tracker.expect_track().returning(|_| Ok(vec![person(1)]));
        let (mut detection_loop, _api_tx, mut api_rx) = test_loop(feed, tracker);

        for i in 0..3 {
            detection_loop.step(T0 + i * 100).unwrap();
        }

        let events = drain(&mut api_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::TrackSnapshot {
                objects, frame_id, ..
            } => {
                assert_eq!(*frame_id, 3);
                assert_eq!(objects[0].id, Some(1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn broadcast_enables_telemetry_and_visualization() {
        let mut feed = MockFrameFeed::new();
        feed.expect_read().returning(|| Some(test_frame()));
        let mut tracker = MockTracker::new();
        tracker.expect_track().returning(|_| Ok(vec![person(1)]));
        let (mut detection_loop, api_tx, mut api_rx) = test_loop(feed, tracker);

        api_tx.send(Event::SetBroadcast(true));
        for i in 0..3 {
            detection_loop.step(T0 + i * 100).unwrap();
        }

        let events = drain(&mut api_rx);
        let telemetry: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::Telemetry { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            telemetry,
            vec![
                TelemetryKind::CamRead,
                TelemetryKind::Inference,
                TelemetryKind::Visualization,
            ]
        );
        assert!(
            events
                .iter()
                .any(|event| matches!(event, Event::VisualizationFrame { .. }))
        );
        assert!(
            events
                .iter()
                .any(|event| matches!(event, Event::TrackSnapshot { .. }))
        );
    }

    #[test]
    fn tracker_failure_is_not_fatal() {
        let mut feed = MockFrameFeed::new();
        feed.expect_read().returning(|| Some(test_frame()));
        let mut tracker = MockTracker::new();
        tracker
            .expect_track()
            .returning(|_| Err(anyhow::anyhow!("model exploded")));
        let (mut detection_loop, _api_tx, mut api_rx) = test_loop(feed, tracker);

        for i in 0..5 {
            detection_loop.step(T0 + i * 100).unwrap();
        }
        assert!(drain(&mut api_rx).is_empty());
    }

    #[test]
    fn starvation_escalates_to_crash_after_limit() {
        let mut feed = MockFrameFeed::new();
        feed.expect_read().returning(|| None);
        let tracker = MockTracker::new();
        let (mut detection_loop, _api_tx, mut api_rx) = test_loop(feed, tracker);

        for i in 0..10 {
            detection_loop.step(T0 + i * 100).unwrap();
        }
        assert!(drain(&mut api_rx).is_empty());

        let fatal = detection_loop.step(T0 + 1_100);
        assert!(fatal.is_err());
        let events = drain(&mut api_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Crash));
    }

    #[test]
    fn successful_read_resets_failure_streak() {
        let mut feed = MockFrameFeed::new();
        let mut sequence = mockall::Sequence::new();
        for _ in 0..9 {
            feed.expect_read()
                .times(1)
                .in_sequence(&mut sequence)
                .returning(|| None);
        }
        feed.expect_read()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Some(test_frame()));
        for _ in 0..11 {
            feed.expect_read()
                .times(1)
                .in_sequence(&mut sequence)
                .returning(|| None);
        }
        let mut tracker = MockTracker::new();
        tracker.expect_track().returning(|_| Ok(Vec::new()));
        let (mut detection_loop, _api_tx, mut api_rx) = test_loop(feed, tracker);

        for i in 0..20 {
            detection_loop.step(T0 + i * 100).unwrap();
        }
        // 9 failures, one good read, then a fresh streak of 11.
        assert!(detection_loop.step(T0 + 2_100).is_err());
        assert!(
            drain(&mut api_rx)
                .iter()
                .any(|event| matches!(event, Event::Crash))
        );
    }
}
