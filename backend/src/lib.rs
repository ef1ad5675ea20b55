//! Turns a stream of per-frame tracking results into a bounded-memory
//! occupancy count queryable over arbitrary historical windows, plus a live
//! dashboard feed (telemetry, annotated frames, counts).
//!
//! The pipeline has two halves that share nothing but a pair of one-way
//! channels: a detection half (capture thread + fixed-rate loop driving the
//! external tracker and the occupancy counters) and an API half (axum
//! service translating HTTP/SSE into bus events). The camera and the
//! detector/tracker themselves stay behind the [`CaptureDevice`] and
//! [`Tracker`] seams.

mod api;
mod bus;
mod capture;
mod clock;
mod counter;
mod detect;
mod frame;
mod history;
mod models;
mod perf;
mod render;
mod run;
mod streamer;
mod synthetic;

pub use {
    api::{ApiConfig, ApiContext, router, serve},
    bus::{ApiReceiver, ApiSender, DetectionBus, Event, TelemetryKind, duplex},
    capture::{CaptureDevice, FrameFeed, FrameSource},
    counter::{CounterRegistry, MovementInterval, OccupancyCounter},
    detect::Tracker,
    frame::{FRAME_HEIGHT, FRAME_WIDTH, Frame},
    models::{SnapshotRecord, TrackedObject},
    run::{DetectionLoop, LoopConfig},
    streamer::{FrameStreamer, FrameSubscriber},
    synthetic::{SyntheticDevice, SyntheticTracker},
};
