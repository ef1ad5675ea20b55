use std::sync::Arc;

use serde_json::{Value, json};
use strum::Display;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::models::TrackedObject;

/// Performance sample kinds broadcast to the dashboard.
///
/// The serialized name doubles as the wire `event` tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum TelemetryKind {
    #[strum(serialize = "cam_read_perf")]
    CamRead,
    #[strum(serialize = "inference_perf")]
    Inference,
    #[strum(serialize = "visualization_perf")]
    Visualization,
}

/// Everything that crosses between the detection half and the API half.
///
/// Each event is created by one side, consumed by the other and discarded;
/// nothing is retained past consumption.
#[derive(Clone, Debug)]
pub enum Event {
    SetPaused(bool),
    SetHideOverlay(bool),
    SetBroadcast(bool),
    GetCount {
        from_ms: i64,
        to_ms: i64,
        correlation_id: u64,
    },
    CountReply {
        count: u64,
        correlation_id: u64,
    },
    Telemetry {
        kind: TelemetryKind,
        value: f64,
        mean: f64,
        timestamp_ms: i64,
    },
    TrackSnapshot {
        objects: Arc<Vec<TrackedObject>>,
        timestamp_ms: i64,
        frame_id: u64,
    },
    VisualizationFrame {
        jpeg: Arc<Vec<u8>>,
        timestamp_ms: i64,
    },
    Crash,
}

impl Event {
    /// The JSON forwarded to dashboard subscribers, or `None` for events
    /// that are not part of the push feed.
    pub fn dashboard_payload(&self) -> Option<Value> {
        match self {
            Event::Telemetry {
                kind,
                value,
                mean,
                timestamp_ms,
            } => Some(json!({
                "event": kind.to_string(),
                "value": value,
                "mean": mean,
                "ts": timestamp_ms,
            })),
            Event::TrackSnapshot {
                objects,
                timestamp_ms,
                frame_id,
            } => Some(json!({
                "event": "tracks",
                "results": objects.as_ref(),
                "ts": timestamp_ms,
                "frame_id": frame_id,
            })),
            _ => None,
        }
    }
}

/// The detection half's end of the bus: outbound broadcast plus a
/// non-blocking inbound drain, both usable from synchronous code.
#[derive(Debug)]
pub struct DetectionBus {
    tx: UnboundedSender<Event>,
    rx: UnboundedReceiver<Event>,
}

impl DetectionBus {
    /// Never blocks; a closed peer only means nobody is listening anymore.
    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// The API half's outbound end; clonable across request handlers.
#[derive(Clone, Debug)]
pub struct ApiSender {
    tx: UnboundedSender<Event>,
}

impl ApiSender {
    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// The API half's inbound end, drained by a single task.
#[derive(Debug)]
pub struct ApiReceiver {
    rx: UnboundedReceiver<Event>,
}

impl ApiReceiver {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Builds the two one-directional, unbounded channels linking the halves.
pub fn duplex() -> (DetectionBus, ApiSender, ApiReceiver) {
    let (to_api_tx, to_api_rx) = mpsc::unbounded_channel();
    let (to_detection_tx, to_detection_rx) = mpsc::unbounded_channel();

    (
        DetectionBus {
            tx: to_api_tx,
            rx: to_detection_rx,
        },
        ApiSender {
            tx: to_detection_tx,
        },
        ApiReceiver { rx: to_api_rx },
    )
}
