use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    process,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response, Sse, sse},
    routing::get,
};
use futures_util::stream;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, oneshot};

use crate::{
    bus::{ApiReceiver, ApiSender, Event},
    clock,
    history::{DetectionHistory, MAX_HISTORY_SECONDS},
    models::SnapshotRecord,
    streamer::FrameStreamer,
};

/// Bounded wait for a `CountReply`; a silent detection half answers 500
/// instead of hanging the client forever.
const COUNT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Count queries must span at least this long.
const MIN_QUERY_SPAN_MS: i64 = 1_000;

/// A detection older than this downgrades `/health` to degraded.
const RECENT_DETECTION_MS: i64 = 10_000;

/// Reconnect hint attached to every SSE message.
const SSE_RETRY_MS: u64 = 15_000;

/// Cadence of `SetBroadcast` presence reports toward the detection half.
const PRESENCE_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 256;

const ALLOWED_METHODS: &str = "GET, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, Authorization";

const DASHBOARD_HTML: &str = include_str!("../assets/dashboard.html");

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub instance: String,
    /// Origins that may read responses cross-site; everything else gets no
    /// `Access-Control-Allow-Origin` header.
    pub allowed_origins: Vec<String>,
}

/// Shared state of the API half: the outbound bus end plus everything the
/// drain task has learned from the inbound one.
pub struct ApiContext {
    config: ApiConfig,
    bus_tx: ApiSender,
    streamer: FrameStreamer,
    events_tx: broadcast::Sender<Arc<String>>,
    pending_counts: Mutex<HashMap<u64, oneshot::Sender<u64>>>,
    next_correlation_id: AtomicU64,
    latest: Mutex<Option<SnapshotRecord>>,
    history: Mutex<DetectionHistory>,
    dashboard_clients: AtomicUsize,
}

impl ApiContext {
    pub fn new(config: ApiConfig, bus_tx: ApiSender) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            bus_tx,
            streamer: FrameStreamer::new(),
            events_tx,
            pending_counts: Mutex::new(HashMap::new()),
            next_correlation_id: AtomicU64::new(1),
            latest: Mutex::new(None),
            history: Mutex::new(DetectionHistory::default()),
            dashboard_clients: AtomicUsize::new(0),
        })
    }

    fn register_count_request(&self) -> (u64, oneshot::Receiver<u64>) {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_counts
            .lock()
            .unwrap()
            .insert(correlation_id, tx);
        (correlation_id, rx)
    }

    fn abandon_count_request(&self, correlation_id: u64) {
        self.pending_counts.lock().unwrap().remove(&correlation_id);
    }

    /// Whether a counter is known to exist for this instance, plus the
    /// timestamp of the last observed detection.
    ///
    /// Counter creation and the first snapshot happen on the same tick, so
    /// the first `TrackSnapshot` is the signal that the registry entry
    /// exists on the far side of the bus.
    fn counter_info(&self) -> (bool, Option<i64>) {
        let latest = self.latest.lock().unwrap();
        (latest.is_some(), latest.as_ref().map(|record| record.timestamp))
    }
}

pub(crate) enum Flow {
    Continue,
    Fatal,
}

/// Folds one inbound bus event into the API state.
pub(crate) fn apply_event(state: &ApiContext, event: Event) -> Flow {
    match event {
        Event::CountReply {
            count,
            correlation_id,
        } => {
            match state
                .pending_counts
                .lock()
                .unwrap()
                .remove(&correlation_id)
            {
                Some(tx) => {
                    let _ = tx.send(count);
                }
                None => debug!(target: "api", "dropping stale count reply {correlation_id}"),
            }
        }
        Event::VisualizationFrame { jpeg, .. } => state.streamer.send(jpeg),
        Event::Crash => {
            error!(target: "api", "detection half reported a crash");
            return Flow::Fatal;
        }
        event @ (Event::Telemetry { .. } | Event::TrackSnapshot { .. }) => {
            if let Event::TrackSnapshot {
                ref objects,
                timestamp_ms,
                frame_id,
            } = event
            {
                *state.latest.lock().unwrap() = Some(SnapshotRecord {
                    timestamp: timestamp_ms,
                    frame_id,
                    tracked_objects: objects.clone(),
                });
                state
                    .history
                    .lock()
                    .unwrap()
                    .push(timestamp_ms, objects.clone());
            }
            if let Some(payload) = event.dashboard_payload() {
                let _ = state.events_tx.send(Arc::new(payload.to_string()));
            }
        }
        other => debug!(target: "api", "ignoring inbound event: {other:?}"),
    }
    Flow::Continue
}

/// Routes every inbound bus event until the detection half goes away.
///
/// A `Crash` terminates the process immediately; the supervisor is expected
/// to restart it.
pub async fn drain_bus(state: Arc<ApiContext>, mut rx: ApiReceiver) {
    while let Some(event) = rx.recv().await {
        if matches!(apply_event(&state, event), Flow::Fatal) {
            process::exit(1);
        }
    }
    warn!(target: "api", "detection half closed the bus");
}

/// Tells the detection half once a second whether any dashboard client is
/// attached, so it can skip telemetry and JPEG work when nobody watches.
pub async fn report_presence(state: Arc<ApiContext>) {
    let mut ticker = tokio::time::interval(PRESENCE_INTERVAL);
    loop {
        ticker.tick().await;
        let attached = state.dashboard_clients.load(Ordering::Acquire) > 0;
        state.bus_tx.send(Event::SetBroadcast(attached));
    }
}

pub fn router(state: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/online", get(online))
        .route("/dashboard", get(dashboard))
        .route("/dashboard/sse", get(dashboard_sse))
        .route("/cam.jpg", get(cam_jpg))
        .route("/cam/collect", get(cam_collect))
        .route("/cam/play", get(cam_play))
        .route("/cam/pause", get(cam_pause))
        .route("/cam/show_overlay", get(cam_show_overlay))
        .route("/cam/hide_overlay", get(cam_hide_overlay))
        .route("/detections", get(detections))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

/// Binds, spawns the bus tasks and serves until the listener dies.
pub async fn serve(state: Arc<ApiContext>, rx: ApiReceiver, addr: SocketAddr) -> Result<()> {
    tokio::spawn(drain_bus(state.clone(), rx));
    tokio::spawn(report_presence(state.clone()));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "api", "listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn online() -> Json<bool> {
    Json(true)
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

async fn not_found(uri: Uri) -> Response {
    api_error(
        StatusCode::NOT_FOUND,
        format!("No route for {}", uri.path()),
    )
}

#[derive(Debug, Default, Deserialize)]
struct CollectParams {
    from: Option<String>,
    to: Option<String>,
}

async fn cam_collect(
    State(state): State<Arc<ApiContext>>,
    Query(params): Query<CollectParams>,
) -> Response {
    let (Some(from), Some(to)) = (params.from, params.to) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "Missing required parameters: 'from' and 'to'",
        );
    };
    let (Ok(from_ms), Ok(to_ms)) = (from.parse::<i64>(), to.parse::<i64>()) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "Invalid parameters: 'from' and 'to' must be epoch milliseconds",
        );
    };
    if from_ms >= to_ms {
        return api_error(StatusCode::BAD_REQUEST, "Invalid time range");
    }
    if to_ms - from_ms < MIN_QUERY_SPAN_MS {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "Duration must exceed one second, from: {from_ms} to: {to_ms} duration: {}",
                to_ms - from_ms
            ),
        );
    }
    let now_ms = clock::now_ms();
    if to_ms > now_ms || from_ms > now_ms {
        return api_error(StatusCode::BAD_REQUEST, "'from' and 'to' must be in the past");
    }
    let (counter_available, _) = state.counter_info();
    if !counter_available {
        return api_error(
            StatusCode::NOT_FOUND,
            "No data available for the specified camera",
        );
    }

    let (correlation_id, reply) = state.register_count_request();
    state.bus_tx.send(Event::GetCount {
        from_ms,
        to_ms,
        correlation_id,
    });

    match tokio::time::timeout(COUNT_REPLY_TIMEOUT, reply).await {
        Ok(Ok(count)) => Json(json!({ "count": count })).into_response(),
        Ok(Err(_)) | Err(_) => {
            state.abandon_count_request(correlation_id);
            warn!(target: "api", "count request {correlation_id} got no reply");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Timed out waiting for count",
            )
        }
    }
}

async fn cam_play(State(state): State<Arc<ApiContext>>) -> StatusCode {
    info!(target: "api", "resume requested");
    state.bus_tx.send(Event::SetPaused(false));
    StatusCode::OK
}

async fn cam_pause(State(state): State<Arc<ApiContext>>) -> StatusCode {
    info!(target: "api", "pause requested");
    state.bus_tx.send(Event::SetPaused(true));
    StatusCode::OK
}

async fn cam_show_overlay(State(state): State<Arc<ApiContext>>) -> StatusCode {
    state.bus_tx.send(Event::SetHideOverlay(false));
    StatusCode::OK
}

async fn cam_hide_overlay(State(state): State<Arc<ApiContext>>) -> StatusCode {
    state.bus_tx.send(Event::SetHideOverlay(true));
    StatusCode::OK
}

#[derive(Debug, Default, Deserialize)]
struct DetectionsParams {
    from: Option<String>,
}

async fn detections(
    State(state): State<Arc<ApiContext>>,
    Query(params): Query<DetectionsParams>,
) -> Response {
    let Some(raw) = params.from else {
        let latest = state.latest.lock().unwrap().clone();
        return match latest {
            Some(record) => Json(json!([record])).into_response(),
            None => Json(json!([])).into_response(),
        };
    };

    let Ok(seconds) = raw.parse::<i64>() else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "Invalid 'from' parameter. Must be an integer.",
        );
    };
    if !(1..=MAX_HISTORY_SECONDS).contains(&seconds) {
        return api_error(
            StatusCode::BAD_REQUEST,
            "Invalid 'from' parameter. Must be between 1 and 30.",
        );
    }

    let counts = state
        .history
        .lock()
        .unwrap()
        .unique_counts(seconds, clock::now_ms());
    Json(counts).into_response()
}

async fn health(State(state): State<Arc<ApiContext>>) -> Json<serde_json::Value> {
    let now_ms = clock::now_ms();
    let (counter_available, last_detection) = state.counter_info();
    let tracking = counter_available
        && last_detection
            .map(|timestamp| now_ms - timestamp <= RECENT_DETECTION_MS)
            .unwrap_or(false);

    Json(json!({
        "status": if tracking { "healthy" } else { "degraded" },
        "instance": state.config.instance,
        "timestamp": now_ms / 1_000,
        "tracking_status": if tracking { "active" } else { "inactive" },
        "person_counter_available": counter_available,
        "last_detection_time": last_detection,
    }))
}

/// Keeps the dashboard client count honest for the presence reporter, no
/// matter how the SSE stream ends.
struct PresenceGuard {
    state: Arc<ApiContext>,
}

impl PresenceGuard {
    fn new(state: Arc<ApiContext>) -> Self {
        state.dashboard_clients.fetch_add(1, Ordering::AcqRel);
        Self { state }
    }
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        self.state.dashboard_clients.fetch_sub(1, Ordering::AcqRel);
        info!(target: "api", "dashboard client detached");
    }
}

async fn dashboard_sse(
    State(state): State<Arc<ApiContext>>,
) -> Sse<impl futures_util::Stream<Item = Result<sse::Event, Infallible>>> {
    let rx = state.events_tx.subscribe();
    let guard = PresenceGuard::new(state.clone());
    info!(target: "api", "dashboard client attached");

    let stream = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    let event = sse::Event::default()
                        .id(clock::now_ms().to_string())
                        .retry(Duration::from_millis(SSE_RETRY_MS))
                        .data(payload.as_str());
                    return Some((Ok::<_, Infallible>(event), (rx, guard)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "api", "dashboard client lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(sse::KeepAlive::default())
}

async fn cam_jpg(State(state): State<Arc<ApiContext>>) -> Response {
    let subscriber = state.streamer.subscribe();
    let stream = stream::unfold(subscriber, |mut subscriber| async move {
        let jpeg = subscriber.next().await?;
        let mut chunk = Vec::with_capacity(jpeg.len() + 64);
        chunk.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        chunk.extend_from_slice(&jpeg);
        chunk.extend_from_slice(b"\r\n");
        Some((Ok::<_, Infallible>(chunk), subscriber))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .body(Body::from_stream(stream))
        .expect("static response parts")
}

async fn cors(
    State(state): State<Arc<ApiContext>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    apply_cors_headers(
        response.headers_mut(),
        origin,
        &state.config.allowed_origins,
    );
    response
}

fn apply_cors_headers(headers: &mut HeaderMap, origin: Option<HeaderValue>, allowed: &[String]) {
    if let Some(origin) = origin {
        let is_allowed = origin
            .to_str()
            .map(|value| allowed.iter().any(|entry| entry == value))
            .unwrap_or(false);
        if is_allowed {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
}
