//! # Wardstream Testing Infrastructure
//!
//! Test doubles and generators shared by the wardstream crates:
//! - [`FakeProbe`] - environment probe with every signal settable at runtime
//! - [`ScriptedTransport`] - event transport replaying scripted opens
//! - [`RecordingSink`] - telemetry sink recording what it was sent
//! - Edge case SSE frames
//! - Property-based testing strategies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wardstream_testing::*;
//!
//! let transport = ScriptedTransport::new(vec![
//!     Script::Fail(WardstreamError::network("refused")),
//!     Script::Open(vec![frames::heartbeat()]),
//! ]);
//! let probe = FakeProbe::new().with_latency(Duration::from_millis(40));
//! let client = StreamClient::new(config, transport.clone(), probe.clone())?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use wardstream_error::{Result, WardstreamError};
use wardstream_stream::{EventKind, EventTransport, SseFrame, StreamClient, StreamEvent, StreamRequest};
use wardstream_telemetry::{QueuedError, TelemetrySink};
use wardstream_traits::{BatteryStatus, ConnectionType, DeviceProfile, EnvironmentProbe};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Environment Probe
// ============================================================================

/// Probe whose signals are set by the test
pub struct FakeProbe {
    online: AtomicBool,
    foreground: AtomicBool,
    latency_ms: AtomicU64,
    probe_fails: AtomicBool,
    connection: Mutex<ConnectionType>,
    battery: Mutex<Option<BatteryStatus>>,
    profile: Mutex<DeviceProfile>,
    latency_probes: AtomicU64,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            online: AtomicBool::new(true),
            foreground: AtomicBool::new(true),
            latency_ms: AtomicU64::new(50),
            probe_fails: AtomicBool::new(false),
            connection: Mutex::new(ConnectionType::Wifi),
            battery: Mutex::new(None),
            profile: Mutex::new(DeviceProfile::default()),
            latency_probes: AtomicU64::new(0),
        }
    }
}

impl FakeProbe {
    /// Online, foregrounded, Wi-Fi, 50ms latency
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Offline device
    pub fn offline() -> Arc<Self> {
        let probe = Self::default();
        probe.online.store(false, Ordering::SeqCst);
        *lock(&probe.connection) = ConnectionType::Offline;
        Arc::new(probe)
    }

    /// Sets the latency, returning the same probe
    pub fn with_latency(self: Arc<Self>, latency: Duration) -> Arc<Self> {
        self.set_latency(latency);
        self
    }

    /// Sets the connection type, returning the same probe
    pub fn with_connection(self: Arc<Self>, connection: ConnectionType) -> Arc<Self> {
        self.set_connection(connection);
        self
    }

    /// Sets the battery, returning the same probe
    pub fn with_battery(self: Arc<Self>, battery: BatteryStatus) -> Arc<Self> {
        self.set_battery(Some(battery));
        self
    }

    /// Sets the device profile, returning the same probe
    pub fn with_profile(self: Arc<Self>, profile: DeviceProfile) -> Arc<Self> {
        *lock(&self.profile) = profile;
        self
    }

    /// 1 GB / 2 core device
    pub fn low_end(self: Arc<Self>) -> Arc<Self> {
        self.with_profile(DeviceProfile {
            memory_gb: Some(1.0),
            cpu_cores: Some(2),
        })
    }

    /// Online flag
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Foreground flag
    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
    }

    /// Latency returned by the next probes
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes latency probes fail
    pub fn set_probe_fails(&self, fails: bool) {
        self.probe_fails.store(fails, Ordering::SeqCst);
    }

    /// Connection type
    pub fn set_connection(&self, connection: ConnectionType) {
        *lock(&self.connection) = connection;
    }

    /// Battery status
    pub fn set_battery(&self, battery: Option<BatteryStatus>) {
        *lock(&self.battery) = battery;
    }

    /// Latency probes performed
    pub fn latency_probes(&self) -> u64 {
        self.latency_probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvironmentProbe for FakeProbe {
    fn connection_type(&self) -> ConnectionType {
        *lock(&self.connection)
    }

    fn battery(&self) -> Option<BatteryStatus> {
        *lock(&self.battery)
    }

    fn is_foregrounded(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn device_profile(&self) -> DeviceProfile {
        lock(&self.profile).clone()
    }

    async fn probe_latency(&self) -> Result<Duration> {
        self.latency_probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(WardstreamError::network("probe failed"));
        }
        Ok(Duration::from_millis(self.latency_ms.load(Ordering::SeqCst)))
    }
}

// ============================================================================
// Event Transport
// ============================================================================

/// What one `open` call does
#[derive(Debug, Clone)]
pub enum Script {
    /// Yields the frames, then stays open
    Open(Vec<SseFrame>),
    /// Yields the items, then closes
    Close(Vec<Result<SseFrame>>),
    /// Fails to open
    Fail(WardstreamError),
}

/// Transport replaying one [`Script`] per open.
///
/// Once the scripts run out every open hangs without frames.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedTransport {
    /// Transport replaying `scripts` in order
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::default(),
        })
    }

    /// Queues another script
    pub fn push(&self, script: Script) {
        lock(&self.scripts).push_back(script);
    }

    /// Number of opens so far
    pub fn opens(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Every request seen, in order
    pub fn requests(&self) -> Vec<StreamRequest> {
        lock(&self.requests).clone()
    }

    /// Most recent request
    pub fn last_request(&self) -> Option<StreamRequest> {
        lock(&self.requests).last().cloned()
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn open(&self, request: &StreamRequest) -> Result<BoxStream<'static, Result<SseFrame>>> {
        lock(&self.requests).push(request.clone());
        let script = lock(&self.scripts)
            .pop_front()
            .unwrap_or(Script::Open(Vec::new()));

        match script {
            Script::Open(frames) => Ok(stream::iter(frames.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Script::Close(items) => Ok(stream::iter(items).boxed()),
            Script::Fail(error) => Err(error),
        }
    }
}

/// Records every event of `kinds` delivered by `client`
pub fn record_events(client: &StreamClient, kinds: &[EventKind]) -> Arc<Mutex<Vec<StreamEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for &kind in kinds {
        let seen = Arc::clone(&seen);
        client.on(kind, move |event| lock(&seen).push(event.clone()));
    }
    seen
}

/// Kinds of the recorded events, in delivery order
pub fn recorded_kinds(seen: &Mutex<Vec<StreamEvent>>) -> Vec<EventKind> {
    lock(seen).iter().map(StreamEvent::kind).collect()
}

// ============================================================================
// Telemetry Sink
// ============================================================================

/// Sink returning scripted responses; `Ok` once they run out
#[derive(Default)]
pub struct RecordingSink {
    responses: Mutex<VecDeque<Result<()>>>,
    batches: Mutex<Vec<Vec<QueuedError>>>,
    singles: Mutex<Vec<QueuedError>>,
}

impl RecordingSink {
    /// Sink that accepts everything
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sink answering with `responses` in order
    pub fn respond(responses: Vec<Result<()>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        })
    }

    /// Batches received, in order
    pub fn batches(&self) -> Vec<Vec<QueuedError>> {
        lock(&self.batches).clone()
    }

    /// Single sends received, in order
    pub fn singles(&self) -> Vec<QueuedError> {
        lock(&self.singles).clone()
    }

    fn next(&self) -> Result<()> {
        lock(&self.responses).pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn send_batch(&self, items: &[QueuedError]) -> Result<()> {
        lock(&self.batches).push(items.to_vec());
        self.next()
    }

    async fn send_single(&self, item: &QueuedError) -> Result<()> {
        lock(&self.singles).push(item.clone());
        self.next()
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Well-formed frames
pub mod frames {
    use wardstream_stream::SseFrame;

    /// Heartbeat with an epoch-millis timestamp
    pub fn heartbeat() -> SseFrame {
        SseFrame::new("heartbeat", r#"{"timestamp":1700000000000}"#)
    }

    /// Analysis result
    pub fn analysis(summary: &str) -> SseFrame {
        SseFrame::new(
            "analysis",
            format!(
                r#"{{"multimodel":false,"result":{{"summary":"{}"}},"confidence_score":0.9}}"#,
                summary
            ),
        )
    }

    /// Priority alert with the given urgency
    pub fn alert(urgency: &str) -> SseFrame {
        SseFrame::new(
            "priority-alert",
            format!(r#"{{"title":"Bed 4","urgency":"{}"}}"#, urgency),
        )
    }

    /// Progress update
    pub fn progress(stage: &str, progress: f64) -> SseFrame {
        SseFrame::new(
            "progress",
            format!(r#"{{"stage":"{}","progress":{}}}"#, stage, progress),
        )
    }
}

/// Frames that must never reach listeners
pub struct EdgeCaseFrames;

impl EdgeCaseFrames {
    /// Non-JSON, wrong-shaped and unknown frames
    pub fn malformed() -> Vec<SseFrame> {
        vec![
            SseFrame::new("analysis", "{not json"),
            SseFrame::new("analysis", "[1, 2, 3]"),
            SseFrame::new("confidence-update", r#"{"score":"high"}"#),
            SseFrame::new("progress", r#"{"progress":0.5}"#),
            SseFrame::new("no-such-event", "{}"),
            SseFrame::new("heartbeat", "\u{0}"),
        ]
    }

    /// Raw byte chunks that split frames at awkward boundaries
    pub fn split_chunks() -> Vec<Vec<u8>> {
        vec![
            b"event: heart".to_vec(),
            b"beat\r\ndata: {\"timestamp\":".to_vec(),
            b"1700000000000}\r\n".to_vec(),
            b"\r\n: keep-alive\n\n".to_vec(),
            b"data: {\"type\":\"progress\",\"stage\":\"x\",".to_vec(),
            b"\"progress\":0.1}\n\n".to_vec(),
        ]
    }
}

// ============================================================================
// Property-Based Testing Strategies
// ============================================================================

/// Any connection type
pub fn connection_type() -> impl Strategy<Value = ConnectionType> {
    prop_oneof![
        Just(ConnectionType::Wifi),
        Just(ConnectionType::Cellular4g),
        Just(ConnectionType::Cellular3g),
        Just(ConnectionType::Slow),
        Just(ConnectionType::Offline),
        Just(ConnectionType::Unknown),
    ]
}

/// Battery level in `[0, 1]` and charging flag
pub fn battery_status() -> impl Strategy<Value = BatteryStatus> {
    (0.0f64..=1.0, any::<bool>()).prop_map(|(level, charging)| BatteryStatus::new(level, charging))
}

/// Optional battery
pub fn maybe_battery() -> impl Strategy<Value = Option<BatteryStatus>> {
    proptest::option::of(battery_status())
}

/// Probe latency up to 5s
pub fn latency() -> impl Strategy<Value = Duration> {
    (0u64..5_000).prop_map(Duration::from_millis)
}

/// Well-formed data frame
pub fn data_frame() -> impl Strategy<Value = SseFrame> {
    prop_oneof![
        "[a-z ]{0,24}".prop_map(|s| frames::analysis(&s)),
        prop_oneof![Just("low"), Just("medium"), Just("high"), Just("critical")]
            .prop_map(frames::alert),
        ("[a-z]{1,8}", 0.0f64..=1.0).prop_map(|(stage, p)| frames::progress(&stage, p)),
    ]
}

/// Arbitrary text split into arbitrary chunks
pub fn chunked_bytes() -> impl Strategy<Value = (Vec<u8>, Vec<usize>)> {
    (
        proptest::collection::vec(any::<u8>(), 0..512),
        proptest::collection::vec(1usize..64, 0..16),
    )
}
