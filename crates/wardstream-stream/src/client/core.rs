use super::config::{StreamConfig, StreamParams};
use super::state::{ConnectionMetrics, ConnectionState, ConnectionStatus, Counters};
use crate::bus::{EventBus, ListenerId};
use crate::event::{EventKind, StreamEvent};
use crate::heartbeat::HeartbeatTracker;
use crate::network::NetworkQualityMonitor;
use crate::priority::{infer_priority, EnqueueOutcome, MessagePriority, MessagePriorityQueue};
use crate::sse::SseFrame;
use crate::task_manager::TaskManager;
use crate::transport::{EventTransport, HttpEventTransport, HttpTransportConfig, StreamRequest};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use wardstream_error::{Result, WardstreamError};
use wardstream_resilience::{
    typed_should_retry, AdaptiveBackoff, CircuitBreaker, CircuitBreakerError, RetryAttempt,
    RetryOptions, RetryStrategy,
};
use wardstream_traits::EnvironmentProbe;

type FrameStream = BoxStream<'static, Result<SseFrame>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Session {
    resource_key: String,
    params: StreamParams,
    tasks: TaskManager,
}

enum SessionEnd {
    Dropped(WardstreamError),
    QualityRecovered,
}

struct ClientInner {
    config: StreamConfig,
    transport: Arc<dyn EventTransport>,
    probe: Arc<dyn EnvironmentProbe>,
    monitor: Arc<NetworkQualityMonitor>,
    breaker: CircuitBreaker<AdaptiveBackoff>,
    bus: EventBus,
    queue: Mutex<MessagePriorityQueue>,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    counters: Counters,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    last_heartbeat: Mutex<Option<Instant>>,
}

/// Resilient server-push client
///
/// One stream at a time; `connect` replaces any existing stream. Dropping
/// the client aborts its background tasks.
pub struct StreamClient {
    inner: Arc<ClientInner>,
}

impl StreamClient {
    /// Creates a client over `transport`, probing `probe` for quality
    pub fn new(
        config: StreamConfig,
        transport: Arc<dyn EventTransport>,
        probe: Arc<dyn EnvironmentProbe>,
    ) -> Result<Self> {
        let monitor = Arc::new(NetworkQualityMonitor::new(
            Arc::clone(&probe),
            config.quality.clone(),
        ));
        Self::with_monitor(config, transport, probe, monitor)
    }

    /// Creates a client over HTTP with default transport settings
    pub fn http(config: StreamConfig, probe: Arc<dyn EnvironmentProbe>) -> Result<Self> {
        let transport = HttpEventTransport::new(HttpTransportConfig::default())?;
        Self::new(config, Arc::new(transport), probe)
    }

    /// Creates a client sharing an existing quality monitor
    pub fn with_monitor(
        config: StreamConfig,
        transport: Arc<dyn EventTransport>,
        probe: Arc<dyn EnvironmentProbe>,
        monitor: Arc<NetworkQualityMonitor>,
    ) -> Result<Self> {
        config.validate()?;

        let strategy = AdaptiveBackoff::new(config.backoff.clone(), config.adaptive.clone());
        let breaker = CircuitBreaker::new(config.breaker.clone(), strategy);
        let queue = MessagePriorityQueue::new(config.queue.clone());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let counters = Counters::default();
        let interval = config.heartbeat.interval_from_probe(probe.as_ref());
        counters
            .heartbeat_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                probe,
                monitor,
                breaker,
                bus: EventBus::new(),
                queue: Mutex::new(queue),
                state_tx,
                session: Mutex::new(None),
                counters,
                connected_since: Mutex::new(None),
                last_heartbeat: Mutex::new(None),
            }),
        })
    }

    /// Starts streaming `resource_key`, tearing down any current stream.
    ///
    /// Returns once the supervisor is running; progress is reported through
    /// `Connected`, `Reconnecting` and `Disconnected` events.
    pub async fn connect(&self, resource_key: impl Into<String>, params: StreamParams) -> Result<()> {
        let resource_key = resource_key.into();
        if resource_key.trim().is_empty() {
            return Err(WardstreamError::Config(
                "resource key must not be empty".to_string(),
            ));
        }

        if let Some(previous) = self.teardown().await {
            tracing::debug!(previous = %previous, next = %resource_key, "Replacing stream");
        }
        lock(&self.inner.queue).clear();
        self.inner.set_state(ConnectionState::Connecting);

        let mut tasks = TaskManager::new();
        tasks.spawn(supervise(
            Arc::clone(&self.inner),
            resource_key.clone(),
            params.clone(),
        ));
        if let Some(interval) = self.inner.config.quality_probe_interval {
            let monitor = Arc::clone(&self.inner.monitor);
            tasks.spawn(async move { monitor.run(interval).await });
        }

        tracing::info!(
            resource = %resource_key,
            endpoint = %self.inner.config.endpoint,
            "Stream connecting"
        );
        *lock(&self.inner.session) = Some(Session {
            resource_key,
            params,
            tasks,
        });
        Ok(())
    }

    /// Closes the stream and stops every timer. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let Some(resource_key) = self.teardown().await else {
            return;
        };

        lock(&self.inner.queue).clear();
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.bus.emit(&StreamEvent::Disconnected {
            resource_key: resource_key.clone(),
            reason: "manual".to_string(),
        });
        tracing::info!(resource = %resource_key, "Stream disconnected");
    }

    /// Re-opens the current resource with its original parameters
    pub async fn reconnect(&self) -> Result<()> {
        let current = lock(&self.inner.session)
            .as_ref()
            .map(|s| (s.resource_key.clone(), s.params.clone()));
        let Some((resource_key, params)) = current else {
            return Err(WardstreamError::InvalidState(
                "no stream to reconnect".to_string(),
            ));
        };

        Counters::bump(&self.inner.counters.reconnects);
        self.connect(resource_key, params).await
    }

    async fn teardown(&self) -> Option<String> {
        let session = lock(&self.inner.session).take()?;
        let Session {
            resource_key,
            mut tasks,
            ..
        } = session;
        tasks.shutdown().await;

        *lock(&self.inner.connected_since) = None;
        *lock(&self.inner.last_heartbeat) = None;
        Some(resource_key)
    }

    /// Subscribes `handler` to events of `kind`
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, handler)
    }

    /// Removes a subscription
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.bus.off(kind, id)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Point-in-time summary
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state(),
            resource_key: lock(&self.inner.session)
                .as_ref()
                .map(|s| s.resource_key.clone()),
            quality: self.inner.monitor.tier(),
            circuit: self.inner.breaker.state(),
        }
    }

    /// Connection counters
    pub fn metrics(&self) -> ConnectionMetrics {
        let counters = &self.inner.counters;
        ConnectionMetrics {
            messages_received: Counters::get(&counters.received),
            messages_delivered: Counters::get(&counters.delivered),
            messages_throttled: Counters::get(&counters.throttled),
            malformed_messages: Counters::get(&counters.malformed),
            heartbeats: Counters::get(&counters.heartbeats),
            reconnects: Counters::get(&counters.reconnects),
            heartbeat_interval: Duration::from_millis(Counters::get(
                &counters.heartbeat_interval_ms,
            )),
            last_heartbeat_age: lock(&self.inner.last_heartbeat).map(|at| at.elapsed()),
            connected_since: *lock(&self.inner.connected_since),
            queued: lock(&self.inner.queue).len(),
        }
    }

    /// Breaker guarding stream opens
    pub fn breaker(&self) -> &CircuitBreaker<AdaptiveBackoff> {
        &self.inner.breaker
    }

    /// Quality monitor driving adaptation
    pub fn monitor(&self) -> &Arc<NetworkQualityMonitor> {
        &self.inner.monitor
    }

    /// Client configuration
    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        let session = lock(&self.inner.session).take();
        drop(session);
    }
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.inner.config.endpoint.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!(from = %current, to = %next, "Connection state changed");
            *current = next;
            true
        });
    }

    fn deliver(&self, event: &StreamEvent) {
        self.bus.emit(event);
        Counters::bump(&self.counters.delivered);
    }

    fn degraded(&self) -> bool {
        self.monitor.tier().is_some_and(|tier| tier.is_degraded())
    }

    fn build_request(&self, resource_key: &str, params: &StreamParams) -> StreamRequest {
        let mut request =
            StreamRequest::new(self.config.endpoint.clone()).with_param("resourceKey", resource_key);
        for (key, value) in [
            ("priority", &params.priority),
            ("depth", &params.depth),
            ("context", &params.context),
        ] {
            if let Some(value) = value {
                request = request.with_param(key, value.as_str());
            }
        }
        request = request
            .with_param("include_confidence", params.include_confidence.to_string())
            .with_param("include_progress", params.include_progress.to_string())
            .with_param("format", params.format.as_str());

        if self.degraded() || self.probe.device_profile().is_low_end() {
            request = request
                .with_param("payload_filter", "essential")
                .with_param("compression", "gzip");
        }
        request
    }

    fn handle_frame(&self, resource_key: &str, frame: &SseFrame, tracker: &mut HeartbeatTracker) {
        Counters::bump(&self.counters.received);

        let event = match StreamEvent::from_frame(frame) {
            Ok(event) => event,
            Err(error) => {
                Counters::bump(&self.counters.malformed);
                tracing::warn!(
                    resource = %resource_key,
                    event = frame.event_name(),
                    error = %error,
                    "Dropping malformed event"
                );
                return;
            }
        };

        if matches!(event, StreamEvent::Heartbeat(_)) {
            tracker.beat();
            Counters::bump(&self.counters.heartbeats);
            *lock(&self.last_heartbeat) = Some(Instant::now());
            self.deliver(&event);
            return;
        }

        if infer_priority(&event) == MessagePriority::Critical {
            self.deliver(&event);
            return;
        }

        let outcome = lock(&self.queue).enqueue(event, resource_key);
        if outcome == EnqueueOutcome::Throttled {
            Counters::bump(&self.counters.throttled);
        }
    }

    fn flush_queue(&self) {
        let batch = lock(&self.queue).drain_batch();
        for message in batch {
            self.deliver(&message.event);
        }
    }

    fn flush_pending(&self) {
        loop {
            let batch = lock(&self.queue).drain_batch();
            if batch.is_empty() {
                return;
            }
            for message in batch {
                self.deliver(&message.event);
            }
        }
    }

    fn adapt(&self, tracker: &mut HeartbeatTracker) {
        let previous = tracker.interval();
        let next = self.config.heartbeat.interval_from_probe(self.probe.as_ref());
        if tracker.retune(&self.config.heartbeat, next) {
            self.counters
                .heartbeat_interval_ms
                .store(next.as_millis() as u64, Ordering::Relaxed);
            tracing::info!(from = ?previous, to = ?next, "Heartbeat interval adjusted");
        }
        self.adapt_queue();
    }

    fn adapt_queue(&self) {
        let backgrounded = !self.probe.is_foregrounded();
        let reduce = self.degraded();
        let mut queue = lock(&self.queue);
        queue.set_backgrounded(backgrounded);
        queue.set_payload_reduction(reduce);
    }

    fn fail(&self, resource_key: &str, reason: &str, error: &WardstreamError) {
        tracing::error!(
            resource = %resource_key,
            reason,
            error = %error,
            "Stream connection failed"
        );
        lock(&self.queue).clear();
        *lock(&self.connected_since) = None;
        self.set_state(ConnectionState::Failed);
        self.bus.emit(&StreamEvent::Disconnected {
            resource_key: resource_key.to_string(),
            reason: reason.to_string(),
        });
    }
}

async fn open_stream(
    inner: &Arc<ClientInner>,
    resource_key: &str,
    params: &StreamParams,
) -> std::result::Result<FrameStream, CircuitBreakerError<WardstreamError>> {
    let request = inner.build_request(resource_key, params);
    let notify = Arc::clone(inner);
    let options = RetryOptions::new(format!("stream:{}", resource_key))
        .with_should_retry(typed_should_retry)
        .with_on_retry(move |attempt: &RetryAttempt<'_, WardstreamError>| {
            notify.set_state(ConnectionState::Retrying);
            notify.bus.emit(&StreamEvent::Reconnecting {
                attempt: attempt.next_attempt,
                delay: attempt.delay,
            });
        });

    let transport = Arc::clone(&inner.transport);
    inner
        .breaker
        .execute(
            |attempt| {
                let transport = Arc::clone(&transport);
                let request = request.clone();
                async move {
                    tracing::debug!(attempt, url = %request.endpoint, "Opening event stream");
                    transport.open(&request).await
                }
            },
            options,
        )
        .await
}

async fn supervise(inner: Arc<ClientInner>, resource_key: String, params: StreamParams) {
    let max_drops = inner.config.backoff.max_retries;
    let mut drops: u32 = 0;

    loop {
        let frames = match open_stream(&inner, &resource_key, &params).await {
            Ok(frames) => frames,
            Err(CircuitBreakerError::CircuitOpen(open)) => {
                tracing::warn!(
                    resource = %resource_key,
                    retry_after = ?open.retry_after,
                    "Circuit open, deferring connect"
                );
                inner.set_state(ConnectionState::Retrying);
                inner.bus.emit(&StreamEvent::Error {
                    message: open.to_string(),
                });
                tokio::time::sleep(open.retry_after).await;
                continue;
            }
            Err(CircuitBreakerError::Retry(err)) => {
                let reason = if err.is_exhausted() {
                    "max_retries_exceeded"
                } else {
                    "fatal"
                };
                inner.fail(&resource_key, reason, err.last_error());
                return;
            }
        };

        *lock(&inner.connected_since) = Some(Utc::now());
        inner.set_state(ConnectionState::Connected);
        inner.bus.emit(&StreamEvent::Connected {
            resource_key: resource_key.clone(),
        });
        tracing::info!(resource = %resource_key, "Stream connected");

        let (end, healthy) = run_session(&inner, &resource_key, frames).await;
        *lock(&inner.connected_since) = None;
        inner.flush_pending();

        match end {
            SessionEnd::QualityRecovered => {
                drops = 0;
                Counters::bump(&inner.counters.reconnects);
                tracing::info!(resource = %resource_key, "Network recovered, reconnecting");
                inner.set_state(ConnectionState::Connecting);
            }
            SessionEnd::Dropped(error) => {
                let strategy = inner.breaker.strategy();
                strategy.record_outcome(false);
                if healthy {
                    drops = 0;
                }
                drops += 1;
                if drops > max_drops {
                    inner.fail(&resource_key, "max_retries_exceeded", &error);
                    return;
                }

                let delay = strategy
                    .backoff()
                    .delay_for_attempt(drops - 1, strategy.adaptive_multiplier());
                tracing::warn!(
                    resource = %resource_key,
                    drops,
                    delay = ?delay,
                    error = %error,
                    "Stream dropped, reconnecting"
                );
                Counters::bump(&inner.counters.reconnects);
                inner.set_state(ConnectionState::Retrying);
                inner.bus.emit(&StreamEvent::Error {
                    message: error.to_string(),
                });
                inner.bus.emit(&StreamEvent::Reconnecting {
                    attempt: drops,
                    delay,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Reads frames until the stream drops, the heartbeat lapses or a quality
/// recovery asks for a fresh stream. The flag reports whether any heartbeat
/// arrived.
async fn run_session(
    inner: &ClientInner,
    resource_key: &str,
    mut frames: FrameStream,
) -> (SessionEnd, bool) {
    let config = &inner.config;
    let mut tracker =
        HeartbeatTracker::new(config.heartbeat.interval_from_probe(inner.probe.as_ref()));
    inner
        .counters
        .heartbeat_interval_ms
        .store(tracker.interval().as_millis() as u64, Ordering::Relaxed);
    inner.adapt_queue();

    let mut flush =
        tokio::time::interval_at(Instant::now() + config.flush_interval, config.flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut adapt = tokio::time::interval_at(
        Instant::now() + config.adaptation_interval,
        config.adaptation_interval,
    );
    adapt.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut quality = inner.monitor.subscribe();
    let mut last_tier = quality.borrow_and_update().as_ref().map(|m| m.tier);
    let mut upgrade_at: Option<Instant> = None;

    let end = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => inner.handle_frame(resource_key, &frame, &mut tracker),
                Some(Err(error)) => break SessionEnd::Dropped(error),
                None => {
                    break SessionEnd::Dropped(WardstreamError::StreamClosed(
                        "server closed the stream".to_string(),
                    ))
                }
            },
            _ = tokio::time::sleep_until(tracker.deadline()) => {
                break SessionEnd::Dropped(WardstreamError::HeartbeatTimeout {
                    elapsed_ms: tracker.elapsed().as_millis() as u64,
                });
            }
            _ = flush.tick() => inner.flush_queue(),
            _ = adapt.tick() => inner.adapt(&mut tracker),
            Ok(()) = quality.changed() => {
                let tier = quality.borrow_and_update().as_ref().map(|m| m.tier);
                if let (Some(from), Some(to)) = (last_tier, tier) {
                    if from != to {
                        inner.bus.emit(&StreamEvent::QualityChanged { from, to });
                    }
                    if from.is_degraded() && to.is_healthy() {
                        upgrade_at = Some(Instant::now() + config.reconnect_grace);
                    } else if to.is_degraded() {
                        upgrade_at = None;
                    }
                }
                if tier.is_some() {
                    last_tier = tier;
                }
                inner.adapt_queue();
            }
            _ = tokio::time::sleep_until(upgrade_at.unwrap_or_else(Instant::now)), if upgrade_at.is_some() => {
                break SessionEnd::QualityRecovered;
            }
        }
    };

    (end, tracker.beats() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::HeartbeatTable;
    use crate::network::QualityTier;
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use wardstream_resilience::BackoffConfig;
    use wardstream_traits::{BatteryStatus, ConnectionType, DeviceProfile};

    enum Script {
        Hang(Vec<SseFrame>),
        Fail(WardstreamError),
    }

    #[derive(Default)]
    struct TestTransport {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<StreamRequest>>,
    }

    impl TestTransport {
        fn with(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::default(),
            })
        }

        fn opens(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn request(&self, idx: usize) -> StreamRequest {
            self.requests.lock().unwrap()[idx].clone()
        }
    }

    #[async_trait]
    impl EventTransport for TestTransport {
        async fn open(&self, request: &StreamRequest) -> Result<FrameStream> {
            self.requests.lock().unwrap().push(request.clone());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Hang(Vec::new()));
            match script {
                Script::Hang(frames) => Ok(stream::iter(frames.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed()),
                Script::Fail(error) => Err(error),
            }
        }
    }

    struct TestProbe {
        online: AtomicBool,
        latency_ms: AtomicU64,
        low_end: bool,
    }

    impl TestProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                online: AtomicBool::new(true),
                latency_ms: AtomicU64::new(50),
                low_end: false,
            })
        }
    }

    #[async_trait]
    impl EnvironmentProbe for TestProbe {
        fn connection_type(&self) -> ConnectionType {
            ConnectionType::Wifi
        }

        fn battery(&self) -> Option<BatteryStatus> {
            None
        }

        fn is_foregrounded(&self) -> bool {
            true
        }

        fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        fn device_profile(&self) -> DeviceProfile {
            if self.low_end {
                DeviceProfile {
                    memory_gb: Some(1.0),
                    cpu_cores: Some(2),
                }
            } else {
                DeviceProfile::default()
            }
        }

        async fn probe_latency(&self) -> Result<Duration> {
            Ok(Duration::from_millis(self.latency_ms.load(Ordering::SeqCst)))
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn config() -> StreamConfig {
        StreamConfig::parse("https://stream.test/events")
            .unwrap()
            .with_heartbeat(HeartbeatTable::uniform(Duration::from_secs(1)))
            .with_backoff(
                BackoffConfig::default()
                    .with_initial_delay(ms(100))
                    .with_jitter(false)
                    .with_max_retries(2),
            )
            .with_quality_probe_interval(None)
    }

    fn heartbeat() -> SseFrame {
        SseFrame::new("heartbeat", r#"{"timestamp":1700000000000}"#)
    }

    fn analysis() -> SseFrame {
        SseFrame::new("analysis", r#"{"summary":"stable","confidence_score":0.9}"#)
    }

    fn record(client: &StreamClient, kinds: &[EventKind]) -> Arc<Mutex<Vec<StreamEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for &kind in kinds {
            let seen = Arc::clone(&seen);
            client.on(kind, move |event| seen.lock().unwrap().push(event.clone()));
        }
        seen
    }

    fn kinds(seen: &Mutex<Vec<StreamEvent>>) -> Vec<EventKind> {
        seen.lock().unwrap().iter().map(StreamEvent::kind).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_delivers_events() {
        let transport = TestTransport::with(vec![Script::Hang(vec![heartbeat(), analysis()])]);
        let client = StreamClient::new(config(), transport.clone(), TestProbe::new()).unwrap();
        let seen = record(
            &client,
            &[EventKind::Connected, EventKind::Heartbeat, EventKind::Analysis],
        );

        client.connect("ward-7", StreamParams::default()).await.unwrap();
        tokio::time::sleep(ms(300)).await;

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(
            kinds(&seen),
            vec![EventKind::Connected, EventKind::Heartbeat, EventKind::Analysis]
        );

        let metrics = client.metrics();
        assert_eq!(metrics.messages_received, 2);
        assert_eq!(metrics.messages_delivered, 2);
        assert_eq!(metrics.heartbeats, 1);
        assert_eq!(metrics.heartbeat_interval, Duration::from_secs(1));
        assert!(metrics.connected_since.is_some());

        let request = transport.request(0);
        assert_eq!(request.param("resourceKey"), Some("ward-7"));
        assert_eq!(request.param("include_confidence"), Some("true"));
        assert_eq!(request.param("format"), Some("json"));
        assert_eq!(request.param("payload_filter"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_reconnects() {
        let transport = TestTransport::with(vec![Script::Hang(Vec::new())]);
        let client = StreamClient::new(config(), transport.clone(), TestProbe::new()).unwrap();
        let seen = record(&client, &[EventKind::Reconnecting, EventKind::Error]);

        client.connect("ward-7", StreamParams::default()).await.unwrap();
        // stale after 2s, reconnect 100ms later
        tokio::time::sleep(ms(3_000)).await;

        assert_eq!(transport.opens(), 2);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.metrics().reconnects, 1);

        let events = seen.lock().unwrap().clone();
        assert!(matches!(
            &events[0],
            StreamEvent::Error { message } if message.contains("Heartbeat")
        ));
        assert_eq!(
            events[1],
            StreamEvent::Reconnecting {
                attempt: 1,
                delay: ms(100)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_disconnects() {
        let unavailable = || WardstreamError::Server {
            status: 503,
            message: "unavailable".to_string(),
        };
        let transport = TestTransport::with(vec![
            Script::Fail(unavailable()),
            Script::Fail(unavailable()),
            Script::Fail(unavailable()),
        ]);
        let client = StreamClient::new(config(), transport.clone(), TestProbe::new()).unwrap();
        let seen = record(&client, &[EventKind::Reconnecting, EventKind::Disconnected]);

        client.connect("ward-7", StreamParams::default()).await.unwrap();
        tokio::time::sleep(ms(1_000)).await;

        assert_eq!(transport.opens(), 3);
        assert_eq!(client.state(), ConnectionState::Failed);

        let events = seen.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                StreamEvent::Reconnecting {
                    attempt: 1,
                    delay: ms(100)
                },
                // all-failure window boosts the multiplier to 3.0
                StreamEvent::Reconnecting {
                    attempt: 2,
                    delay: ms(300)
                },
                StreamEvent::Disconnected {
                    resource_key: "ward-7".to_string(),
                    reason: "max_retries_exceeded".to_string()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_fatal() {
        let transport = TestTransport::with(vec![Script::Fail(WardstreamError::Client {
            status: 404,
            message: "unknown ward".to_string(),
        })]);
        let client = StreamClient::new(config(), transport.clone(), TestProbe::new()).unwrap();
        let seen = record(&client, &[EventKind::Disconnected]);

        client.connect("ward-9", StreamParams::default()).await.unwrap();
        tokio::time::sleep(ms(500)).await;

        assert_eq!(transport.opens(), 1);
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(matches!(
            &seen.lock().unwrap()[0],
            StreamEvent::Disconnected { reason, .. } if reason == "fatal"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_dropped() {
        let transport = TestTransport::with(vec![Script::Hang(vec![
            SseFrame::new("bogus", "{}"),
            SseFrame::new("analysis", "not json"),
            heartbeat(),
            analysis(),
        ])]);
        let client = StreamClient::new(config(), transport.clone(), TestProbe::new()).unwrap();
        let seen = record(&client, &[EventKind::Analysis]);

        client.connect("ward-7", StreamParams::default()).await.unwrap();
        tokio::time::sleep(ms(300)).await;

        assert_eq!(transport.opens(), 1);
        assert_eq!(client.metrics().malformed_messages, 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_alert_bypasses_queue() {
        let transport = TestTransport::with(vec![Script::Hang(vec![
            SseFrame::new(
                "priority-alert",
                r#"{"title":"Sepsis risk","urgency":"critical"}"#,
            ),
            analysis(),
        ])]);
        let config = config().with_flush_interval(Duration::from_secs(3_600));
        let client = StreamClient::new(config, transport, TestProbe::new()).unwrap();
        let seen = record(&client, &[EventKind::PriorityAlert, EventKind::Analysis]);

        client.connect("ward-7", StreamParams::default()).await.unwrap();
        tokio::time::sleep(ms(100)).await;

        assert_eq!(kinds(&seen), vec![EventKind::PriorityAlert]);
        assert_eq!(client.metrics().queued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let transport = TestTransport::with(vec![Script::Hang(vec![heartbeat()])]);
        let client = StreamClient::new(config(), transport, TestProbe::new()).unwrap();
        let seen = record(&client, &[EventKind::Disconnected]);

        client.connect("ward-7", StreamParams::default()).await.unwrap();
        tokio::time::sleep(ms(50)).await;
        client.disconnect().await;
        client.disconnect().await;

        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![StreamEvent::Disconnected {
                resource_key: "ward-7".to_string(),
                reason: "manual".to_string()
            }]
        );
        let status = client.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.resource_key, None);
        assert!(client.metrics().connected_since.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_replaces_existing_stream() {
        let transport = Arc::new(TestTransport::default());
        let client = StreamClient::new(config(), transport.clone(), TestProbe::new()).unwrap();

        client.connect("ward-a", StreamParams::default()).await.unwrap();
        tokio::time::sleep(ms(50)).await;
        client
            .connect("ward-b", StreamParams::default().with_depth("full"))
            .await
            .unwrap();
        tokio::time::sleep(ms(50)).await;

        assert_eq!(transport.opens(), 2);
        assert_eq!(transport.request(0).param("resourceKey"), Some("ward-a"));
        assert_eq!(transport.request(1).param("resourceKey"), Some("ward-b"));
        assert_eq!(transport.request(1).param("depth"), Some("full"));
        assert_eq!(client.status().resource_key.as_deref(), Some("ward-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_requires_session() {
        let transport = Arc::new(TestTransport::default());
        let client = StreamClient::new(config(), transport.clone(), TestProbe::new()).unwrap();

        assert!(matches!(
            client.reconnect().await,
            Err(WardstreamError::InvalidState(_))
        ));

        client.connect("ward-7", StreamParams::default()).await.unwrap();
        tokio::time::sleep(ms(50)).await;
        client.reconnect().await.unwrap();
        tokio::time::sleep(ms(50)).await;

        assert_eq!(transport.opens(), 2);
        assert_eq!(client.metrics().reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_end_device_requests_reduced_payloads() {
        let transport = Arc::new(TestTransport::default());
        let probe = Arc::new(TestProbe {
            online: AtomicBool::new(true),
            latency_ms: AtomicU64::new(50),
            low_end: true,
        });
        let client = StreamClient::new(config(), transport.clone(), probe).unwrap();

        client.connect("ward-7", StreamParams::default()).await.unwrap();
        tokio::time::sleep(ms(50)).await;

        let request = transport.request(0);
        assert_eq!(request.param("payload_filter"), Some("essential"));
        assert_eq!(request.param("compression"), Some("gzip"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_recovery_reconnects_after_grace() {
        let transport = Arc::new(TestTransport::default());
        let probe = TestProbe::new();
        probe.online.store(false, Ordering::SeqCst);
        let config = config().with_heartbeat(HeartbeatTable::uniform(Duration::from_secs(30)));
        let client = StreamClient::new(config, transport.clone(), probe.clone()).unwrap();
        let seen = record(&client, &[EventKind::QualityChanged]);

        client.connect("ward-7", StreamParams::default()).await.unwrap();
        tokio::time::sleep(ms(50)).await;
        assert_eq!(client.monitor().measure().await.tier, QualityTier::Offline);
        tokio::time::sleep(ms(50)).await;

        probe.online.store(true, Ordering::SeqCst);
        assert_eq!(client.monitor().measure().await.tier, QualityTier::Excellent);
        tokio::time::sleep(ms(1_000)).await;
        assert_eq!(transport.opens(), 1);

        tokio::time::sleep(ms(1_500)).await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![StreamEvent::QualityChanged {
                from: QualityTier::Offline,
                to: QualityTier::Excellent
            }]
        );
    }

    #[tokio::test]
    async fn test_empty_resource_key_rejected() {
        let client = StreamClient::new(
            config(),
            Arc::new(TestTransport::default()),
            TestProbe::new(),
        )
        .unwrap();
        assert!(client.connect("  ", StreamParams::default()).await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
