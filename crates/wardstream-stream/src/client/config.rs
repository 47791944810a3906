use crate::heartbeat::HeartbeatTable;
use crate::network::QualityThresholds;
use crate::priority::PriorityQueueConfig;
use std::time::Duration;
use url::Url;
use wardstream_error::{Result, WardstreamError};
use wardstream_resilience::{AdaptiveConfig, BackoffConfig, CircuitBreakerConfig};

/// Stream client configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Server-push endpoint
    pub endpoint: Url,
    /// Heartbeat cadence table
    pub heartbeat: HeartbeatTable,
    /// Reconnect backoff; `max_retries` also bounds consecutive drops
    pub backoff: BackoffConfig,
    /// Adaptive multiplier tuning for reconnects
    pub adaptive: AdaptiveConfig,
    /// Breaker around stream opens
    pub breaker: CircuitBreakerConfig,
    /// Inbound message queue
    pub queue: PriorityQueueConfig,
    /// Latency tiers
    pub quality: QualityThresholds,
    /// How often the quality monitor probes; `None` disables probing
    pub quality_probe_interval: Option<Duration>,
    /// How often queued messages are delivered
    pub flush_interval: Duration,
    /// How often heartbeat cadence and batching are re-evaluated
    pub adaptation_interval: Duration,
    /// Wait before reconnecting after quality recovers
    pub reconnect_grace: Duration,
}

impl StreamConfig {
    /// Defaults for `endpoint`
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            heartbeat: HeartbeatTable::default(),
            backoff: BackoffConfig::default()
                .with_max_retries(5)
                .with_max_delay(Duration::from_secs(30)),
            adaptive: AdaptiveConfig::default(),
            breaker: CircuitBreakerConfig::new("event_stream"),
            queue: PriorityQueueConfig::default(),
            quality: QualityThresholds::default(),
            quality_probe_interval: Some(Duration::from_secs(30)),
            flush_interval: Duration::from_millis(100),
            adaptation_interval: Duration::from_secs(15),
            reconnect_grace: Duration::from_secs(2),
        }
    }

    /// Parses `endpoint` and applies defaults
    pub fn parse(endpoint: &str) -> Result<Self> {
        Ok(Self::new(Url::parse(endpoint)?))
    }

    /// Tuned for metered mobile links
    pub fn mobile(endpoint: Url) -> Self {
        Self {
            backoff: BackoffConfig::mobile(),
            quality_probe_interval: Some(Duration::from_secs(60)),
            flush_interval: Duration::from_millis(250),
            ..Self::new(endpoint)
        }
    }

    /// Set the heartbeat table
    pub fn with_heartbeat(mut self, table: HeartbeatTable) -> Self {
        self.heartbeat = table;
        self
    }

    /// Set reconnect backoff
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set breaker config
    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set queue config
    pub fn with_queue(mut self, queue: PriorityQueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set the probe interval, `None` to disable probing
    pub fn with_quality_probe_interval(mut self, interval: Option<Duration>) -> Self {
        self.quality_probe_interval = interval;
        self
    }

    /// Set the delivery interval
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the adaptation interval
    pub fn with_adaptation_interval(mut self, interval: Duration) -> Self {
        self.adaptation_interval = interval;
        self
    }

    /// Set the post-recovery grace period
    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    /// Rejects zero-length intervals, which would spin the session loop
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("flush_interval", self.flush_interval),
            ("adaptation_interval", self.adaptation_interval),
            ("heartbeat.wifi", self.heartbeat.wifi),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(WardstreamError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.quality_probe_interval.is_some_and(|d| d.is_zero()) {
            return Err(WardstreamError::Config(
                "quality_probe_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-connection query parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    /// Requested priority filter
    pub priority: Option<String>,
    /// Analysis depth
    pub depth: Option<String>,
    /// Free-form context
    pub context: Option<String>,
    /// Ask for confidence updates
    pub include_confidence: bool,
    /// Ask for progress updates
    pub include_progress: bool,
    /// Payload format
    pub format: String,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            priority: None,
            depth: None,
            context: None,
            include_confidence: true,
            include_progress: true,
            format: "json".to_string(),
        }
    }
}

impl StreamParams {
    /// Set the priority filter
    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    /// Set the analysis depth
    pub fn with_depth(mut self, depth: impl Into<String>) -> Self {
        self.depth = Some(depth.into());
        self
    }

    /// Set the context
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Toggle confidence/progress updates
    pub fn with_updates(mut self, confidence: bool, progress: bool) -> Self {
        self.include_confidence = confidence;
        self.include_progress = progress;
        self
    }
}
