use crate::network::QualityTier;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use wardstream_resilience::CircuitState;

/// Lifecycle of the stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport
    #[default]
    Disconnected,
    /// Opening the first transport
    Connecting,
    /// Transport open
    Connected,
    /// Re-opening after a drop
    Retrying,
    /// Gave up; requires a new `connect`
    Failed,
}

impl ConnectionState {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        }
    }

    /// Connecting, connected or retrying
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Retrying)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time connection summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Lifecycle state
    pub state: ConnectionState,
    /// Resource currently streamed
    pub resource_key: Option<String>,
    /// Latest quality tier
    pub quality: Option<QualityTier>,
    /// Reconnect breaker state
    #[serde(serialize_with = "serialize_circuit")]
    pub circuit: CircuitState,
}

fn serialize_circuit<S: serde::Serializer>(state: &CircuitState, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(state)
}

/// Connection counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionMetrics {
    /// Frames received
    pub messages_received: u64,
    /// Events handed to listeners
    pub messages_delivered: u64,
    /// Events suppressed by throttling
    pub messages_throttled: u64,
    /// Frames that failed to parse
    pub malformed_messages: u64,
    /// Heartbeats received
    pub heartbeats: u64,
    /// Transports re-opened
    pub reconnects: u64,
    /// Current heartbeat interval
    pub heartbeat_interval: Duration,
    /// Time since the last heartbeat
    pub last_heartbeat_age: Option<Duration>,
    /// When the current transport opened
    pub connected_since: Option<DateTime<Utc>>,
    /// Messages waiting for delivery
    pub queued: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub received: AtomicU64,
    pub delivered: AtomicU64,
    pub throttled: AtomicU64,
    pub malformed: AtomicU64,
    pub heartbeats: AtomicU64,
    pub reconnects: AtomicU64,
    pub heartbeat_interval_ms: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
