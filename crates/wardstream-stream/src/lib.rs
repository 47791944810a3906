//! # Wardstream Stream
//!
//! Resilient server-sent-event client for ward intelligence feeds.
//!
//! - **Transport**: `text/event-stream` over `reqwest`, decoded incrementally
//! - **Events**: typed payloads demultiplexed to per-kind listeners
//! - **Heartbeat**: interval tuned to connection type, battery and
//!   foreground state; a stream is stale after two missed intervals
//! - **Network Quality**: periodic latency probes classified into tiers
//! - **Priority Queue**: throttled, prioritised delivery with payload
//!   reduction on poor links
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wardstream_stream::{EventKind, StreamClient, StreamConfig, StreamParams};
//! use wardstream_traits::EnvironmentProbe;
//!
//! # async fn example(probe: Arc<dyn EnvironmentProbe>) -> wardstream_error::Result<()> {
//! let client = StreamClient::http(
//!     StreamConfig::parse("https://intel.example.org/stream")?,
//!     probe,
//! )?;
//!
//! client.on(EventKind::PriorityAlert, |event| {
//!     println!("alert: {:?}", event);
//! });
//!
//! client
//!     .connect("ward-7", StreamParams::default().with_depth("full"))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Heartbeat Table
//!
//! ```rust
//! use std::time::Duration;
//! use wardstream_stream::HeartbeatTable;
//! use wardstream_traits::{BatteryStatus, ConnectionType};
//!
//! let table = HeartbeatTable::default();
//! let low = Some(BatteryStatus::new(0.1, false));
//!
//! assert_eq!(
//!     table.interval_for(ConnectionType::Wifi, low, true),
//!     Duration::from_secs(45)
//! );
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod client;
pub mod event;
pub mod heartbeat;
pub mod network;
pub mod priority;
pub mod sse;
pub mod task_manager;
pub mod transport;

pub use bus::{EventBus, EventHandler, ListenerId};
pub use client::{
    ConnectionMetrics, ConnectionState, ConnectionStatus, StreamClient, StreamConfig, StreamParams,
};
pub use event::{
    AnalysisEvent, ConfidenceUpdate, EventKind, Heartbeat, IntelligenceBrief, PriorityAlert,
    ProgressUpdate, ServerTimestamp, Severity, StreamEvent,
};
pub use heartbeat::{HeartbeatTable, HeartbeatTracker};
pub use network::{
    NetworkQualityMeasurement, NetworkQualityMonitor, QualityThresholds, QualityTier,
};
pub use priority::{
    infer_priority, EnqueueOutcome, MessagePriority, MessagePriorityQueue, PayloadLimits,
    PriorityQueueConfig, QueuedMessage,
};
pub use sse::{SseDecoder, SseFrame};
pub use task_manager::TaskManager;
pub use transport::{EventTransport, HttpEventTransport, HttpTransportConfig, StreamRequest};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        EventKind, EventTransport, MessagePriority, QualityTier, StreamClient, StreamConfig,
        StreamEvent, StreamParams,
    };
}
