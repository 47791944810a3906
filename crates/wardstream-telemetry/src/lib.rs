//! # Wardstream Telemetry
//!
//! Offline-first error reporting. Reports are sanitized, stamped with the
//! device context and persisted before any network attempt, then synced in
//! batches once the device is online.
//!
//! - **Bounded**: the oldest entries are evicted past `max_queue_size`
//! - **Durable**: every mutation is persisted; quota failures evict entries
//!   older than the retention window
//! - **Polite**: a 429 backs the queue off exponentially, honouring
//!   `Retry-After`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use url::Url;
//! use wardstream_telemetry::{
//!     ErrorQueue, ErrorQueueConfig, ErrorReport, FileStorage, HttpTelemetrySink,
//! };
//! use wardstream_traits::EnvironmentProbe;
//!
//! # async fn example(probe: Arc<dyn EnvironmentProbe>) -> wardstream_error::Result<()> {
//! let sink = HttpTelemetrySink::new(Url::parse("https://intel.example.org/telemetry")?)?;
//! let queue = ErrorQueue::new(
//!     ErrorQueueConfig::default(),
//!     Arc::new(sink),
//!     Arc::new(FileStorage::new("/var/lib/wardstream/errors.json")),
//!     probe,
//! );
//! queue.start();
//!
//! queue.push(ErrorReport::new("failed to render ward map").with_component("ward-map"));
//! queue.flush().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod queue;
pub mod report;
pub mod sanitize;
pub mod sink;
pub mod storage;

pub use queue::{ErrorQueue, ErrorQueueConfig, QueueStats, SkipReason, SyncOutcome, SyncReport};
pub use report::{ErrorCategory, ErrorReport, ErrorSeverity, QueuedError};
pub use sanitize::{is_sensitive_key, sanitize, sanitized, REDACTED};
pub use sink::{HttpTelemetrySink, TelemetrySink, TELEMETRY_TYPE_HEADER};
pub use storage::{FileStorage, MemoryStorage, QueueStorage};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{ErrorQueue, ErrorQueueConfig, ErrorReport, QueueStorage, TelemetrySink};
}
