//! # Wardstream - Resilient Event Streaming for Ward Intelligence
//!
//! Wardstream keeps a live server-sent-event feed healthy on unreliable,
//! battery-constrained devices and reports client failures without losing
//! them while offline. Use feature flags to include only the components you
//! need.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `default` | `stream` + `telemetry` |
//! | `stream` | SSE client with heartbeat, quality monitoring and priority delivery |
//! | `telemetry` | Persistent error queue with batch sync |
//! | `full` | Everything |
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! # Streaming only
//! wardstream = { version = "0.1", default-features = false, features = ["stream"] }
//!
//! # Everything
//! wardstream = { version = "0.1", features = ["full"] }
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use wardstream::prelude::*;
//!
//! let config = WardstreamConfig::load("wardstream.json")?;
//! let client = StreamClient::http(config.stream_config()?, probe)?;
//! client.connect("ward-7", StreamParams::default()).await?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;

pub use config::{QueueSettings, WardstreamConfig, DEFAULT_CONFIG_FILE};

// ============================================================================
// Core re-exports (always available)
// ============================================================================

pub use wardstream_error as error;
pub use wardstream_resilience as resilience;
pub use wardstream_traits as traits;

pub use wardstream_error::{Result, WardstreamError};

// ============================================================================
// Component re-exports
// ============================================================================

/// Streaming client
#[cfg(feature = "stream")]
#[cfg_attr(docsrs, doc(cfg(feature = "stream")))]
pub mod stream {
    pub use wardstream_stream::*;
}

/// Error telemetry
#[cfg(feature = "telemetry")]
#[cfg_attr(docsrs, doc(cfg(feature = "telemetry")))]
pub mod telemetry {
    pub use wardstream_telemetry::*;
}

// ============================================================================
// Prelude - commonly used types
// ============================================================================

/// Prelude module for convenient imports
///
/// ```ignore
/// use wardstream::prelude::*;
/// ```
pub mod prelude {
    pub use crate::WardstreamConfig;
    pub use wardstream_error::{Result, WardstreamError};
    pub use wardstream_traits::prelude::*;

    #[cfg(feature = "stream")]
    pub use wardstream_stream::prelude::*;

    #[cfg(feature = "telemetry")]
    pub use wardstream_telemetry::prelude::*;
}

// ============================================================================
// Version information
// ============================================================================

/// Returns the wardstream version
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns enabled component features
pub fn enabled_components() -> Vec<&'static str> {
    #[allow(unused_mut)]
    let mut components = Vec::new();

    #[cfg(feature = "stream")]
    components.push("stream");

    #[cfg(feature = "telemetry")]
    components.push("telemetry");

    components
}

// ============================================================================
// Tests
// ============================================================================
