//! Stream client
//!
//! [`StreamClient`] owns one server-push connection at a time. A supervisor
//! task opens the transport through a circuit breaker, watches heartbeats,
//! adapts to the environment and reconnects with backoff when the stream
//! drops.

mod config;
mod core;
mod state;

pub use self::config::{StreamConfig, StreamParams};
pub use self::core::StreamClient;
pub use self::state::{ConnectionMetrics, ConnectionState, ConnectionStatus};
