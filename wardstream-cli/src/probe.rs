//! Environment probe for a desktop or server host

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use wardstream::traits::{BatteryStatus, ConnectionType, DeviceProfile, EnvironmentProbe};
use wardstream::{Result, WardstreamError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Measures latency as the TCP connect time to the stream host.
///
/// Hosts are treated as always foregrounded and on mains power; online
/// state tracks the last probe.
pub struct SystemProbe {
    host: String,
    port: u16,
    online: AtomicBool,
}

impl SystemProbe {
    /// Probe against `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            online: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl EnvironmentProbe for SystemProbe {
    fn connection_type(&self) -> ConnectionType {
        if self.is_online() {
            ConnectionType::Wifi
        } else {
            ConnectionType::Offline
        }
    }

    fn battery(&self) -> Option<BatteryStatus> {
        None
    }

    fn is_foregrounded(&self) -> bool {
        true
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    fn device_profile(&self) -> DeviceProfile {
        DeviceProfile {
            memory_gb: None,
            cpu_cores: std::thread::available_parallelism()
                .ok()
                .map(|n| n.get() as u32),
        }
    }

    async fn probe_latency(&self) -> Result<Duration> {
        let started = Instant::now();
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let result = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(WardstreamError::from(e)),
            Err(_) => Err(WardstreamError::Timeout {
                millis: CONNECT_TIMEOUT.as_millis() as u64,
            }),
        };

        self.online.store(result.is_ok(), Ordering::Relaxed);
        result
    }
}
