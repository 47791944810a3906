//! # Wardstream Traits
//!
//! The seam between wardstream and the device it runs on. Connection type,
//! battery, foreground state and latency probing all sit behind
//! [`EnvironmentProbe`] so that the adaptive layers can be driven by a real
//! system probe in production and by a deterministic fake in tests.
//!
//! ## Core Types
//!
//! - [`ConnectionType`] - link class reported by the platform
//! - [`BatteryStatus`] - charge level and charging flag
//! - [`DeviceProfile`] - memory/CPU capacity, used for low-end detection
//! - [`EnvironmentSnapshot`] - context attached to queued error reports
//!
//! ## Example
//!
//! ```ignore
//! use wardstream_traits::prelude::*;
//!
//! async fn describe<P: EnvironmentProbe>(probe: &P) -> String {
//!     let latency = probe.probe_latency().await;
//!     format!("{} / {:?}", probe.connection_type(), latency)
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use wardstream_error::{Result, WardstreamError};

/// Link class of the current network connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionType {
    /// Wi-Fi or wired
    #[serde(rename = "wifi")]
    Wifi,
    /// 4G / LTE / 5G
    #[serde(rename = "4g")]
    Cellular4g,
    /// 3G
    #[serde(rename = "3g")]
    Cellular3g,
    /// 2G / slow-2g
    #[serde(rename = "slow")]
    Slow,
    /// No connectivity
    #[serde(rename = "offline")]
    Offline,
    /// Platform does not report the link type
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl ConnectionType {
    /// Returns the wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wifi => "wifi",
            Self::Cellular4g => "4g",
            Self::Cellular3g => "3g",
            Self::Slow => "slow",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }

    /// Returns true for metered mobile links
    pub fn is_cellular(&self) -> bool {
        matches!(self, Self::Cellular4g | Self::Cellular3g | Self::Slow)
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = WardstreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wifi" | "ethernet" | "wired" => Ok(Self::Wifi),
            "4g" | "5g" | "lte" => Ok(Self::Cellular4g),
            "3g" => Ok(Self::Cellular3g),
            "2g" | "slow" | "slow-2g" => Ok(Self::Slow),
            "offline" | "none" => Ok(Self::Offline),
            "unknown" => Ok(Self::Unknown),
            other => Err(WardstreamError::Config(format!(
                "unknown connection type '{}'",
                other
            ))),
        }
    }
}

/// Battery charge state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Charge level in `[0.0, 1.0]`
    pub level: f64,
    /// Whether the device is plugged in
    pub charging: bool,
}

impl BatteryStatus {
    /// Creates a battery status, clamping the level into range
    pub fn new(level: f64, charging: bool) -> Self {
        Self {
            level: level.clamp(0.0, 1.0),
            charging,
        }
    }

    /// True when discharging below `threshold`
    pub fn is_low(&self, threshold: f64) -> bool {
        !self.charging && self.level < threshold
    }
}

/// Hardware capacity of the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceProfile {
    /// Device memory in GiB, if reported
    pub memory_gb: Option<f64>,
    /// Logical CPU cores, if reported
    pub cpu_cores: Option<u32>,
}

impl DeviceProfile {
    /// Low-end devices have at most 2 GiB memory or at most 2 cores.
    pub fn is_low_end(&self) -> bool {
        self.memory_gb.is_some_and(|gb| gb <= 2.0) || self.cpu_cores.is_some_and(|c| c <= 2)
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    /// Width in pixels/columns
    pub width: u32,
    /// Height in pixels/rows
    pub height: u32,
}

/// Process memory usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Bytes in use
    pub used_bytes: u64,
    /// Upper bound available to the process, if known
    pub limit_bytes: Option<u64>,
}

/// Environment context captured alongside an error report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// Viewport at capture time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    /// Memory usage at capture time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    /// Online state at capture time
    pub online: bool,
    /// Connection type at capture time
    pub connection_type: ConnectionType,
    /// Platform description (os/arch)
    pub platform: String,
}

/// Probe for connectivity, power and device state.
///
/// Implementations must be cheap to call; the adaptive layers call the
/// synchronous accessors on every adaptation tick.
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    /// Current link class
    fn connection_type(&self) -> ConnectionType;

    /// Battery state, `None` on mains-powered devices
    fn battery(&self) -> Option<BatteryStatus>;

    /// Whether the application is in the foreground
    fn is_foregrounded(&self) -> bool;

    /// Whether the device believes it is online
    fn is_online(&self) -> bool;

    /// Hardware capacity
    fn device_profile(&self) -> DeviceProfile;

    /// Viewport, if the platform has one
    fn viewport(&self) -> Option<Viewport> {
        None
    }

    /// Process memory usage, if available
    fn memory_usage(&self) -> Option<MemoryUsage> {
        None
    }

    /// Issues a lightweight request and reports its round-trip time.
    async fn probe_latency(&self) -> Result<Duration>;

    /// Captures the context attached to queued error reports
    fn snapshot(&self) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            viewport: self.viewport(),
            memory: self.memory_usage(),
            online: self.is_online(),
            connection_type: self.connection_type(),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BatteryStatus, ConnectionType, DeviceProfile, EnvironmentProbe, EnvironmentSnapshot,
        MemoryUsage, Viewport,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_type_parse() {
        assert_eq!("wifi".parse::<ConnectionType>().unwrap(), ConnectionType::Wifi);
        assert_eq!("LTE".parse::<ConnectionType>().unwrap(), ConnectionType::Cellular4g);
        assert_eq!("slow-2g".parse::<ConnectionType>().unwrap(), ConnectionType::Slow);
        assert!("carrier-pigeon".parse::<ConnectionType>().is_err());
    }

    #[test]
    fn test_connection_type_serde() {
        let json = serde_json::to_string(&ConnectionType::Cellular3g).unwrap();
        assert_eq!(json, "\"3g\"");
        let back: ConnectionType = serde_json::from_str("\"4g\"").unwrap();
        assert_eq!(back, ConnectionType::Cellular4g);
    }

    #[test]
    fn test_battery_low() {
        assert!(BatteryStatus::new(0.15, false).is_low(0.2));
        assert!(!BatteryStatus::new(0.15, true).is_low(0.2));
        assert!(!BatteryStatus::new(0.5, false).is_low(0.2));
        assert_eq!(BatteryStatus::new(1.7, false).level, 1.0);
    }

    #[test]
    fn test_low_end_device() {
        let low = DeviceProfile {
            memory_gb: Some(2.0),
            cpu_cores: Some(8),
        };
        assert!(low.is_low_end());

        let high = DeviceProfile {
            memory_gb: Some(8.0),
            cpu_cores: Some(8),
        };
        assert!(!high.is_low_end());

        assert!(!DeviceProfile::default().is_low_end());
    }

    struct StaticProbe;

    #[async_trait]
    impl EnvironmentProbe for StaticProbe {
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
            true
        }
        fn device_profile(&self) -> DeviceProfile {
            DeviceProfile::default()
        }
        async fn probe_latency(&self) -> Result<Duration> {
            Ok(Duration::from_millis(20))
        }
    }

    #[tokio::test]
    async fn test_default_snapshot() {
        let probe = StaticProbe;
        let snapshot = probe.snapshot();
        assert!(snapshot.online);
        assert_eq!(snapshot.connection_type, ConnectionType::Wifi);
        assert!(snapshot.viewport.is_none());
        assert_eq!(
            probe.probe_latency().await.unwrap(),
            Duration::from_millis(20)
        );
    }
}
