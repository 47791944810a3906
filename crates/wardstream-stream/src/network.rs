//! Network quality monitoring
//!
//! [`NetworkQualityMonitor`] probes round-trip latency through the
//! [`EnvironmentProbe`] and classifies it into a [`QualityTier`]. Only the
//! latest [`NetworkQualityMeasurement`] is retained; it is published on a
//! watch channel so the stream client can react to tier changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wardstream_traits::EnvironmentProbe;

/// Connectivity classification, ordered worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// Probe failed or the device is offline
    Offline,
    /// At or above the fair threshold
    Poor,
    /// Below the fair threshold
    Fair,
    /// Below the good threshold
    Good,
    /// Below the excellent threshold
    Excellent,
}

impl QualityTier {
    /// Poor or offline
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Poor | Self::Offline)
    }

    /// Good or excellent
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Good | Self::Excellent)
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latency thresholds for tier classification
#[derive(Debug, Clone, PartialEq)]
pub struct QualityThresholds {
    /// Upper bound (exclusive) for excellent
    pub excellent: Duration,
    /// Upper bound (exclusive) for good
    pub good: Duration,
    /// Upper bound (exclusive) for fair
    pub fair: Duration,
    /// Probes slower than this count as offline
    pub probe_timeout: Duration,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent: Duration::from_millis(100),
            good: Duration::from_millis(300),
            fair: Duration::from_millis(1000),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl QualityThresholds {
    /// Set the probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Classifies a measured latency
    pub fn classify(&self, latency: Duration) -> QualityTier {
        if latency < self.excellent {
            QualityTier::Excellent
        } else if latency < self.good {
            QualityTier::Good
        } else if latency < self.fair {
            QualityTier::Fair
        } else {
            QualityTier::Poor
        }
    }
}

/// One latency probe result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkQualityMeasurement {
    /// Round-trip time, `None` when the probe failed
    pub latency: Option<Duration>,
    /// Classified tier
    pub tier: QualityTier,
    /// When the probe completed
    pub measured_at: DateTime<Utc>,
}

/// Periodic latency prober
pub struct NetworkQualityMonitor {
    probe: Arc<dyn EnvironmentProbe>,
    thresholds: QualityThresholds,
    latest: watch::Sender<Option<NetworkQualityMeasurement>>,
}

impl NetworkQualityMonitor {
    /// Creates a monitor over `probe`
    pub fn new(probe: Arc<dyn EnvironmentProbe>, thresholds: QualityThresholds) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            probe,
            thresholds,
            latest,
        }
    }

    /// Probes once, publishes and returns the measurement
    pub async fn measure(&self) -> NetworkQualityMeasurement {
        let latency = if self.probe.is_online() {
            match tokio::time::timeout(self.thresholds.probe_timeout, self.probe.probe_latency())
                .await
            {
                Ok(Ok(latency)) => Some(latency),
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Latency probe failed");
                    None
                }
                Err(_) => {
                    tracing::debug!(timeout = ?self.thresholds.probe_timeout, "Latency probe timed out");
                    None
                }
            }
        } else {
            None
        };

        let measurement = NetworkQualityMeasurement {
            latency,
            tier: latency
                .map(|l| self.thresholds.classify(l))
                .unwrap_or(QualityTier::Offline),
            measured_at: Utc::now(),
        };

        let previous = self
            .latest
            .send_replace(Some(measurement.clone()))
            .map(|m| m.tier);
        if previous != Some(measurement.tier) {
            tracing::info!(
                tier = %measurement.tier,
                latency = ?measurement.latency,
                "Network quality changed"
            );
        }

        measurement
    }

    /// Probes every `interval` until the returned future is dropped
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.measure().await;
        }
    }

    /// Latest measurement
    pub fn latest(&self) -> Option<NetworkQualityMeasurement> {
        self.latest.borrow().clone()
    }

    /// Latest tier
    pub fn tier(&self) -> Option<QualityTier> {
        self.latest.borrow().as_ref().map(|m| m.tier)
    }

    /// Receiver notified on every measurement
    pub fn subscribe(&self) -> watch::Receiver<Option<NetworkQualityMeasurement>> {
        self.latest.subscribe()
    }

    /// Thresholds in use
    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }
}

impl fmt::Debug for NetworkQualityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkQualityMonitor")
            .field("thresholds", &self.thresholds)
            .field("tier", &self.tier())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use wardstream_error::{Result, WardstreamError};
    use wardstream_traits::{BatteryStatus, ConnectionType, DeviceProfile};

    struct LatencyProbe {
        latency_ms: AtomicU64,
        online: AtomicBool,
        fail: AtomicBool,
    }

    impl LatencyProbe {
        fn new(ms: u64) -> Arc<Self> {
            Arc::new(Self {
                latency_ms: AtomicU64::new(ms),
                online: AtomicBool::new(true),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl EnvironmentProbe for LatencyProbe {
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
            DeviceProfile::default()
        }
        async fn probe_latency(&self) -> Result<Duration> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WardstreamError::network("failed to fetch"));
            }
            Ok(Duration::from_millis(self.latency_ms.load(Ordering::SeqCst)))
        }
    }

    #[test]
    fn test_classify_boundaries() {
        let t = QualityThresholds::default();
        assert_eq!(t.classify(Duration::from_millis(99)), QualityTier::Excellent);
        assert_eq!(t.classify(Duration::from_millis(100)), QualityTier::Good);
        assert_eq!(t.classify(Duration::from_millis(299)), QualityTier::Good);
        assert_eq!(t.classify(Duration::from_millis(300)), QualityTier::Fair);
        assert_eq!(t.classify(Duration::from_millis(999)), QualityTier::Fair);
        assert_eq!(t.classify(Duration::from_millis(1000)), QualityTier::Poor);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(QualityTier::Offline < QualityTier::Poor);
        assert!(QualityTier::Good < QualityTier::Excellent);
        assert!(QualityTier::Poor.is_degraded());
        assert!(QualityTier::Good.is_healthy());
        assert!(!QualityTier::Fair.is_healthy() && !QualityTier::Fair.is_degraded());
    }

    #[tokio::test]
    async fn test_measure_publishes_latest() {
        let probe = LatencyProbe::new(50);
        let monitor = NetworkQualityMonitor::new(probe.clone(), QualityThresholds::default());
        let mut rx = monitor.subscribe();
        assert!(monitor.latest().is_none());

        let m = monitor.measure().await;
        assert_eq!(m.tier, QualityTier::Excellent);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().map(|m| m.tier), Some(QualityTier::Excellent));

        probe.latency_ms.store(450, Ordering::SeqCst);
        monitor.measure().await;
        assert_eq!(monitor.tier(), Some(QualityTier::Fair));
    }

    #[tokio::test]
    async fn test_failed_probe_and_offline() {
        let probe = LatencyProbe::new(50);
        let monitor = NetworkQualityMonitor::new(probe.clone(), QualityThresholds::default());

        probe.fail.store(true, Ordering::SeqCst);
        let failed = monitor.measure().await;
        assert_eq!(failed.tier, QualityTier::Offline);
        assert!(failed.latency.is_none());

        probe.fail.store(false, Ordering::SeqCst);
        probe.online.store(false, Ordering::SeqCst);
        assert_eq!(monitor.measure().await.tier, QualityTier::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_is_offline() {
        struct Hanging;

        #[async_trait]
        impl EnvironmentProbe for Hanging {
            fn connection_type(&self) -> ConnectionType {
                ConnectionType::Cellular3g
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
                std::future::pending().await
            }
        }

        let monitor = NetworkQualityMonitor::new(
            Arc::new(Hanging),
            QualityThresholds::default().with_probe_timeout(Duration::from_secs(1)),
        );
        assert_eq!(monitor.measure().await.tier, QualityTier::Offline);
    }
}
