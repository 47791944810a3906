//! Heartbeat cadence and staleness tracking
//!
//! [`HeartbeatTable`] maps connection type, battery and foreground state to
//! an expected heartbeat interval. [`HeartbeatTracker`] holds the live
//! interval and the time of the last heartbeat; a connection is stale once
//! twice the interval passes without one.

use std::time::Duration;
use tokio::time::Instant;
use wardstream_traits::{BatteryStatus, ConnectionType, EnvironmentProbe};

/// Heartbeat interval table
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatTable {
    /// Interval on Wi-Fi
    pub wifi: Duration,
    /// Interval on 4G
    pub cellular_4g: Duration,
    /// Interval on 3G
    pub cellular_3g: Duration,
    /// Interval on 2G-class links
    pub slow: Duration,
    /// Interval while offline; also the upper bound for every result
    pub offline: Duration,
    /// Battery level below which the interval is stretched
    pub low_battery_threshold: f64,
    /// Factor applied on low battery
    pub low_battery_factor: f64,
    /// Factor applied while backgrounded
    pub background_factor: f64,
    /// Relative change required before the heartbeat is restarted
    pub restart_tolerance: f64,
}

impl Default for HeartbeatTable {
    fn default() -> Self {
        Self {
            wifi: Duration::from_secs(30),
            cellular_4g: Duration::from_secs(45),
            cellular_3g: Duration::from_secs(60),
            slow: Duration::from_secs(90),
            offline: Duration::from_secs(120),
            low_battery_threshold: 0.2,
            low_battery_factor: 1.5,
            background_factor: 2.0,
            restart_tolerance: 0.1,
        }
    }
}

impl HeartbeatTable {
    /// Table with every interval set to `interval` (adjustments still apply)
    pub fn uniform(interval: Duration) -> Self {
        Self {
            wifi: interval,
            cellular_4g: interval,
            cellular_3g: interval,
            slow: interval,
            offline: interval.max(Duration::from_secs(120)),
            ..Default::default()
        }
    }

    /// Set the Wi-Fi interval
    pub fn with_wifi(mut self, interval: Duration) -> Self {
        self.wifi = interval;
        self
    }

    /// Set the offline interval (the cap)
    pub fn with_offline(mut self, interval: Duration) -> Self {
        self.offline = interval;
        self
    }

    /// Base interval for a connection type. Unknown links use the 4G row.
    pub fn base_interval(&self, connection: ConnectionType) -> Duration {
        match connection {
            ConnectionType::Wifi => self.wifi,
            ConnectionType::Cellular4g | ConnectionType::Unknown => self.cellular_4g,
            ConnectionType::Cellular3g => self.cellular_3g,
            ConnectionType::Slow => self.slow,
            ConnectionType::Offline => self.offline,
        }
    }

    /// Interval for the given conditions, capped at the offline interval
    pub fn interval_for(
        &self,
        connection: ConnectionType,
        battery: Option<BatteryStatus>,
        foregrounded: bool,
    ) -> Duration {
        let mut interval = self.base_interval(connection).as_secs_f64();
        if battery.is_some_and(|b| b.is_low(self.low_battery_threshold)) {
            interval *= self.low_battery_factor;
        }
        if !foregrounded {
            interval *= self.background_factor;
        }
        Duration::from_secs_f64(interval.min(self.offline.as_secs_f64()))
    }

    /// Interval for the probe's current conditions
    pub fn interval_from_probe(&self, probe: &dyn EnvironmentProbe) -> Duration {
        self.interval_for(
            probe.connection_type(),
            probe.battery(),
            probe.is_foregrounded(),
        )
    }

    /// Whether moving from `current` to `next` warrants a restart
    pub fn should_restart(&self, current: Duration, next: Duration) -> bool {
        if current.is_zero() {
            return !next.is_zero();
        }
        let diff = current.as_secs_f64() - next.as_secs_f64();
        diff.abs() / current.as_secs_f64() > self.restart_tolerance
    }
}

/// Live heartbeat state for one connection
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    interval: Duration,
    last_beat: Instant,
    beats: u64,
}

impl HeartbeatTracker {
    /// Starts tracking at `interval`, counting from now
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_beat: Instant::now(),
            beats: 0,
        }
    }

    /// Current interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Heartbeats seen
    pub fn beats(&self) -> u64 {
        self.beats
    }

    /// Records a heartbeat
    pub fn beat(&mut self) {
        self.last_beat = Instant::now();
        self.beats += 1;
    }

    /// Time since the last heartbeat (or since tracking started)
    pub fn elapsed(&self) -> Duration {
        self.last_beat.elapsed()
    }

    /// Instant after which the connection is considered stale
    pub fn deadline(&self) -> Instant {
        self.last_beat + self.interval * 2
    }

    /// Whether the staleness window has passed
    pub fn is_stale(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    /// Switches to `next` if `table` considers the change significant.
    /// Returns true when the interval changed.
    pub fn retune(&mut self, table: &HeartbeatTable, next: Duration) -> bool {
        if !table.should_restart(self.interval, next) {
            return false;
        }
        self.interval = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_base_intervals() {
        let t = HeartbeatTable::default();
        assert_eq!(t.interval_for(ConnectionType::Wifi, None, true), secs(30));
        assert_eq!(t.interval_for(ConnectionType::Cellular4g, None, true), secs(45));
        assert_eq!(t.interval_for(ConnectionType::Cellular3g, None, true), secs(60));
        assert_eq!(t.interval_for(ConnectionType::Slow, None, true), secs(90));
        assert_eq!(t.interval_for(ConnectionType::Offline, None, true), secs(120));
    }

    #[test]
    fn test_battery_and_background_adjustments() {
        let t = HeartbeatTable::default();
        let low = Some(BatteryStatus::new(0.1, false));
        let charging = Some(BatteryStatus::new(0.1, true));

        assert_eq!(t.interval_for(ConnectionType::Wifi, low, true), secs(45));
        assert_eq!(t.interval_for(ConnectionType::Wifi, charging, true), secs(30));
        assert_eq!(t.interval_for(ConnectionType::Wifi, None, false), secs(60));
        assert_eq!(t.interval_for(ConnectionType::Wifi, low, false), secs(90));
    }

    #[test]
    fn test_capped_at_offline_interval() {
        let t = HeartbeatTable::default();
        let low = Some(BatteryStatus::new(0.05, false));
        assert_eq!(t.interval_for(ConnectionType::Slow, low, false), secs(120));
        assert_eq!(t.interval_for(ConnectionType::Cellular3g, None, false), secs(120));
    }

    #[test]
    fn test_restart_tolerance() {
        let t = HeartbeatTable::default();
        assert!(!t.should_restart(secs(30), Duration::from_millis(32_000)));
        assert!(!t.should_restart(secs(30), secs(33)));
        assert!(t.should_restart(secs(30), Duration::from_millis(33_100)));
        assert!(t.should_restart(secs(30), secs(45)));
        assert!(t.should_restart(secs(60), secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_deadline() {
        let mut tracker = HeartbeatTracker::new(secs(30));
        assert!(!tracker.is_stale());

        tokio::time::advance(secs(59)).await;
        assert!(!tracker.is_stale());
        tracker.beat();

        tokio::time::advance(secs(59)).await;
        assert!(!tracker.is_stale());
        tokio::time::advance(secs(1)).await;
        assert!(tracker.is_stale());
        assert_eq!(tracker.beats(), 1);
    }

    #[test]
    fn test_tracker_retune() {
        let table = HeartbeatTable::default();
        let mut tracker = HeartbeatTracker::new(secs(30));
        assert!(!tracker.retune(&table, secs(31)));
        assert_eq!(tracker.interval(), secs(30));
        assert!(tracker.retune(&table, secs(60)));
        assert_eq!(tracker.interval(), secs(60));
    }
}
