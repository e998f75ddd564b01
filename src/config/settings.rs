//! Timing settings shared by the background loops
//!
//! These knobs control how often each loop runs and how long the replay
//! worker waits for the device. They are part of the persisted configuration
//! so a bench setup can slow things down for a sluggish device without a
//! rebuild.
//!
//! # Poll Cadence
//!
//! The device poller trades freshness for device load based on how many
//! signals it fans out per dump:
//!
//! | Tracked signals | Interval |
//! |---|---|
//! | more than `slow_poll_threshold` (300) | `slow_poll_ms` (300 ms) |
//! | more than `medium_poll_threshold` (150) | `medium_poll_ms` (150 ms) |
//! | otherwise | `fast_poll_ms` (10 ms) |

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Granularity at which sleeping loops observe their stop flag
pub const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Timing configuration for the transmitter, poller, replay worker and monitors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Heartbeat transmit period in milliseconds
    pub transmit_period_ms: u64,

    /// Gap between consecutive frames within one period
    pub inter_frame_gap_ms: u64,

    /// Poll interval when few signals are tracked
    pub fast_poll_ms: u64,

    /// Poll interval above the medium threshold
    pub medium_poll_ms: u64,

    /// Poll interval above the slow threshold
    pub slow_poll_ms: u64,

    /// Tracked signal count above which the medium interval applies
    pub medium_poll_threshold: usize,

    /// Tracked signal count above which the slow interval applies
    pub slow_poll_threshold: usize,

    /// Upper bound for one device property dump
    pub dump_timeout_ms: u64,

    /// How long the replay worker waits for a fresh snapshot
    pub rx_wait_ceiling_ms: u64,

    /// How often the replay worker checks the snapshot while waiting
    pub rx_poll_interval_ms: u64,

    /// Settle time before capture starts in each cycle
    pub rx_settle_ms: u64,

    /// Pause between stopping and starting the poller on the first cycle
    pub poller_restart_pause_ms: u64,

    /// Link and device monitor interval
    pub monitor_interval_ms: u64,

    /// Wait after an interface recovery attempt before rechecking
    pub link_recovery_pause_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            transmit_period_ms: 80,
            inter_frame_gap_ms: 1,
            fast_poll_ms: 10,
            medium_poll_ms: 150,
            slow_poll_ms: 300,
            medium_poll_threshold: 150,
            slow_poll_threshold: 300,
            dump_timeout_ms: 10_000,
            rx_wait_ceiling_ms: 1_500,
            rx_poll_interval_ms: 50,
            rx_settle_ms: 500,
            poller_restart_pause_ms: 50,
            monitor_interval_ms: 1_000,
            link_recovery_pause_ms: 500,
        }
    }
}

impl TimingSettings {
    /// Settings with every wait shortened, for tests and dry runs
    pub fn fast() -> Self {
        Self {
            transmit_period_ms: 20,
            inter_frame_gap_ms: 0,
            dump_timeout_ms: 500,
            rx_wait_ceiling_ms: 300,
            rx_poll_interval_ms: 10,
            rx_settle_ms: 0,
            poller_restart_pause_ms: 10,
            monitor_interval_ms: 50,
            link_recovery_pause_ms: 10,
            ..Self::default()
        }
    }

    pub fn transmit_period(&self) -> Duration {
        Duration::from_millis(self.transmit_period_ms.max(1))
    }

    pub fn inter_frame_gap(&self) -> Duration {
        Duration::from_millis(self.inter_frame_gap_ms)
    }

    pub fn dump_timeout(&self) -> Duration {
        Duration::from_millis(self.dump_timeout_ms)
    }

    pub fn rx_wait_ceiling(&self) -> Duration {
        Duration::from_millis(self.rx_wait_ceiling_ms)
    }

    pub fn rx_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rx_poll_interval_ms.max(1))
    }

    pub fn rx_settle(&self) -> Duration {
        Duration::from_millis(self.rx_settle_ms)
    }

    pub fn poller_restart_pause(&self) -> Duration {
        Duration::from_millis(self.poller_restart_pause_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn link_recovery_pause(&self) -> Duration {
        Duration::from_millis(self.link_recovery_pause_ms)
    }

    /// Poll interval for the given number of tracked signals
    pub fn poll_interval_for(&self, tracked_signals: usize) -> Duration {
        let ms = if tracked_signals > self.slow_poll_threshold {
            self.slow_poll_ms
        } else if tracked_signals > self.medium_poll_threshold {
            self.medium_poll_ms
        } else {
            self.fast_poll_ms
        };
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let timing = TimingSettings::default();
        assert_eq!(timing.transmit_period(), Duration::from_millis(80));
        assert_eq!(timing.rx_wait_ceiling(), Duration::from_millis(1500));
        assert_eq!(timing.rx_poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_poll_cadence_thresholds() {
        let timing = TimingSettings::default();
        assert_eq!(timing.poll_interval_for(0), Duration::from_millis(10));
        assert_eq!(timing.poll_interval_for(150), Duration::from_millis(10));
        assert_eq!(timing.poll_interval_for(151), Duration::from_millis(150));
        assert_eq!(timing.poll_interval_for(300), Duration::from_millis(150));
        assert_eq!(timing.poll_interval_for(301), Duration::from_millis(300));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let timing: TimingSettings = toml::from_str("transmit_period_ms = 100").unwrap();
        assert_eq!(timing.transmit_period_ms, 100);
        assert_eq!(timing.slow_poll_ms, 300);
    }
}
