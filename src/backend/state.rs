//! Shared engine state
//!
//! One [`EngineState`] is owned in an `Arc` by every component. Each
//! independent piece of state has its own lock so the transmitter, poller and
//! replay worker only contend where they actually share data.

use crate::backend::bus::SharedBus;
use crate::backend::cache::CacheLayer;
use crate::backend::device_bridge::DeviceBridge;
use crate::backend::telemetry::TelemetrySink;
use crate::config::{ConfigStore, HeartbeatPersister, TimingSettings};
use crate::types::{DeviceSnapshot, HeartbeatEntry, LiveSignals};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Latest device snapshot, replaced as a whole
#[derive(Debug, Default)]
pub struct SnapshotCell {
    inner: Mutex<DeviceSnapshot>,
    publications: AtomicU64,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current snapshot
    pub fn get(&self) -> DeviceSnapshot {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Empty the snapshot
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Replace the snapshot
    pub fn publish(&self, snapshot: DeviceSnapshot) {
        *self.lock() = snapshot;
        self.publications.fetch_add(1, Ordering::SeqCst);
    }

    /// Replace the snapshot only while `active` is still set
    ///
    /// The flag is checked under the snapshot lock, so once a caller has
    /// cleared the flag and passed [`SnapshotCell::fence`], no publish guarded
    /// by that flag can land.
    pub fn publish_if(&self, active: &AtomicBool, snapshot: DeviceSnapshot) -> bool {
        let mut slot = self.lock();
        if !active.load(Ordering::SeqCst) {
            return false;
        }
        *slot = snapshot;
        self.publications.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Wait for any publish in progress to finish
    pub fn fence(&self) {
        drop(self.lock());
    }

    /// Number of snapshots published so far
    pub fn publications(&self) -> u64 {
        self.publications.load(Ordering::SeqCst)
    }
}

/// State shared by all engine components
pub struct EngineState {
    /// Versioned configuration
    pub config: Arc<ConfigStore>,
    /// Memoized lookups over the active sources
    pub cache: CacheLayer,
    /// Heartbeat and scripted frames read by the transmitter
    pub live: Mutex<LiveSignals>,
    /// Latest device state
    pub snapshot: SnapshotCell,
    /// Process-wide bus handle
    pub bus: SharedBus,
    /// Device under test
    pub bridge: Arc<dyn DeviceBridge>,
    /// Transmission gate: bus interface is up
    pub link_up: Arc<AtomicBool>,
    /// Transmission gate: a device is connected
    pub device_connected: Arc<AtomicBool>,
    /// Observer channel
    pub telemetry: TelemetrySink,
    /// Background writer for heartbeat state
    pub persister: HeartbeatPersister,
    /// Heartbeat set as configured when the engine was built
    pub baseline: Vec<HeartbeatEntry>,
}

impl EngineState {
    /// Lock the live signal sets
    pub fn live(&self) -> MutexGuard<'_, LiveSignals> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timing settings of the current configuration
    pub fn timing(&self) -> TimingSettings {
        self.config.snapshot().config.timing.clone()
    }

    /// Whether both transmission gates are open
    pub fn gates_open(&self) -> bool {
        self.link_up.load(Ordering::SeqCst) && self.device_connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SnapshotValue;

    fn snapshot(value: &str) -> DeviceSnapshot {
        [("Door_Lock".to_string(), SnapshotValue::Value(value.to_string()))]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_publish_replaces_whole_snapshot() {
        let cell = SnapshotCell::new();
        cell.publish(snapshot("1"));
        let mut next = DeviceSnapshot::new();
        next.insert("Speed", SnapshotValue::NotFound);
        cell.publish(next);

        let current = cell.get();
        assert_eq!(current.len(), 1);
        assert!(current.get("Door_Lock").is_none());
        assert_eq!(cell.publications(), 2);
    }

    #[test]
    fn test_clear_empties_snapshot() {
        let cell = SnapshotCell::new();
        cell.publish(snapshot("1"));
        cell.clear();
        assert!(cell.is_empty());
    }

    #[test]
    fn test_publish_if_respects_flag() {
        let cell = SnapshotCell::new();
        let active = AtomicBool::new(true);
        assert!(cell.publish_if(&active, snapshot("1")));

        active.store(false, Ordering::SeqCst);
        cell.fence();
        assert!(!cell.publish_if(&active, snapshot("2")));
        assert_eq!(
            cell.get().get("Door_Lock"),
            Some(&SnapshotValue::Value("1".to_string()))
        );
    }
}
