//! Device state poller
//!
//! Repeatedly dumps the device's properties and publishes a fresh
//! [`DeviceSnapshot`](crate::types::DeviceSnapshot) for every tracked signal.
//!
//! # Snapshot Contents
//!
//! - A property found in the dump maps every signal sharing it to its raw
//!   bracketed value list
//! - A property missing from the dump maps its signals to `Not found`
//! - A failed, timed out or empty dump maps every tracked signal to
//!   `Device not found`
//!
//! # Stopping
//!
//! [`DevicePoller::stop`] does not wait for a dump in flight. Each run owns a
//! flag that is checked under the snapshot lock before publishing, so once
//! `stop` returns that run can no longer publish. A new run may start right
//! away; the old thread exits after its dump returns.

use crate::backend::cache::PropertyView;
use crate::backend::state::EngineState;
use crate::backend::worker::sleep_while_running;
use crate::config::{AppConfig, TimingSettings};
use crate::types::{DeviceSnapshot, PropertyId, SnapshotValue, ValueKind};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A tracked property and the signals it fans out to
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedProperty {
    pub id: PropertyId,
    pub signals: Vec<String>,
}

/// Result of one poll
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub snapshot: DeviceSnapshot,
    /// Number of signals covered by the snapshot
    pub tracked_signals: usize,
    /// Whether the device answered with a usable dump
    pub device_ok: bool,
}

/// Properties to poll and their signals
pub fn tracked_properties(state: &EngineState) -> Vec<TrackedProperty> {
    match state.cache.property_view() {
        Ok(view) => tracked_in_view(&view),
        Err(e) => {
            tracing::warn!("Failed to resolve property ids: {}", e);
            Vec::new()
        }
    }
}

fn tracked_in_view(view: &PropertyView) -> Vec<TrackedProperty> {
    let ids: BTreeSet<&PropertyId> = view.property_ids.values().collect();
    ids.into_iter()
        .map(|id| {
            let signals = view
                .signal_names_by_property
                .get(id)
                .cloned()
                .unwrap_or_else(|| {
                    view.property_ids
                        .iter()
                        .filter(|(_, p)| *p == id)
                        .map(|(signal, _)| signal.clone())
                        .collect()
                });
            TrackedProperty {
                id: id.clone(),
                signals,
            }
        })
        .collect()
}

/// Value kind for a property: configuration override, header, else float
pub fn value_kind(state: &EngineState, property: &PropertyId) -> ValueKind {
    let config = state.config.snapshot();
    match state.cache.property_view() {
        Ok(view) => kind_in_view(&config.config, &view, property),
        Err(_) => config.config.kind_override(property).unwrap_or_default(),
    }
}

fn kind_in_view(config: &AppConfig, view: &PropertyView, property: &PropertyId) -> ValueKind {
    config
        .kind_override(property)
        .or_else(|| view.header_kinds.get(property).copied())
        .unwrap_or_default()
}

/// Dump the device once and build a snapshot
///
/// Every lookup of one poll comes from a single cache generation.
pub fn poll_once(state: &EngineState, timing: &TimingSettings) -> PollOutcome {
    let config = state.config.snapshot();
    let view = match state.cache.property_view() {
        Ok(view) => Some(view),
        Err(e) => {
            tracing::warn!("Failed to resolve property ids: {}", e);
            None
        }
    };
    let tracked = view.as_ref().map(tracked_in_view).unwrap_or_default();
    let tracked_signals = tracked.iter().map(|p| p.signals.len()).sum();

    let dump = match state.bridge.dump_properties(timing.dump_timeout()) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => {
            tracing::debug!("Device returned an empty dump");
            None
        }
        Err(e) => {
            tracing::debug!("Device dump failed: {}", e);
            None
        }
    };

    let (Some(dump), Some(view)) = (dump, view) else {
        return PollOutcome {
            snapshot: DeviceSnapshot::device_not_found(tracked.iter().flat_map(|p| &p.signals)),
            tracked_signals,
            device_ok: false,
        };
    };

    let mut snapshot = DeviceSnapshot::new();
    for property in &tracked {
        let kind = kind_in_view(&config.config, &view, &property.id);
        let value = match state.cache.matcher(&property.id, kind) {
            Ok(matcher) => matcher
                .extract(&dump)
                .map(SnapshotValue::Value)
                .unwrap_or(SnapshotValue::NotFound),
            Err(e) => {
                tracing::warn!("{}", e);
                SnapshotValue::NotFound
            }
        };
        for signal in &property.signals {
            snapshot.insert(signal.clone(), value.clone());
        }
    }

    PollOutcome {
        snapshot,
        tracked_signals,
        device_ok: true,
    }
}

/// Start/stop handle for the polling thread
#[derive(Clone)]
pub struct DevicePoller {
    state: Arc<EngineState>,
    current: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

impl DevicePoller {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self {
            state,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Start a polling run; returns `false` if one is already active
    pub fn start(&self) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            return false;
        }

        let active = Arc::new(AtomicBool::new(true));
        let state = self.state.clone();
        let flag = active.clone();
        match std::thread::Builder::new()
            .name("device-poller".to_string())
            .spawn(move || run(state, flag))
        {
            Ok(_) => {
                *current = Some(active);
                tracing::info!("Device poller started");
                true
            }
            Err(e) => {
                tracing::error!("Failed to spawn device poller: {}", e);
                false
            }
        }
    }

    /// Stop the active run without waiting for its dump to return
    pub fn stop(&self) {
        let flag = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(flag) = flag {
            flag.store(false, Ordering::SeqCst);
            self.state.snapshot.fence();
            tracing::info!("Device poller stopped");
        }
    }

    /// Stop, pause briefly, start again
    pub fn restart(&self) -> bool {
        self.stop();
        std::thread::sleep(self.state.timing().poller_restart_pause());
        self.start()
    }
}

fn run(state: Arc<EngineState>, active: Arc<AtomicBool>) {
    let mut device_ok: Option<bool> = None;

    while active.load(Ordering::SeqCst) {
        let timing = state.timing();
        let outcome = poll_once(&state, &timing);

        if device_ok != Some(outcome.device_ok) {
            if outcome.device_ok {
                tracing::info!(
                    "Polling {} signals from the device",
                    outcome.tracked_signals
                );
            } else {
                tracing::warn!("Device not answering, publishing Device not found");
            }
            device_ok = Some(outcome.device_ok);
        }

        if !state.snapshot.publish_if(&active, outcome.snapshot) {
            break;
        }
        if !sleep_while_running(&active, timing.poll_interval_for(outcome.tracked_signals)) {
            break;
        }
    }
    tracing::debug!("Device poller thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bus::{RecordingBus, SharedBus};
    use crate::backend::cache::{CacheLayer, Sources};
    use crate::backend::catalog::{FrameDef, JsonCatalog, SignalDef};
    use crate::backend::property_header::PropertyHeader;
    use crate::backend::sim::SimulatedBridge;
    use crate::backend::state::SnapshotCell;
    use crate::backend::telemetry::telemetry_channel;
    use crate::backend::vector_store::{JsonVectorStore, Workbook};
    use crate::config::{AppConfig, ConfigStore, HeartbeatPersister};
    use crate::types::{CanId, LiveSignals};

    const HEADER: &str = "\
Body_Ctrl__Door_Lock_RX_V = 557842688 /* VehiclePropertyType:INT32 */
Power_Mode__Ignition_RX_V = 557842944 /* VehiclePropertyType:FLOAT */
";

    fn engine_state(config: AppConfig, bridge: SimulatedBridge) -> EngineState {
        let catalog = JsonCatalog::from_frames(vec![
            FrameDef::new("Body_Ctrl", CanId(0x200)).with_signal(SignalDef::new("Door_Lock", 0, 1)),
            FrameDef::new("Power_Mode", CanId(0x100)).with_signal(SignalDef::new("Ignition", 0, 8)),
        ])
        .unwrap();
        let sources = Sources::new(
            Arc::new(catalog),
            Arc::new(JsonVectorStore::in_memory(Workbook::default())),
        )
        .with_header(PropertyHeader::parse(HEADER).unwrap());
        let config = Arc::new(ConfigStore::in_memory(config));
        let (telemetry, _rx) = telemetry_channel(16);

        EngineState {
            config: config.clone(),
            cache: CacheLayer::new(sources),
            live: Mutex::new(LiveSignals::default()),
            snapshot: SnapshotCell::new(),
            bus: SharedBus::new(Box::new(RecordingBus::new())),
            bridge: Arc::new(bridge),
            link_up: Arc::new(AtomicBool::new(true)),
            device_connected: Arc::new(AtomicBool::new(true)),
            telemetry,
            persister: HeartbeatPersister::spawn(config),
            baseline: Vec::new(),
        }
    }

    #[test]
    fn test_tracked_properties_from_header() {
        let state = engine_state(AppConfig::default(), SimulatedBridge::new());

        let tracked = tracked_properties(&state);
        assert_eq!(
            tracked,
            vec![
                TrackedProperty {
                    id: PropertyId::new("21400100").unwrap(),
                    signals: vec!["Door_Lock".to_string()],
                },
                TrackedProperty {
                    id: PropertyId::new("21400200").unwrap(),
                    signals: vec!["Ignition".to_string()],
                },
            ]
        );
    }

    #[test]
    fn test_value_kind_precedence() {
        let mut config = AppConfig::default();
        config
            .property_kinds
            .insert("0x21400200".to_string(), ValueKind::Int64);
        let state = engine_state(config, SimulatedBridge::new());

        // Header only
        assert_eq!(
            value_kind(&state, &PropertyId::new("21400100").unwrap()),
            ValueKind::Int32
        );
        // Configuration beats the header
        assert_eq!(
            value_kind(&state, &PropertyId::new("21400200").unwrap()),
            ValueKind::Int64
        );
        // Unknown everywhere
        assert_eq!(
            value_kind(&state, &PropertyId::new("21400300").unwrap()),
            ValueKind::Float
        );
    }

    #[test]
    fn test_poll_once_uses_declared_kind() {
        let door_lock = PropertyId::new("21400100").unwrap();
        let bridge = SimulatedBridge::new().with_property(&door_lock, ValueKind::Int32, "1");
        let state = engine_state(AppConfig::default(), bridge);

        let outcome = poll_once(&state, &state.timing());
        assert!(outcome.device_ok);
        assert_eq!(outcome.tracked_signals, 2);
        assert_eq!(
            outcome.snapshot.get("Door_Lock"),
            Some(&SnapshotValue::Value("1".to_string()))
        );
        assert_eq!(outcome.snapshot.get("Ignition"), Some(&SnapshotValue::NotFound));
    }
}
