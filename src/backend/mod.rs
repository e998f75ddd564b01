//! Backend module for CAN test vector replay
//!
//! This module runs every real-time loop of the engine on its own thread and
//! ties them together through one shared [`EngineState`].
//!
//! # Architecture
//!
//! - [`HeartbeatTransmitter`] - Sends the heartbeat set and scripted frames every period
//! - [`DevicePoller`] - Dumps device properties and publishes snapshots
//! - [`ReplayController`] - Runs the test vector one delay at a time, single-flight
//! - [`ResultSink`] - Records device readbacks next to the scripted values
//! - [`CacheLayer`] - Memoized lookups over the catalog, vector store and header
//! - Link and device monitors - Keep the two transmission gates current
//!
//! # Collaborators
//!
//! - [`Catalog`] / [`JsonCatalog`] - Frame definitions and encoding
//! - [`VectorStore`] / [`JsonVectorStore`] - Test vector workbook
//! - [`DeviceBridge`] / [`AdbBridge`] - Device under test
//! - [`CanBus`] / [`LinkControl`] - Bus access and interface state
//!
//! # Example
//!
//! ```ignore
//! use can_assure::backend::{Engine, EngineParts};
//! use can_assure::config::ConfigStore;
//! use std::sync::Arc;
//!
//! let config = Arc::new(ConfigStore::load("bench.toml")?);
//! let parts = EngineParts::from_config(config, false)?;
//! let (engine, telemetry) = Engine::new(parts);
//!
//! engine.start_background();
//! engine.start_replay();
//!
//! for event in telemetry.drain() {
//!     println!("{:?}", event);
//! }
//!
//! let summary = engine.wait_replay();
//! engine.shutdown();
//! ```

pub mod bus;
pub mod cache;
pub mod catalog;
pub mod device_bridge;
pub mod heartbeat;
pub mod link;
pub mod monitor;
pub mod poller;
pub mod property_dump;
pub mod property_header;
pub mod replay;
pub mod result_sink;
pub mod sim;
pub mod state;
pub mod telemetry;
pub mod vector_store;
pub mod worker;

pub use bus::{open_bus, CanBus, CanFrame, RecordingBus, ReopeningBus, SharedBus};
pub use cache::{CacheLayer, Sources};
pub use catalog::{ByteOrder, Catalog, FrameDef, JsonCatalog, SignalDef};
pub use device_bridge::{AdbBridge, DeviceBridge};
pub use heartbeat::{HeartbeatTransmitter, TransmitterState};
pub use link::{LinkControl, SocketCanLink};
pub use poller::{poll_once, tracked_properties, DevicePoller, PollOutcome, TrackedProperty};
pub use property_dump::PropertyMatcher;
pub use property_header::PropertyHeader;
pub use replay::{ReplayController, ReplaySummary};
pub use result_sink::ResultSink;
pub use sim::{SimulatedBridge, StaticLink};
pub use state::{EngineState, SnapshotCell};
pub use telemetry::{Telemetry, TelemetryEvent, TelemetryReceiver, TelemetrySink};
pub use vector_store::{CellValue, JsonVectorStore, Sheet, VectorStore, Workbook};
pub use worker::WorkerHandle;

use crate::config::{AppConfig, ConfigStore, HeartbeatPersister};
use crate::error::{Result, ResultExt};
use crate::shutdown::ShutdownCoordinator;
use crate::types::{LiveSignals, PropertyId, ValueKind};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use telemetry::{telemetry_channel, DEFAULT_TELEMETRY_CAPACITY};

const SUPERVISE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything an [`Engine`] is built from
pub struct EngineParts {
    pub config: Arc<ConfigStore>,
    pub sources: Sources,
    pub bridge: Arc<dyn DeviceBridge>,
    pub bus: Box<dyn CanBus>,
    pub link: Arc<dyn LinkControl>,
}

impl EngineParts {
    /// Build the collaborators named by the configuration
    ///
    /// A dry run swaps in a simulated device seeded from the test vector, a
    /// recording bus and an interface that is always up.
    pub fn from_config(config: Arc<ConfigStore>, dry_run: bool) -> Result<Self> {
        let mut settings = config.snapshot().config.clone();
        if let Some(base) = config.path().and_then(Path::parent) {
            settings.resolve_paths(base);
        }
        let sources = load_sources(&settings)?;

        if dry_run {
            let bridge = seeded_bridge(&settings, &sources);
            tracing::info!("Dry run: simulated device, recording bus");
            return Ok(Self {
                config,
                sources,
                bridge: Arc::new(bridge),
                bus: Box::new(RecordingBus::new()),
                link: Arc::new(StaticLink::new(settings.bus.interface.clone(), true)),
            });
        }

        let link = SocketCanLink::from_config(&settings.bus).unwrap_or_else(|e| {
            tracing::warn!("{}; falling back to {}", e, link::FALLBACK_INTERFACE);
            SocketCanLink::new(link::FALLBACK_INTERFACE, settings.bus.bitrate)
        });
        let bus = ReopeningBus::new(link.interface());
        Ok(Self {
            config,
            sources,
            bridge: Arc::new(AdbBridge::new(&settings.device)),
            bus: Box::new(bus),
            link: Arc::new(link),
        })
    }
}

/// Load the catalog, vector store and optional header named by `settings`
pub fn load_sources(settings: &AppConfig) -> Result<Sources> {
    let catalog = JsonCatalog::load(&settings.catalog_path)
        .context(format!("Loading catalog {:?}", settings.catalog_path))?;
    let store = JsonVectorStore::open(&settings.vector_path);
    let mut sources = Sources::new(Arc::new(catalog), Arc::new(store));

    if let Some(path) = settings.property_header_path.as_ref() {
        let header = PropertyHeader::load(path).context(format!("Loading header {:?}", path))?;
        tracing::info!("Loaded {} property ids from {:?}", header.len(), path);
        sources = sources.with_header(header);
    }
    Ok(sources)
}

/// Simulated device reporting each tracked property's first scripted value
fn seeded_bridge(settings: &AppConfig, sources: &Sources) -> SimulatedBridge {
    let cache = CacheLayer::new(sources.clone());
    let bridge = SimulatedBridge::new();

    let (Ok(properties), Ok(series)) = (cache.property_ids(), cache.time_series()) else {
        tracing::warn!("Could not read the test vector, simulated device starts empty");
        return bridge;
    };
    let kinds = cache.header_kinds().unwrap_or_default();

    for (signal, property) in properties.iter() {
        let kind = settings
            .kind_override(property)
            .or_else(|| kinds.get(property).copied())
            .unwrap_or_default();
        let value = series
            .get(signal)
            .and_then(|points| points.iter().next())
            .map(|(_, v)| seed_text(kind, v))
            .unwrap_or_else(|| "0".to_string());
        bridge.set_property(property, kind, &value);
    }
    bridge
}

fn seed_text(kind: ValueKind, value: f64) -> String {
    match kind {
        ValueKind::Int32 | ValueKind::Int64 => format!("{}", value.round() as i64),
        _ => value.to_string(),
    }
}

/// The running engine
pub struct Engine {
    state: Arc<EngineState>,
    transmitter: HeartbeatTransmitter,
    poller: DevicePoller,
    replay: ReplayController,
    link: Arc<dyn LinkControl>,
    monitors: Mutex<Vec<WorkerHandle>>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Build the engine and its telemetry receiver
    pub fn new(parts: EngineParts) -> (Self, TelemetryReceiver) {
        let (telemetry, receiver) = telemetry_channel(DEFAULT_TELEMETRY_CAPACITY);
        let baseline = parts.config.snapshot().config.heartbeat.clone();

        let state = Arc::new(EngineState {
            config: parts.config.clone(),
            cache: CacheLayer::new(parts.sources),
            live: Mutex::new(LiveSignals::with_heartbeat(baseline.clone())),
            snapshot: SnapshotCell::new(),
            bus: SharedBus::new(parts.bus),
            bridge: parts.bridge,
            link_up: Arc::new(AtomicBool::new(false)),
            device_connected: Arc::new(AtomicBool::new(false)),
            telemetry,
            persister: HeartbeatPersister::spawn(parts.config),
            baseline,
        });

        let poller = DevicePoller::new(state.clone());
        let engine = Self {
            transmitter: HeartbeatTransmitter::new(state.clone()),
            replay: ReplayController::new(state.clone(), poller.clone()),
            poller,
            link: parts.link,
            monitors: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            state,
        };
        (engine, receiver)
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn transmitter(&self) -> &HeartbeatTransmitter {
        &self.transmitter
    }

    pub fn poller(&self) -> &DevicePoller {
        &self.poller
    }

    /// Start the monitors, the transmitter and the poller
    pub fn start_background(&self) {
        let timing = self.state.timing();
        let drive_mode = self
            .state
            .config
            .snapshot()
            .config
            .drive_mode_property
            .as_deref()
            .and_then(PropertyId::new);

        {
            let mut monitors = self.monitors.lock().unwrap_or_else(PoisonError::into_inner);
            if monitors.is_empty() {
                monitors.push(monitor::spawn_link_monitor(
                    self.link.clone(),
                    self.state.link_up.clone(),
                    self.state.telemetry.clone(),
                    timing.clone(),
                ));
                monitors.push(monitor::spawn_device_monitor(
                    self.state.bridge.clone(),
                    self.state.device_connected.clone(),
                    drive_mode,
                    timing,
                ));
            }
        }

        self.transmitter.start();
        self.poller.start();
    }

    /// Start a replay run; `false` if one is already running
    pub fn start_replay(&self) -> bool {
        self.replay.start()
    }

    pub fn stop_replay(&self) {
        self.replay.stop();
    }

    pub fn is_replay_running(&self) -> bool {
        self.replay.is_running()
    }

    /// Wait for the last replay run to finish
    pub fn wait_replay(&self) -> Option<ReplaySummary> {
        self.replay.wait()
    }

    /// Drain telemetry until the replay ends, stopping it once on shutdown
    ///
    /// Returns `None` without waiting when a forced exit is requested.
    pub fn supervise_replay(
        &self,
        shutdown: &ShutdownCoordinator,
        telemetry: &TelemetryReceiver,
        mut on_entry: impl FnMut(Telemetry),
    ) -> Option<ReplaySummary> {
        let mut stop_sent = false;
        while self.is_replay_running() {
            if shutdown.is_force_exit() {
                return None;
            }
            if shutdown.is_shutting_down() && !stop_sent {
                tracing::info!("Stopping replay for shutdown");
                self.stop_replay();
                stop_sent = true;
            }
            if let Some(entry) = telemetry.recv_timeout(SUPERVISE_POLL_INTERVAL) {
                on_entry(entry);
            }
        }
        self.wait_replay()
    }

    /// Switch to new sources, invalidating every cache
    pub fn swap_sources(&self, sources: Sources) {
        self.state.cache.replace_sources(sources);
        tracing::info!("Sources replaced, caches invalidated");
    }

    /// Stop everything and restore the configured heartbeat baseline
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down engine");

        self.replay.stop();
        self.replay.wait();
        self.transmitter.stop();
        self.poller.stop();
        for monitor in self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            monitor.stop();
        }

        self.state.persister.shutdown();
        let baseline = self.state.baseline.clone();
        self.state.live().heartbeat = baseline.clone();
        if self.state.config.snapshot().config.heartbeat == baseline {
            return;
        }
        if let Err(e) = self.state.config.update(|cfg| cfg.heartbeat = baseline) {
            tracing::warn!("Failed to restore heartbeat baseline: {}", e);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
