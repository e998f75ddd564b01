//! Test data builders for creating test objects

use can_assure::backend::vector_store::{SIGNALS_SHEET, TIME_HEADER};
use can_assure::backend::{
    CellValue, Engine, EngineParts, FrameDef, JsonCatalog, RecordingBus, SignalDef,
    SimulatedBridge, Sheet, Sources, StaticLink, TelemetryReceiver, VectorStore, Workbook,
};
use can_assure::config::{AppConfig, ConfigStore, TimingSettings};
use can_assure::types::{CanId, HeartbeatEntry, ValueKind};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Builder for a `CAN_Signals` workbook
#[derive(Default)]
pub struct WorkbookBuilder {
    signals: Vec<(String, Option<String>, Vec<(u64, f64)>)>,
}

impl WorkbookBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signal column with its property id and scripted points
    pub fn signal(mut self, name: &str, property: Option<&str>, points: &[(u64, f64)]) -> Self {
        self.signals.push((
            name.to_string(),
            property.map(str::to_string),
            points.to_vec(),
        ));
        self
    }

    pub fn build(self) -> Workbook {
        let delays: BTreeSet<u64> = self
            .signals
            .iter()
            .flat_map(|(_, _, points)| points.iter().map(|(d, _)| *d))
            .collect();
        let rows: Vec<u64> = delays.into_iter().collect();

        let mut sheet = Sheet::new(SIGNALS_SHEET);
        sheet.set_cell(2, 1, CellValue::text(TIME_HEADER));
        for (index, delay) in rows.iter().enumerate() {
            sheet.set_cell(3 + index, 1, CellValue::Number(*delay as f64));
        }

        for (offset, (name, property, points)) in self.signals.iter().enumerate() {
            let col = 2 + offset;
            if let Some(property) = property {
                sheet.set_cell(1, col, CellValue::text(property.as_str()));
            }
            sheet.set_cell(2, col, CellValue::text(name.as_str()));
            for (delay, value) in points {
                if let Some(index) = rows.iter().position(|d| d == delay) {
                    sheet.set_cell(3 + index, col, CellValue::Number(*value));
                }
            }
        }

        Workbook {
            sheets: vec![sheet],
        }
    }
}

/// Catalog with a body control frame and a power mode frame
pub fn body_catalog() -> JsonCatalog {
    JsonCatalog::from_frames(vec![
        FrameDef::new("Body_Ctrl", CanId(0x200)).with_signal(SignalDef::new("Door_Lock", 0, 1)),
        FrameDef::new("Power_Mode", CanId(0x100)).with_signal(SignalDef::new("Ignition", 0, 8)),
    ])
    .unwrap()
}

/// An engine wired to simulated collaborators
pub struct TestEngine {
    pub engine: Engine,
    pub telemetry: TelemetryReceiver,
    pub bus: RecordingBus,
    pub bridge: Arc<SimulatedBridge>,
    pub config: Arc<ConfigStore>,
}

impl TestEngine {
    /// Open both transmission gates
    pub fn open_gates(&self) {
        let state = self.engine.state();
        state.link_up.store(true, Ordering::SeqCst);
        state.device_connected.store(true, Ordering::SeqCst);
    }
}

/// Builder for [`TestEngine`]
pub struct EngineBuilder {
    config: AppConfig,
    catalog: JsonCatalog,
    store: Arc<dyn VectorStore>,
    bridge: Arc<SimulatedBridge>,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        let mut config = AppConfig::default();
        config.timing = TimingSettings::fast();
        Self {
            config,
            catalog: body_catalog(),
            store,
            bridge: Arc::new(SimulatedBridge::new()),
        }
    }

    pub fn delays(mut self, delays: &[u64]) -> Self {
        self.config.delays = delays.to_vec();
        self
    }

    pub fn heartbeat(mut self, entry: HeartbeatEntry) -> Self {
        self.config.heartbeat.push(entry);
        self
    }

    /// Declare the value kind of a property
    pub fn property_kind(mut self, property: &str, kind: ValueKind) -> Self {
        self.config.property_kinds.insert(property.to_string(), kind);
        self
    }

    pub fn timing(mut self, change: impl FnOnce(&mut TimingSettings)) -> Self {
        change(&mut self.config.timing);
        self
    }

    pub fn bridge(mut self, bridge: Arc<SimulatedBridge>) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn build(self) -> TestEngine {
        let bus = RecordingBus::new();
        let config = Arc::new(ConfigStore::in_memory(self.config));
        let (engine, telemetry) = Engine::new(EngineParts {
            config: config.clone(),
            sources: Sources::new(Arc::new(self.catalog), self.store),
            bridge: self.bridge.clone(),
            bus: Box::new(bus.clone()),
            link: Arc::new(StaticLink::new("vcan0", true)),
        });

        TestEngine {
            engine,
            telemetry,
            bus,
            bridge: self.bridge,
            config,
        }
    }
}
