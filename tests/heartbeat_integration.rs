//! Heartbeat transmitter integration tests

mod common;

use can_assure::backend::{
    Engine, EngineParts, JsonVectorStore, RecordingBus, SimulatedBridge, Sources, StaticLink,
    TransmitterState, Workbook,
};
use can_assure::config::{AppConfig, ConfigStore, TimingSettings};
use can_assure::types::{CanId, HeartbeatEntry};
use common::builders::{body_catalog, EngineBuilder};
use serial_test::serial;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn power_mode(ignition: f64) -> HeartbeatEntry {
    HeartbeatEntry::new("Power_Mode", Some(CanId(0x100))).with_signal("Ignition", ignition)
}

#[test]
#[serial]
fn test_no_transmission_after_stop() {
    let test = EngineBuilder::new(Arc::new(JsonVectorStore::in_memory(Workbook::default())))
        .heartbeat(power_mode(1.0))
        .build();
    test.open_gates();

    let transmitter = test.engine.transmitter();
    transmitter.start();
    assert!(common::wait_for(common::test_timeout(), || test.bus.sent_count() >= 3));

    transmitter.stop();
    let stopped_at = Instant::now();
    let count = test.bus.sent_count();
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(transmitter.status(), TransmitterState::Stopped);
    assert_eq!(test.bus.sent_count(), count);
    assert!(test.bus.last_sent_at().is_some_and(|at| at <= stopped_at));
}

#[test]
#[serial]
fn test_closed_gate_pauses_transmission() {
    let test = EngineBuilder::new(Arc::new(JsonVectorStore::in_memory(Workbook::default())))
        .heartbeat(power_mode(1.0))
        .build();
    test.open_gates();
    test.engine.transmitter().start();
    assert!(common::wait_for(common::test_timeout(), || test.bus.sent_count() > 0));

    test.engine.state().link_up.store(false, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(60));
    let paused = test.bus.sent_count();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(test.bus.sent_count(), paused);

    test.engine.state().link_up.store(true, Ordering::SeqCst);
    assert!(common::wait_for(common::test_timeout(), || test.bus.sent_count() > paused));
    test.engine.transmitter().stop();
}

#[test]
#[serial]
fn test_external_edit_reseeds_heartbeat() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.toml");
    let mut config = AppConfig::default();
    config.heartbeat = vec![power_mode(1.0)];
    config.timing = TimingSettings::fast();
    config.save(&path).unwrap();

    let store = Arc::new(ConfigStore::load(&path).unwrap());
    let bus = RecordingBus::new();
    let (engine, _telemetry) = Engine::new(EngineParts {
        config: store.clone(),
        sources: Sources::new(
            Arc::new(body_catalog()),
            Arc::new(JsonVectorStore::in_memory(Workbook::default())),
        ),
        bridge: Arc::new(SimulatedBridge::new()),
        bus: Box::new(bus.clone()),
        link: Arc::new(StaticLink::new("vcan0", true)),
    });
    engine.state().link_up.store(true, Ordering::SeqCst);
    engine.state().device_connected.store(true, Ordering::SeqCst);
    engine.transmitter().start();
    assert!(common::wait_for(common::test_timeout(), || bus.sent_count() > 0));

    // Make sure the edit lands on a later modification time
    std::thread::sleep(Duration::from_millis(20));
    config.heartbeat = vec![power_mode(2.0)];
    config.save(&path).unwrap();

    assert!(common::wait_for(common::test_timeout(), || {
        bus.frames().iter().any(|f| f.id == CanId(0x100) && f.data[0] == 2)
    }));
    assert_eq!(engine.state().live().heartbeat[0].signals["Ignition"], 2.0);
    assert!(store.version() > 1);

    engine.transmitter().stop();
    engine.shutdown();

    // Shutdown writes the baseline captured at construction back
    let restored = AppConfig::load(&path).unwrap();
    assert_eq!(restored.heartbeat, vec![power_mode(1.0)]);
}
