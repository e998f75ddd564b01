//! Link and device monitors
//!
//! Two background loops keep the transmission gates current:
//!
//! - [`spawn_link_monitor`] checks the bus interface every second, tries to
//!   bring it back up when it is down, and publishes a link status event on
//!   every change.
//! - [`spawn_device_monitor`] lists connected devices every second and logs
//!   the device's drive mode when it connects.

use crate::backend::device_bridge::DeviceBridge;
use crate::backend::link::LinkControl;
use crate::backend::telemetry::{TelemetryEvent, TelemetrySink};
use crate::backend::worker::{sleep_while_running, WorkerHandle};
use crate::config::TimingSettings;
use crate::types::{LinkState, PropertyId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One link check, with a recovery attempt when the link is down
pub fn check_link(link: &dyn LinkControl, timing: &TimingSettings, running: &AtomicBool) -> bool {
    if link.is_up() {
        return true;
    }

    tracing::warn!("Interface {} is down, trying to bring it up", link.interface());
    if let Err(e) = link.bring_up() {
        tracing::warn!("Failed to bring up {}: {}", link.interface(), e);
    }
    if !sleep_while_running(running, timing.link_recovery_pause()) {
        return false;
    }
    link.is_up()
}

/// Spawn the link monitor
pub fn spawn_link_monitor(
    link: Arc<dyn LinkControl>,
    link_up: Arc<AtomicBool>,
    telemetry: TelemetrySink,
    timing: TimingSettings,
) -> WorkerHandle {
    let mut last: Option<LinkState> = None;
    let interval = timing.monitor_interval();

    WorkerHandle::spawn("link-monitor", interval, move |running| {
        let state = LinkState::from_up(check_link(link.as_ref(), &timing, running));
        link_up.store(state == LinkState::Up, Ordering::SeqCst);

        if last != Some(state) {
            match state {
                LinkState::Up => tracing::info!("Interface {} is up", link.interface()),
                LinkState::Down => tracing::warn!("Interface {} is down", link.interface()),
            }
            telemetry.publish(TelemetryEvent::LinkStatus {
                interface: link.interface(),
                state,
            });
            last = Some(state);
        }
    })
}

/// Spawn the device monitor
pub fn spawn_device_monitor(
    bridge: Arc<dyn DeviceBridge>,
    device_connected: Arc<AtomicBool>,
    drive_mode_property: Option<PropertyId>,
    timing: TimingSettings,
) -> WorkerHandle {
    let mut was_connected: Option<bool> = None;
    let interval = timing.monitor_interval();

    WorkerHandle::spawn("device-monitor", interval, move |_| {
        let connected = match bridge.list_devices() {
            Ok(devices) => !devices.is_empty(),
            Err(e) => {
                tracing::debug!("Device list failed: {}", e);
                false
            }
        };
        device_connected.store(connected, Ordering::SeqCst);

        if was_connected == Some(connected) {
            return;
        }
        was_connected = Some(connected);

        if !connected {
            tracing::warn!("Device disconnected");
            return;
        }
        tracing::info!("Device connected");

        if let Some(property) = drive_mode_property.as_ref() {
            match bridge.drive_mode(property, timing.dump_timeout()) {
                Ok(Some(mode)) if mode.is_drive() => tracing::info!("Device in {} mode", mode),
                Ok(Some(mode)) => tracing::warn!("Device in {} mode, expected Drive", mode),
                Ok(None) => tracing::warn!("Drive mode property {} not reported", property),
                Err(e) => tracing::warn!("Failed to read drive mode: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device_bridge::MockDeviceBridge;
    use crate::backend::link::MockLinkControl;
    use crate::backend::telemetry::telemetry_channel;
    use crate::types::DriveMode;
    use std::time::Duration;

    #[test]
    fn test_check_link_recovers() {
        let mut link = MockLinkControl::new();
        let mut checks = 0;
        link.expect_is_up().returning(move || {
            checks += 1;
            checks > 1
        });
        link.expect_interface().returning(|| "can0".to_string());
        link.expect_bring_up().times(1).returning(|| Ok(()));

        let running = AtomicBool::new(true);
        assert!(check_link(&link, &TimingSettings::fast(), &running));
    }

    #[test]
    fn test_link_monitor_publishes_changes() {
        let mut link = MockLinkControl::new();
        link.expect_is_up().returning(|| true);
        link.expect_interface().returning(|| "can0".to_string());
        link.expect_bring_up().never();

        let (sink, rx) = telemetry_channel(16);
        let link_up = Arc::new(AtomicBool::new(false));
        let monitor = spawn_link_monitor(
            Arc::new(link),
            link_up.clone(),
            sink,
            TimingSettings::fast(),
        );

        let event = rx.recv_timeout(Duration::from_secs(1)).map(|t| t.event);
        monitor.stop();

        assert!(link_up.load(Ordering::SeqCst));
        assert_eq!(
            event,
            Some(TelemetryEvent::LinkStatus {
                interface: "can0".to_string(),
                state: LinkState::Up,
            })
        );
        // Unchanged state is not republished
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_device_monitor_sets_gate_and_reads_mode() {
        let mut bridge = MockDeviceBridge::new();
        bridge
            .expect_list_devices()
            .returning(|| Ok(vec!["emulator-5554".to_string()]));
        bridge
            .expect_drive_mode()
            .times(1)
            .returning(|_, _| Ok(Some(DriveMode::Drive)));

        let connected = Arc::new(AtomicBool::new(false));
        let monitor = spawn_device_monitor(
            Arc::new(bridge),
            connected.clone(),
            PropertyId::new("2160ec00"),
            TimingSettings::fast(),
        );
        std::thread::sleep(Duration::from_millis(150));
        monitor.stop();

        assert!(connected.load(Ordering::SeqCst));
    }

    #[test]
    fn test_device_monitor_bridge_error_closes_gate() {
        let mut bridge = MockDeviceBridge::new();
        bridge
            .expect_list_devices()
            .returning(|| Err(crate::error::CanAssureError::Bridge("adb missing".to_string())));
        bridge.expect_drive_mode().never();

        let connected = Arc::new(AtomicBool::new(true));
        let monitor = spawn_device_monitor(Arc::new(bridge), connected.clone(), None, TimingSettings::fast());
        std::thread::sleep(Duration::from_millis(30));
        monitor.stop();

        assert!(!connected.load(Ordering::SeqCst));
    }
}
