//! Device bridge
//!
//! The bridge reaches the device under test: it lists connected devices and
//! dumps every vehicle property as text. [`AdbBridge`] runs the configured
//! `adb` commands with a bounded wait; a command that does not finish in
//! time is killed.

use crate::backend::property_dump::parse_drive_mode;
use crate::config::DeviceConfig;
use crate::error::{CanAssureError, Result};
use crate::types::{DriveMode, PropertyId};
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Upper bound for listing devices
pub const LIST_DEVICES_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Collaborator reaching the device under test
#[cfg_attr(test, mockall::automock)]
pub trait DeviceBridge: Send + Sync {
    /// Serials of the connected devices
    fn list_devices(&self) -> Result<Vec<String>>;

    /// Full property dump text, bounded by `timeout`
    fn dump_properties(&self, timeout: Duration) -> Result<String>;

    /// Drive mode reported under `property`
    fn drive_mode(&self, property: &PropertyId, timeout: Duration) -> Result<Option<DriveMode>> {
        let dump = self.dump_properties(timeout)?;
        parse_drive_mode(&dump, property)
    }
}

/// Bridge driving the `adb` command line tool
#[derive(Debug, Clone)]
pub struct AdbBridge {
    program: String,
    devices_args: Vec<String>,
    dump_args: Vec<String>,
}

impl AdbBridge {
    /// Create a bridge from the device configuration
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            program: config.program.clone(),
            devices_args: config.devices_args.clone(),
            dump_args: config.dump_args.clone(),
        }
    }

    /// Run the program with arguments, killing it after `timeout`
    ///
    /// The bound covers both reading stdout and waiting for the exit status.
    fn run(&self, args: &[String], timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CanAssureError::Bridge(format!("Failed to run {}: {}", self.program, e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CanAssureError::Bridge("Child stdout unavailable".to_string()))?;

        let (tx, rx) = bounded(1);
        std::thread::Builder::new()
            .name("bridge-read".to_string())
            .spawn(move || {
                let mut output = String::new();
                let result = stdout.read_to_string(&mut output).map(|_| output);
                let _ = tx.send(result);
            })?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(output)) => {
                let Some(status) = wait_until(&mut child, deadline)? else {
                    tracing::debug!("{} closed its output but kept running", self.program);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CanAssureError::BridgeTimeout(timeout));
                };
                if !status.success() {
                    return Err(CanAssureError::Bridge(format!(
                        "{} exited with {}",
                        self.program, status
                    )));
                }
                Ok(output)
            }
            Ok(Err(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(CanAssureError::Bridge(format!("Failed to read output: {}", e)))
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(CanAssureError::BridgeTimeout(timeout))
            }
        }
    }
}

/// Poll the child until it exits; `None` once `deadline` passes
fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
    }
}

/// Serials listed as attached devices in `adb devices` output
pub fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains("\tdevice"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

impl DeviceBridge for AdbBridge {
    fn list_devices(&self) -> Result<Vec<String>> {
        let output = self.run(&self.devices_args, LIST_DEVICES_TIMEOUT)?;
        Ok(parse_device_list(&output))
    }

    fn dump_properties(&self, timeout: Duration) -> Result<String> {
        self.run(&self.dump_args, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        let output = "List of devices attached\nemulator-5554\tdevice\nR58M\tunauthorized\n0123\tdevice product:x\n\n";
        assert_eq!(parse_device_list(output), vec!["emulator-5554", "0123"]);
        assert!(parse_device_list("List of devices attached\n").is_empty());
    }

    struct FixedDump(&'static str);

    impl DeviceBridge for FixedDump {
        fn list_devices(&self) -> Result<Vec<String>> {
            Ok(vec!["emulator-5554".to_string()])
        }

        fn dump_properties(&self, _timeout: Duration) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_drive_mode_reads_dump() {
        let bridge = FixedDump("Property: 0x2160ec00\n    int32Values: [1]\n");
        let property = PropertyId::new("2160ec00").unwrap();
        assert_eq!(
            bridge.drive_mode(&property, Duration::from_secs(1)).unwrap(),
            Some(DriveMode::Sleep)
        );

        let other = PropertyId::new("2160ec01").unwrap();
        assert_eq!(bridge.drive_mode(&other, Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_mock_bridge_timeout_propagates() {
        let mut bridge = MockDeviceBridge::new();
        bridge
            .expect_dump_properties()
            .returning(|t| Err(CanAssureError::BridgeTimeout(t)));
        let err = bridge.dump_properties(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CanAssureError::BridgeTimeout(_)));
    }

    #[test]
    fn test_missing_program_is_bridge_error() {
        let bridge = AdbBridge::new(&DeviceConfig {
            program: "definitely-not-a-real-adb-binary".to_string(),
            ..DeviceConfig::default()
        });
        let err = bridge.dump_properties(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, CanAssureError::Bridge(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_command_times_out() {
        let bridge = AdbBridge::new(&DeviceConfig {
            program: "sleep".to_string(),
            devices_args: Vec::new(),
            dump_args: vec!["5".to_string()],
        });
        let started = std::time::Instant::now();
        let err = bridge.dump_properties(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, CanAssureError::BridgeTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_closing_stdout_early_still_times_out() {
        let bridge = AdbBridge::new(&DeviceConfig {
            program: "sh".to_string(),
            devices_args: Vec::new(),
            dump_args: vec!["-c".to_string(), "exec >&-; sleep 5".to_string()],
        });
        let started = std::time::Instant::now();
        let err = bridge.dump_properties(Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, CanAssureError::BridgeTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_output_is_returned() {
        let bridge = AdbBridge::new(&DeviceConfig {
            program: "echo".to_string(),
            devices_args: vec!["List of devices attached\nabc\tdevice".to_string()],
            dump_args: vec!["Property: 0x1".to_string()],
        });
        assert_eq!(
            bridge.dump_properties(Duration::from_secs(2)).unwrap().trim(),
            "Property: 0x1"
        );
        assert_eq!(bridge.list_devices().unwrap(), vec!["abc"]);
    }
}
