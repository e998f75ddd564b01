//! Simulated collaborators for dry runs and tests
//!
//! [`SimulatedBridge`] answers device queries from an in-memory property
//! table, formatted exactly like a real property dump. [`StaticLink`] is a
//! bus interface whose state is set by hand.
//!
//! # Example
//!
//! ```ignore
//! use can_assure::backend::sim::SimulatedBridge;
//! use can_assure::types::{PropertyId, ValueKind};
//!
//! let bridge = SimulatedBridge::new();
//! let door = PropertyId::new("21400100").unwrap();
//! bridge.set_property(&door, ValueKind::Int32, "1");
//!
//! // Simulate the device going away
//! bridge.set_connected(false);
//! ```

use crate::backend::device_bridge::DeviceBridge;
use crate::backend::link::LinkControl;
use crate::error::{CanAssureError, Result};
use crate::types::{PropertyId, ValueKind};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Serial reported by the simulated device
pub const SIMULATED_SERIAL: &str = "sim-0001";

/// Device bridge answering from an in-memory property table
#[derive(Debug)]
pub struct SimulatedBridge {
    properties: Mutex<BTreeMap<PropertyId, (ValueKind, String)>>,
    connected: AtomicBool,
    empty_dump: AtomicBool,
    dump_delay: Mutex<Duration>,
    dumps: AtomicU64,
}

impl Default for SimulatedBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBridge {
    /// A connected device with no properties
    pub fn new() -> Self {
        Self {
            properties: Mutex::new(BTreeMap::new()),
            connected: AtomicBool::new(true),
            empty_dump: AtomicBool::new(false),
            dump_delay: Mutex::new(Duration::ZERO),
            dumps: AtomicU64::new(0),
        }
    }

    /// Builder-style property setter
    pub fn with_property(self, property: &PropertyId, kind: ValueKind, value: &str) -> Self {
        self.set_property(property, kind, value);
        self
    }

    /// Set the value list reported for a property
    pub fn set_property(&self, property: &PropertyId, kind: ValueKind, value: &str) {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(property.clone(), (kind, value.to_string()));
    }

    /// Remove a property from the dump
    pub fn remove_property(&self, property: &PropertyId) {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(property);
    }

    /// Connect or disconnect the device
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make dumps succeed with no output
    pub fn set_empty_dump(&self, empty: bool) {
        self.empty_dump.store(empty, Ordering::SeqCst);
    }

    /// Make every dump take at least `delay`
    pub fn set_dump_delay(&self, delay: Duration) {
        *self.dump_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Number of dumps served
    pub fn dump_count(&self) -> u64 {
        self.dumps.load(Ordering::SeqCst)
    }

    /// Render the property table as dump text
    pub fn render_dump(&self) -> String {
        let properties = self.properties.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for (id, (kind, value)) in properties.iter() {
            let _ = writeln!(out, "Property: {}, Area ID: 0, Status: AVAILABLE", id);
            for field in [
                ValueKind::Int32,
                ValueKind::Float,
                ValueKind::Int64,
                ValueKind::Bytes,
                ValueKind::String,
            ] {
                let content = if field == *kind { value.as_str() } else { "" };
                let _ = writeln!(out, "    {}: [{}]", field.field_name(), content);
            }
        }
        out
    }
}

impl DeviceBridge for SimulatedBridge {
    fn list_devices(&self) -> Result<Vec<String>> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(vec![SIMULATED_SERIAL.to_string()])
        } else {
            Ok(Vec::new())
        }
    }

    fn dump_properties(&self, timeout: Duration) -> Result<String> {
        let delay = *self.dump_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if delay > timeout {
            std::thread::sleep(timeout);
            return Err(CanAssureError::BridgeTimeout(timeout));
        }
        std::thread::sleep(delay);
        self.dumps.fetch_add(1, Ordering::SeqCst);

        if !self.connected.load(Ordering::SeqCst) {
            return Err(CanAssureError::Bridge("no devices/emulators found".to_string()));
        }
        if self.empty_dump.load(Ordering::SeqCst) {
            return Ok(String::new());
        }
        Ok(self.render_dump())
    }
}

/// Bus interface with a hand-set state
#[derive(Debug)]
pub struct StaticLink {
    interface: String,
    up: AtomicBool,
}

impl StaticLink {
    pub fn new(interface: impl Into<String>, up: bool) -> Self {
        Self {
            interface: interface.into(),
            up: AtomicBool::new(up),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl LinkControl for StaticLink {
    fn interface(&self) -> String {
        self.interface.clone()
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn bring_up(&self) -> Result<()> {
        self.up.store(true, Ordering::SeqCst);
        Ok(())
    }
}
