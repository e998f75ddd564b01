//! Property header parsing
//!
//! A vehicle HAL types header declares one property per received signal:
//!
//! ```text
//! Body_Ctrl__Door_Lock_RX_V = 560022352 /* VehiclePropertyType:INT32 | ... */
//! ```
//!
//! The header gives the authoritative signal → property id mapping and the
//! declared value kind of each property.

use crate::error::{CanAssureError, Result};
use crate::types::{PropertyId, ValueKind};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

const LINE_PATTERN: &str =
    r"(\w+)__(\w+)_RX_V\s*=\s*(\d+)(?:.*VehiclePropertyType:(\w+))?";

/// Parsed property declarations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyHeader {
    signals: BTreeMap<String, PropertyId>,
    messages: BTreeMap<String, String>,
    kinds: BTreeMap<PropertyId, ValueKind>,
}

impl PropertyHeader {
    /// Read and parse a header file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CanAssureError::Parse(format!("Failed to read property header {:?}: {}", path, e))
        })?;
        let header = Self::parse(&content)?;
        tracing::info!(
            "Loaded property header {:?} ({} signals)",
            path,
            header.signals.len()
        );
        Ok(header)
    }

    /// Parse header text; lines that do not declare a property are ignored
    pub fn parse(content: &str) -> Result<Self> {
        let pattern = Regex::new(LINE_PATTERN)
            .map_err(|e| CanAssureError::Parse(format!("Invalid header pattern: {}", e)))?;

        let mut header = Self::default();
        for line in content.lines() {
            let Some(caps) = pattern.captures(line) else {
                continue;
            };
            let Ok(decimal) = caps[3].parse::<u64>() else {
                tracing::debug!("Skipping header line with oversized id: {}", line.trim());
                continue;
            };
            let id = PropertyId::from_decimal(decimal);
            let signal = caps[2].to_string();

            if let Some(kind) = caps.get(4) {
                header.kinds.insert(id.clone(), ValueKind::from_declared(kind.as_str()));
            }
            header.messages.insert(signal.clone(), caps[1].to_string());
            header.signals.insert(signal, id);
        }
        Ok(header)
    }

    /// Property id for a signal: exact name first, then case-insensitive
    pub fn property_for(&self, signal: &str) -> Option<&PropertyId> {
        self.signals.get(signal).or_else(|| {
            self.signals
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(signal))
                .map(|(_, id)| id)
        })
    }

    /// Message declaring a signal
    pub fn message_for(&self, signal: &str) -> Option<&str> {
        self.messages.get(signal).map(String::as_str)
    }

    /// Declared value kind of a property
    pub fn kind_of(&self, property: &PropertyId) -> Option<ValueKind> {
        self.kinds.get(property).copied()
    }

    /// Signal → property id
    pub fn signals(&self) -> &BTreeMap<String, PropertyId> {
        &self.signals
    }

    /// Property id → declared kind
    pub fn kinds(&self) -> &BTreeMap<PropertyId, ValueKind> {
        &self.kinds
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }
}
