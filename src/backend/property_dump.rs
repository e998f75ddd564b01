//! Device property dump parsing
//!
//! A property dump is free text with one block per property:
//!
//! ```text
//! Property: 0x21608350, Area ID: 0, Status: AVAILABLE
//!     int32Values: [1]
//!     floatValues: []
//!     int64Values: []
//!     bytes: []
//!     string: []
//! ```
//!
//! A [`PropertyMatcher`] locates the block for one property id and reads the
//! bracketed value list of one typed field inside that block. Matching never
//! crosses into the next property's block, so an empty field cannot pick up
//! a neighbour's value.

use crate::error::{CanAssureError, Result};
use crate::types::{DriveMode, PropertyId, ValueKind};
use regex::Regex;

/// Compiled matcher for one (property, value kind) pair
#[derive(Debug, Clone)]
pub struct PropertyMatcher {
    property: PropertyId,
    kind: ValueKind,
    header: Regex,
    field: Regex,
    boundary: Regex,
}

impl PropertyMatcher {
    /// Compile a matcher
    pub fn new(property: &PropertyId, kind: ValueKind) -> Result<Self> {
        let compile = |pattern: String| {
            Regex::new(&pattern).map_err(|e| {
                CanAssureError::Parse(format!("Invalid matcher for {}: {}", property, e))
            })
        };

        Ok(Self {
            property: property.clone(),
            kind,
            header: compile(format!(r"(?i)Property:\s*0x{}\b", regex::escape(property.as_str())))?,
            field: compile(format!(r"(?i){}:\s*\[([^\]]*)\]", kind.field_name()))?,
            boundary: compile(r"(?i)Property:".to_string())?,
        })
    }

    pub fn property(&self) -> &PropertyId {
        &self.property
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Bracketed value list for this property, trimmed; `None` if absent
    pub fn extract(&self, dump: &str) -> Option<String> {
        let start = self.header.find(dump)?.end();
        let rest = &dump[start..];
        let end = self
            .boundary
            .find(rest)
            .map(|m| m.start())
            .unwrap_or(rest.len());

        self.field
            .captures(&rest[..end])
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
    }
}

/// Split a raw value list into its elements
pub fn split_values(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Read the drive mode reported under `property`
pub fn parse_drive_mode(dump: &str, property: &PropertyId) -> Result<Option<DriveMode>> {
    let matcher = PropertyMatcher::new(property, ValueKind::Int32)?;
    Ok(matcher
        .extract(dump)
        .as_deref()
        .and_then(|raw| split_values(raw).first().and_then(|v| v.parse::<i64>().ok()))
        .map(DriveMode::from_raw))
}
