//! Core data types for CAN Assure
//!
//! This module contains the data structures shared by the transmitter, the
//! poller and the replay worker.
//!
//! # Main Types
//!
//! - [`CanId`] - CAN arbitration identifier (serialized as `"0x200"`)
//! - [`SignalSeries`] / [`SignalTimeSeries`] - scripted values per delay
//! - [`FrameGroup`] - per-cycle grouping of signal values by owning frame
//! - [`HeartbeatEntry`] / [`UserSendEntry`] / [`LiveSignals`] - what the
//!   transmitter sends every period
//! - [`DeviceSnapshot`] / [`SnapshotValue`] - state read back from the device
//! - [`PropertyId`] / [`ValueKind`] - device property addressing
//!
//! # Value Selection
//!
//! A series answers [`SignalSeries::value_at`] with the exact entry for the
//! delay if there is one, otherwise with the value stored at the largest
//! delay key. Values are never interpolated and never default to zero.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Signal name → physical value
pub type SignalValues = BTreeMap<String, f64>;

// ==================== CAN Id ====================

/// CAN arbitration identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanId(pub u32);

/// Largest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest extended (29-bit) identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

impl CanId {
    /// Raw identifier value
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Whether the identifier needs the 29-bit format
    pub fn requires_extended(self) -> bool {
        self.0 > MAX_STANDARD_ID
    }

    /// Parse `"0x200"`, `"200h"`, `"0X1A"` as hex and plain digits as decimal
    pub fn parse(text: &str) -> Option<Self> {
        let cleaned = text.trim().trim_matches(|c| c == '\'' || c == '’' || c == '‘');
        if cleaned.is_empty() {
            return None;
        }
        let lower = cleaned.to_ascii_lowercase();
        let value = if let Some(hex) = lower.strip_prefix("0x") {
            u32::from_str_radix(hex, 16).ok()?
        } else if let Some(hex) = lower.strip_suffix('h') {
            u32::from_str_radix(hex, 16).ok()?
        } else {
            lower.parse::<u32>().ok()?
        };
        (value <= MAX_EXTENDED_ID).then_some(CanId(value))
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl Serialize for CanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CanId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u32),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) if n <= MAX_EXTENDED_ID => Ok(CanId(n)),
            Repr::Number(n) => Err(serde::de::Error::custom(format!(
                "CAN id {n} exceeds 29 bits"
            ))),
            Repr::Text(s) => CanId::parse(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid CAN id '{s}'"))),
        }
    }
}

// ==================== Time Series ====================

/// Scripted values of one signal, keyed by delay in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalSeries {
    points: BTreeMap<u64, f64>,
}

impl SignalSeries {
    /// Create an empty series
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value at a delay
    pub fn insert(&mut self, delay_ms: u64, value: f64) {
        self.points.insert(delay_ms, value);
    }

    /// Builder-style insert
    pub fn with_point(mut self, delay_ms: u64, value: f64) -> Self {
        self.insert(delay_ms, value);
        self
    }

    /// Value for a delay: the exact entry, else the entry at the largest key
    pub fn value_at(&self, delay_ms: u64) -> Option<f64> {
        self.points
            .get(&delay_ms)
            .or_else(|| self.points.values().next_back())
            .copied()
    }

    /// Number of scripted points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the series holds no points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterate over (delay, value) pairs in delay order
    pub fn iter(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.points.iter().map(|(k, v)| (*k, *v))
    }
}

impl FromIterator<(u64, f64)> for SignalSeries {
    fn from_iter<I: IntoIterator<Item = (u64, f64)>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

/// Signal name → scripted series
pub type SignalTimeSeries = BTreeMap<String, SignalSeries>;

// ==================== Frame Groups ====================

/// Values for one frame within a cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameValues {
    /// CAN id resolved for the frame, if any source knows it
    pub can_id: Option<CanId>,
    /// Signal values for this cycle
    pub signals: SignalValues,
}

/// Frame name → values, rebuilt every cycle
pub type FrameGroup = BTreeMap<String, FrameValues>;

/// Flatten a frame group into signal → value for telemetry
pub fn flatten_frame_group(group: &FrameGroup) -> SignalValues {
    group
        .values()
        .flat_map(|frame| frame.signals.iter().map(|(s, v)| (s.clone(), *v)))
        .collect()
}

// ==================== Live Signal Sets ====================

/// A privileged frame sent every transmitter period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEntry {
    /// Frame name in the catalog
    pub frame_name: String,
    /// CAN id (falls back to the catalog when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_id: Option<CanId>,
    /// Current signal values
    #[serde(default)]
    pub signals: SignalValues,
}

impl HeartbeatEntry {
    /// Create a heartbeat entry
    pub fn new(frame_name: impl Into<String>, can_id: Option<CanId>) -> Self {
        Self {
            frame_name: frame_name.into(),
            can_id,
            signals: SignalValues::new(),
        }
    }

    /// Builder-style signal setter
    pub fn with_signal(mut self, name: impl Into<String>, value: f64) -> Self {
        self.signals.insert(name.into(), value);
        self
    }
}

/// A scripted frame sent alongside the heartbeat for the current cycle
#[derive(Debug, Clone, PartialEq)]
pub struct UserSendEntry {
    /// Frame name in the catalog
    pub frame_name: String,
    /// CAN id
    pub can_id: CanId,
    /// Signal values for the current cycle
    pub signals: SignalValues,
}

/// The signal sets the heartbeat transmitter reads every period
#[derive(Debug, Clone, Default)]
pub struct LiveSignals {
    /// Heartbeat frames, mutated in place
    pub heartbeat: Vec<HeartbeatEntry>,
    /// Scripted frames, replaced wholesale each cycle
    pub user: Vec<UserSendEntry>,
}

impl LiveSignals {
    /// Create live state seeded with a heartbeat set
    pub fn with_heartbeat(heartbeat: Vec<HeartbeatEntry>) -> Self {
        Self {
            heartbeat,
            user: Vec::new(),
        }
    }

    /// Names of the frames in the heartbeat set
    pub fn heartbeat_frames(&self) -> BTreeSet<String> {
        self.heartbeat.iter().map(|hb| hb.frame_name.clone()).collect()
    }

    /// Merge values into the heartbeat entries for `frame_name`
    ///
    /// Only signals the entry already carries are updated. Returns the number
    /// of signals changed.
    pub fn merge_heartbeat(&mut self, frame_name: &str, values: &SignalValues) -> usize {
        let mut updated = 0;
        for entry in self
            .heartbeat
            .iter_mut()
            .filter(|hb| hb.frame_name == frame_name)
        {
            for (signal, value) in values {
                if let Some(slot) = entry.signals.get_mut(signal) {
                    *slot = *value;
                    updated += 1;
                }
            }
        }
        updated
    }

    /// Replace the scripted frame list
    pub fn replace_user(&mut self, entries: Vec<UserSendEntry>) {
        self.user = entries;
    }

    /// Total number of frames sent per period
    pub fn frame_count(&self) -> usize {
        self.heartbeat.len() + self.user.len()
    }
}

// ==================== Device State ====================

/// A value read back from the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotValue {
    /// Raw bracketed value list content, e.g. `"1"` or `"1.5, 2.0"`
    Value(String),
    /// The property was not present in the dump
    NotFound,
    /// The device could not be queried
    DeviceNotFound,
}

impl SnapshotValue {
    /// Whether this is a real value
    pub fn is_value(&self) -> bool {
        matches!(self, SnapshotValue::Value(_))
    }

    /// Parse a single numeric value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SnapshotValue::Value(v) => v.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotValue::Value(v) => write!(f, "{v}"),
            SnapshotValue::NotFound => write!(f, "Not found"),
            SnapshotValue::DeviceNotFound => write!(f, "Device not found"),
        }
    }
}

/// Signal name → value read back from the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    values: BTreeMap<String, SnapshotValue>,
}

impl DeviceSnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot mapping every signal to [`SnapshotValue::DeviceNotFound`]
    pub fn device_not_found<'a>(signals: impl IntoIterator<Item = &'a String>) -> Self {
        signals
            .into_iter()
            .map(|s| (s.clone(), SnapshotValue::DeviceNotFound))
            .collect()
    }

    /// Set a signal's value
    pub fn insert(&mut self, signal: impl Into<String>, value: SnapshotValue) {
        self.values.insert(signal.into(), value);
    }

    /// Get a signal's value
    pub fn get(&self, signal: &str) -> Option<&SnapshotValue> {
        self.values.get(signal)
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Number of signals
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot holds no signals
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over (signal, value)
    pub fn iter(&self) -> impl Iterator<Item = (&String, &SnapshotValue)> {
        self.values.iter()
    }
}

impl FromIterator<(String, SnapshotValue)> for DeviceSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, SnapshotValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

// ==================== Device Properties ====================

/// Normalized device property id: lowercase hex without the `0x` prefix
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyId(String);

impl PropertyId {
    /// Normalize `"0x21608350"`, `"‘0X21608350’"`, `"21608350"` to one form
    pub fn new(raw: &str) -> Option<Self> {
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '’' | '‘' | '\'' | '"'))
            .collect::<String>()
            .to_ascii_lowercase();
        let hex = cleaned.strip_prefix("0x").unwrap_or(&cleaned).trim();
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(PropertyId(hex.to_string()))
    }

    /// Build from a decimal numeric id
    pub fn from_decimal(id: u64) -> Self {
        PropertyId(format!("{id:x}"))
    }

    /// Hex digits without prefix
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.0)
    }
}

/// Declared value kind of a device property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueKind {
    /// 32-bit integers (also booleans)
    Int32,
    /// 64-bit integers
    Int64,
    /// Raw bytes
    Bytes,
    /// String value
    String,
    /// Floating point (default)
    #[default]
    Float,
}

impl ValueKind {
    /// Name of the dump field that carries this kind's values
    pub fn field_name(self) -> &'static str {
        match self {
            ValueKind::Int32 => "int32Values",
            ValueKind::Int64 => "int64Values",
            ValueKind::Bytes => "bytes",
            ValueKind::String => "string",
            ValueKind::Float => "floatValues",
        }
    }

    /// Map a declared property type name (`INT32`, `INT64_VEC`, `BOOLEAN`, ...)
    pub fn from_declared(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        if upper.starts_with("INT32") || upper == "BOOLEAN" {
            ValueKind::Int32
        } else if upper.starts_with("INT64") {
            ValueKind::Int64
        } else if upper == "BYTES" {
            ValueKind::Bytes
        } else if upper == "STRING" {
            ValueKind::String
        } else {
            ValueKind::Float
        }
    }
}

// ==================== Status ====================

/// Bus interface state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Interface is up
    Up,
    /// Interface is down or missing
    Down,
}

impl LinkState {
    /// Build from a boolean up flag
    pub fn from_up(up: bool) -> Self {
        if up {
            LinkState::Up
        } else {
            LinkState::Down
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Up => write!(f, "up"),
            LinkState::Down => write!(f, "down"),
        }
    }
}

/// Vehicle power mode reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// Signal not available
    Sna,
    Sleep,
    Awake,
    Standby,
    Drive,
    Charge,
    /// Any other reported value
    Unknown(i64),
}

impl DriveMode {
    /// Map a raw int32 mode value
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => DriveMode::Sna,
            1 => DriveMode::Sleep,
            2 => DriveMode::Awake,
            3 => DriveMode::Standby,
            4 => DriveMode::Drive,
            5 => DriveMode::Charge,
            other => DriveMode::Unknown(other),
        }
    }

    /// Whether the device is in drive mode
    pub fn is_drive(self) -> bool {
        self == DriveMode::Drive
    }
}

impl fmt::Display for DriveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveMode::Sna => write!(f, "VL1_SNA"),
            DriveMode::Sleep => write!(f, "Sleep"),
            DriveMode::Awake => write!(f, "Awake"),
            DriveMode::Standby => write!(f, "Standby"),
            DriveMode::Drive => write!(f, "Drive"),
            DriveMode::Charge => write!(f, "Charge"),
            DriveMode::Unknown(raw) => write!(f, "Unknown({raw})"),
        }
    }
}
