//! Frame/signal catalog and payload encoding
//!
//! The catalog describes which signals each CAN frame carries and how they
//! are packed into the payload. [`JsonCatalog`] loads a JSON document:
//!
//! ```json
//! {
//!   "frames": [
//!     {
//!       "name": "Body_Ctrl",
//!       "id": "0x200",
//!       "dlc": 8,
//!       "signals": [
//!         { "name": "Door_Lock", "start_bit": 0, "length": 1 },
//!         { "name": "Speed", "start_bit": 7, "length": 16,
//!           "byte_order": "big_endian", "factor": 0.01, "max": 300.0 }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! # Encoding
//!
//! Each physical value is converted with `raw = round((value - offset) / factor)`
//! and range checked against the declared min/max and the bit length.
//! Little-endian signals fill bits upward from `start_bit`; big-endian signals
//! start at their most significant bit and walk the payload in Motorola order.
//! Signals missing from the value map take their `initial` value when one is
//! declared, otherwise encoding fails.

use crate::error::{CanAssureError, Result};
use crate::types::{CanId, SignalValues};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Collaborator describing frames and encoding their payloads
#[cfg_attr(test, mockall::automock)]
pub trait Catalog: Send + Sync {
    /// All frame definitions
    fn frames(&self) -> Vec<FrameDef>;

    /// Look up one frame by name
    fn frame(&self, name: &str) -> Option<FrameDef>;

    /// Encode a frame payload from physical signal values
    fn encode(&self, frame_name: &str, values: &SignalValues) -> Result<Vec<u8>>;
}

/// Bit layout of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel layout
    #[default]
    LittleEndian,
    /// Motorola layout
    BigEndian,
}

/// A signal within a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDef {
    pub name: String,
    pub start_bit: u16,
    pub length: u16,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Value used when a frame is encoded without this signal
    #[serde(default)]
    pub initial: Option<f64>,
}

fn default_factor() -> f64 {
    1.0
}

fn default_dlc() -> u8 {
    8
}

impl SignalDef {
    /// Create an unsigned little-endian signal with unit scaling
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            signed: false,
            factor: 1.0,
            offset: 0.0,
            min: None,
            max: None,
            initial: None,
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.byte_order = ByteOrder::BigEndian;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn with_scale(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_initial(mut self, initial: f64) -> Self {
        self.initial = Some(initial);
        self
    }

    /// Convert a physical value to its raw bit pattern
    fn to_raw(&self, frame: &str, value: f64) -> Result<u64> {
        if !value.is_finite() {
            return Err(CanAssureError::encode(
                frame,
                format!("signal {} has non-finite value {}", self.name, value),
            ));
        }
        if let Some(min) = self.min {
            if value < min - f64::EPSILON {
                return Err(CanAssureError::encode(
                    frame,
                    format!("signal {} value {} below minimum {}", self.name, value, min),
                ));
            }
        }
        if let Some(max) = self.max {
            if value > max + f64::EPSILON {
                return Err(CanAssureError::encode(
                    frame,
                    format!("signal {} value {} above maximum {}", self.name, value, max),
                ));
            }
        }
        if self.factor == 0.0 {
            return Err(CanAssureError::encode(
                frame,
                format!("signal {} has zero factor", self.name),
            ));
        }

        let raw = ((value - self.offset) / self.factor).round();
        let bits = u32::from(self.length);
        let (lo, hi) = if self.signed {
            (-(2f64.powi(bits as i32 - 1)), 2f64.powi(bits as i32 - 1) - 1.0)
        } else {
            (0.0, 2f64.powi(bits as i32) - 1.0)
        };
        if raw < lo || raw > hi {
            return Err(CanAssureError::encode(
                frame,
                format!(
                    "signal {} raw value {} does not fit in {} bits",
                    self.name, raw, self.length
                ),
            ));
        }

        let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        Ok((raw as i64 as u64) & mask)
    }

    /// Write a raw value into the payload
    fn place(&self, frame: &str, raw: u64, data: &mut [u8]) -> Result<()> {
        let length = usize::from(self.length);
        let mut pos = usize::from(self.start_bit);

        match self.byte_order {
            ByteOrder::LittleEndian => {
                for i in 0..length {
                    set_bit(frame, &self.name, data, pos + i, (raw >> i) & 1 == 1)?;
                }
            }
            ByteOrder::BigEndian => {
                for i in (0..length).rev() {
                    set_bit(frame, &self.name, data, pos, (raw >> i) & 1 == 1)?;
                    if pos % 8 == 0 {
                        pos += 15;
                    } else {
                        pos -= 1;
                    }
                }
            }
        }
        Ok(())
    }
}

fn set_bit(frame: &str, signal: &str, data: &mut [u8], pos: usize, on: bool) -> Result<()> {
    let byte = data.get_mut(pos / 8).ok_or_else(|| {
        CanAssureError::encode(
            frame,
            format!("signal {} does not fit the frame payload", signal),
        )
    })?;
    if on {
        *byte |= 1 << (pos % 8);
    } else {
        *byte &= !(1 << (pos % 8));
    }
    Ok(())
}

/// A frame definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDef {
    pub name: String,
    pub id: CanId,
    /// Force the 29-bit format even for small ids
    #[serde(default)]
    pub extended: bool,
    #[serde(default = "default_dlc")]
    pub dlc: u8,
    #[serde(default)]
    pub signals: Vec<SignalDef>,
}

impl FrameDef {
    /// Create an 8-byte frame definition
    pub fn new(name: impl Into<String>, id: CanId) -> Self {
        Self {
            name: name.into(),
            id,
            extended: false,
            dlc: 8,
            signals: Vec::new(),
        }
    }

    pub fn with_signal(mut self, signal: SignalDef) -> Self {
        self.signals.push(signal);
        self
    }

    /// Look up a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDef> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Whether the frame uses the 29-bit identifier format
    pub fn is_extended(&self) -> bool {
        self.extended || self.id.requires_extended()
    }

    /// Encode the payload from physical values
    pub fn encode(&self, values: &SignalValues) -> Result<Vec<u8>> {
        let mut data = vec![0u8; usize::from(self.dlc)];
        for signal in &self.signals {
            let value = values
                .get(&signal.name)
                .copied()
                .or(signal.initial)
                .ok_or_else(|| {
                    CanAssureError::encode(
                        &self.name,
                        format!("missing value for signal {}", signal.name),
                    )
                })?;
            let raw = signal.to_raw(&self.name, value)?;
            signal.place(&self.name, raw, &mut data)?;
        }
        Ok(data)
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct CatalogDocument {
    frames: Vec<FrameDef>,
}

/// Catalog backed by a JSON document
#[derive(Debug, Clone, Default)]
pub struct JsonCatalog {
    frames: Vec<FrameDef>,
    by_name: HashMap<String, usize>,
}

impl JsonCatalog {
    /// Load a catalog document from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CanAssureError::Catalog(format!("Failed to read catalog {:?}: {}", path, e))
        })?;
        let catalog = Self::from_json(&content)?;
        tracing::info!(
            "Loaded catalog {:?} with {} frames",
            path,
            catalog.frames.len()
        );
        Ok(catalog)
    }

    /// Parse a catalog document
    pub fn from_json(content: &str) -> Result<Self> {
        let doc: CatalogDocument = serde_json::from_str(content)
            .map_err(|e| CanAssureError::Catalog(format!("Invalid catalog document: {}", e)))?;
        Self::from_frames(doc.frames)
    }

    /// Build a catalog from frame definitions
    pub fn from_frames(frames: Vec<FrameDef>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(frames.len());
        for (index, frame) in frames.iter().enumerate() {
            if frame.dlc > 8 {
                return Err(CanAssureError::Catalog(format!(
                    "Frame {} has dlc {} (max 8)",
                    frame.name, frame.dlc
                )));
            }
            if by_name.insert(frame.name.clone(), index).is_some() {
                return Err(CanAssureError::Catalog(format!(
                    "Duplicate frame name {}",
                    frame.name
                )));
            }
        }
        Ok(Self { frames, by_name })
    }

    /// Serialize back to a JSON document
    pub fn to_json(&self) -> Result<String> {
        let doc = CatalogDocument {
            frames: self.frames.clone(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }
}

impl Catalog for JsonCatalog {
    fn frames(&self) -> Vec<FrameDef> {
        self.frames.clone()
    }

    fn frame(&self, name: &str) -> Option<FrameDef> {
        self.by_name.get(name).map(|&i| self.frames[i].clone())
    }

    fn encode(&self, frame_name: &str, values: &SignalValues) -> Result<Vec<u8>> {
        let index = self
            .by_name
            .get(frame_name)
            .ok_or_else(|| CanAssureError::encode(frame_name, "unknown frame"))?;
        self.frames[*index].encode(values)
    }
}
