//! Test vector workbook access
//!
//! The vector store is a workbook of named sheets holding cells. The layout
//! the engine relies on:
//!
//! - **`CAN_Signals`** (first sheet): row 1 holds device property ids, row 2
//!   holds signal names with `Time (ms)` in column 1, rows 3+ hold the delay
//!   in column 1 followed by one scripted value per signal.
//! - **`Frames`** (second sheet): a header row, then `frame name | CAN id`.
//! - **`Results`**: written by the result sink.
//!
//! Rows and columns are 1-based, like the spreadsheets these files are
//! exported from.
//!
//! [`JsonVectorStore`] keeps the workbook on disk as JSON. Reads go to disk
//! unless the fast path is enabled, in which case they are served from one
//! in-memory copy. Writes always land in memory and reach disk only through
//! [`VectorStore::save`].

use crate::error::{CanAssureError, Result};
use crate::types::{CanId, PropertyId, SignalSeries, SignalTimeSeries};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Sheet holding the scripted time series
pub const SIGNALS_SHEET: &str = "CAN_Signals";

/// Sheet holding the frame → CAN id table
pub const FRAMES_SHEET: &str = "Frames";

/// Sheet written by the result sink
pub const RESULTS_SHEET: &str = "Results";

/// Header of the delay column
pub const TIME_HEADER: &str = "Time (ms)";

/// First data row of the signals sheet
pub const FIRST_VALUE_ROW: usize = 3;

// ==================== Cells and Sheets ====================

/// A single cell value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Create a text cell
    pub fn text(value: impl Into<String>) -> Self {
        CellValue::Text(value.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(_) => false,
        }
    }

    /// Numeric view of the cell, parsing text when needed
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Text(s) => s.trim().parse().ok(),
            CellValue::Empty => None,
        }
    }

    /// Text view of the cell
    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Empty => None,
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Some(format!("{}", *n as i64))
            }
            CellValue::Number(n) => Some(n.to_string()),
            CellValue::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
        }
    }

    /// Delay in milliseconds, if the cell holds a non-negative number
    pub fn as_delay(&self) -> Option<u64> {
        self.as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v.round() as u64)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

/// A named grid of cells
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<Vec<CellValue>>,
}

static EMPTY_CELL: CellValue = CellValue::Empty;

impl Sheet {
    /// Create an empty sheet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
        }
    }

    /// Cell at a 1-based position, empty when out of range
    pub fn cell(&self, row: usize, col: usize) -> &CellValue {
        if row == 0 || col == 0 {
            return &EMPTY_CELL;
        }
        self.rows
            .get(row - 1)
            .and_then(|r| r.get(col - 1))
            .unwrap_or(&EMPTY_CELL)
    }

    /// Set a cell at a 1-based position, growing the grid as needed
    pub fn set_cell(&mut self, row: usize, col: usize, value: CellValue) {
        if row == 0 || col == 0 {
            return;
        }
        if self.rows.len() < row {
            self.rows.resize_with(row, Vec::new);
        }
        let cells = &mut self.rows[row - 1];
        if cells.len() < col {
            cells.resize_with(col, CellValue::default);
        }
        cells[col - 1] = value;
    }

    /// Number of rows
    pub fn max_row(&self) -> usize {
        self.rows.len()
    }

    /// Width of the widest row
    pub fn max_col(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Signal name → column from the header on row 2
    pub fn signal_columns(&self) -> BTreeMap<String, usize> {
        (2..=self.max_col())
            .filter_map(|col| self.cell(2, col).as_text().map(|name| (name, col)))
            .collect()
    }
}

/// A workbook document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    #[serde(default)]
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    /// Load a workbook document
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CanAssureError::VectorStore(format!("Failed to read workbook {:?}: {}", path, e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            CanAssureError::VectorStore(format!("Invalid workbook {:?}: {}", path, e))
        })
    }

    /// Write the workbook document, replacing the file atomically
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_vec_pretty(self)?;
        crate::config::write_atomically(path, &content).map_err(|e| {
            CanAssureError::VectorStore(format!("Failed to write workbook {:?}: {}", path, e))
        })
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_mut(&mut self, name: &str) -> Option<&mut Sheet> {
        self.sheets.iter_mut().find(|s| s.name == name)
    }

    /// Get a sheet, creating it at the end if missing
    pub fn ensure_sheet(&mut self, name: &str) -> &mut Sheet {
        match self.sheets.iter().position(|s| s.name == name) {
            Some(index) => &mut self.sheets[index],
            None => {
                self.sheets.push(Sheet::new(name));
                let last = self.sheets.len() - 1;
                &mut self.sheets[last]
            }
        }
    }

    /// The scripted signals sheet: by name, else the first sheet
    pub fn signals_sheet(&self) -> Option<&Sheet> {
        self.sheet(SIGNALS_SHEET).or_else(|| self.sheets.first())
    }

    /// The frame table: by name, else the second sheet
    pub fn frames_sheet(&self) -> Option<&Sheet> {
        self.sheet(FRAMES_SHEET).or_else(|| {
            self.sheets
                .get(1)
                .filter(|s| s.name != SIGNALS_SHEET && s.name != RESULTS_SHEET)
        })
    }

    fn signals(&self) -> Result<&Sheet> {
        self.signals_sheet()
            .ok_or_else(|| CanAssureError::VectorStore("Workbook has no sheets".to_string()))
    }

    // ==================== Layout Readers ====================

    /// Scripted values per signal; empty cells produce no entry
    pub fn time_series(&self) -> Result<SignalTimeSeries> {
        let sheet = self.signals()?;
        let mut series = SignalTimeSeries::new();

        for (signal, col) in sheet.signal_columns() {
            let mut points = SignalSeries::new();
            for row in FIRST_VALUE_ROW..=sheet.max_row() {
                let Some(delay) = sheet.cell(row, 1).as_delay() else {
                    continue;
                };
                let cell = sheet.cell(row, col);
                if cell.is_empty() {
                    continue;
                }
                match cell.as_f64() {
                    Some(value) => points.insert(delay, value),
                    None => tracing::debug!(
                        "Skipping non-numeric value {:?} for {} at {} ms",
                        cell,
                        signal,
                        delay
                    ),
                }
            }
            series.insert(signal, points);
        }

        Ok(series)
    }

    /// Signal name → property id from rows 1 and 2
    pub fn property_map(&self) -> Result<BTreeMap<String, PropertyId>> {
        let sheet = self.signals()?;
        Ok(sheet
            .signal_columns()
            .into_iter()
            .filter_map(|(signal, col)| {
                let raw = sheet.cell(1, col).as_text()?;
                PropertyId::new(&raw).map(|id| (signal, id))
            })
            .collect())
    }

    /// Frame name → CAN id from the frame table
    pub fn frame_id_map(&self) -> BTreeMap<String, CanId> {
        let Some(sheet) = self.frames_sheet() else {
            return BTreeMap::new();
        };
        (2..=sheet.max_row())
            .filter_map(|row| {
                let name = sheet.cell(row, 1).as_text()?;
                let id = match sheet.cell(row, 2) {
                    CellValue::Number(n) if *n >= 0.0 => Some(CanId(*n as u32)),
                    CellValue::Text(s) => CanId::parse(s),
                    _ => None,
                }?;
                Some((name, id))
            })
            .collect()
    }

    /// Delays listed in the time column, in row order
    pub fn delay_list(&self) -> Result<Vec<u64>> {
        let sheet = self.signals()?;
        Ok((FIRST_VALUE_ROW..=sheet.max_row())
            .filter_map(|row| sheet.cell(row, 1).as_delay())
            .collect())
    }

    /// Scan the signals sheet for a cell naming the signal and read the id above it
    pub fn find_property_id(&self, signal: &str) -> Option<PropertyId> {
        let sheet = self.signals_sheet()?;
        for row in 2..=sheet.max_row() {
            for col in 1..=sheet.max_col() {
                let Some(text) = sheet.cell(row, col).as_text() else {
                    continue;
                };
                if text.contains(signal) {
                    return sheet
                        .cell(row - 1, col)
                        .as_text()
                        .and_then(|raw| PropertyId::new(&raw));
                }
            }
        }
        None
    }
}

// ==================== Vector Store ====================

/// Collaborator providing the test vector and receiving results
#[cfg_attr(test, mockall::automock)]
pub trait VectorStore: Send + Sync {
    /// Scripted values per signal
    fn read_time_series(&self) -> Result<SignalTimeSeries>;

    /// Signal name → property id from the signals sheet header
    fn read_property_map(&self) -> Result<BTreeMap<String, PropertyId>>;

    /// Frame name → CAN id from the frame table
    fn read_frame_id_map(&self) -> Result<BTreeMap<String, CanId>>;

    /// Delays listed in the time column
    fn read_delay_list(&self) -> Result<Vec<u64>>;

    /// Slow scan for a signal's property id
    fn find_property_id(&self, signal: &str) -> Result<Option<PropertyId>>;

    /// Copy of a sheet, if present
    fn read_sheet(&self, name: &str) -> Result<Option<Sheet>>;

    /// Create a sheet if it does not exist
    fn ensure_sheet(&self, name: &str) -> Result<()>;

    /// Set one cell in memory
    fn write_cell(&self, sheet: &str, row: usize, col: usize, value: CellValue) -> Result<()>;

    /// Persist pending writes
    fn save(&self) -> Result<()>;

    /// Serve reads from one in-memory copy of the workbook
    fn enable_fast_path(&self) -> Result<()>;

    /// Drop the in-memory copy unless it holds unsaved writes
    fn clear_fast_path(&self);
}

#[derive(Debug, Default)]
struct StoreState {
    workbook: Option<Workbook>,
    fast: bool,
    dirty: bool,
}

/// Vector store backed by a JSON workbook document
#[derive(Debug)]
pub struct JsonVectorStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl JsonVectorStore {
    /// Open a workbook on disk (read lazily)
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Keep a workbook in memory only; `save` does not touch disk
    pub fn in_memory(workbook: Workbook) -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState {
                workbook: Some(workbook),
                fast: true,
                dirty: false,
            }),
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether unsaved writes are pending
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Copy of the current workbook
    pub fn workbook(&self) -> Result<Workbook> {
        self.with_workbook(|wb| Ok(wb.clone()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_from_disk(&self) -> Result<Workbook> {
        match self.path.as_deref() {
            Some(path) => Workbook::load(path),
            None => Ok(Workbook::default()),
        }
    }

    /// Read through the in-memory copy when present, else from disk
    fn with_workbook<T>(&self, read: impl FnOnce(&Workbook) -> Result<T>) -> Result<T> {
        let state = self.lock();
        if let Some(workbook) = state.workbook.as_ref() {
            return read(workbook);
        }
        drop(state);

        let workbook = self.load_from_disk()?;
        read(&workbook)
    }

    /// Mutate the in-memory copy, loading it first if needed
    fn with_workbook_mut<T>(&self, write: impl FnOnce(&mut Workbook) -> T) -> Result<T> {
        let mut state = self.lock();
        if state.workbook.is_none() {
            state.workbook = Some(self.load_from_disk()?);
        }
        state.dirty = true;
        match state.workbook.as_mut() {
            Some(workbook) => Ok(write(workbook)),
            None => Err(CanAssureError::VectorStore(
                "Workbook not loaded".to_string(),
            )),
        }
    }
}

impl VectorStore for JsonVectorStore {
    fn read_time_series(&self) -> Result<SignalTimeSeries> {
        self.with_workbook(Workbook::time_series)
    }

    fn read_property_map(&self) -> Result<BTreeMap<String, PropertyId>> {
        self.with_workbook(Workbook::property_map)
    }

    fn read_frame_id_map(&self) -> Result<BTreeMap<String, CanId>> {
        self.with_workbook(|wb| Ok(wb.frame_id_map()))
    }

    fn read_delay_list(&self) -> Result<Vec<u64>> {
        self.with_workbook(Workbook::delay_list)
    }

    fn find_property_id(&self, signal: &str) -> Result<Option<PropertyId>> {
        self.with_workbook(|wb| Ok(wb.find_property_id(signal)))
    }

    fn read_sheet(&self, name: &str) -> Result<Option<Sheet>> {
        self.with_workbook(|wb| Ok(wb.sheet(name).cloned()))
    }

    fn ensure_sheet(&self, name: &str) -> Result<()> {
        self.with_workbook_mut(|wb| {
            wb.ensure_sheet(name);
        })
    }

    fn write_cell(&self, sheet: &str, row: usize, col: usize, value: CellValue) -> Result<()> {
        self.with_workbook_mut(|wb| wb.ensure_sheet(sheet).set_cell(row, col, value))
    }

    fn save(&self) -> Result<()> {
        let mut state = self.lock();
        if let (Some(path), Some(workbook)) = (self.path.as_deref(), state.workbook.as_ref()) {
            workbook.save(path)?;
            tracing::info!("Saved workbook {:?}", path);
        }
        state.dirty = false;
        if !state.fast && self.path.is_some() {
            state.workbook = None;
        }
        Ok(())
    }

    fn enable_fast_path(&self) -> Result<()> {
        let mut state = self.lock();
        if state.workbook.is_none() {
            state.workbook = Some(self.load_from_disk()?);
        }
        state.fast = true;
        Ok(())
    }

    fn clear_fast_path(&self) {
        let mut state = self.lock();
        state.fast = false;
        if !state.dirty && self.path.is_some() {
            state.workbook = None;
        }
    }
}
