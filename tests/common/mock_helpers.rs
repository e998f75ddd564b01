//! Mock construction helpers

use can_assure::backend::{CellValue, JsonVectorStore, Sheet, VectorStore, Workbook};
use can_assure::types::{CanId, PropertyId, SignalTimeSeries};
use can_assure::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Vector store wrapper counting writes and saves
pub struct CountingStore {
    pub inner: JsonVectorStore,
    saves: AtomicUsize,
    writes: AtomicUsize,
    series_reads: AtomicUsize,
    panic_on_write: AtomicBool,
}

impl CountingStore {
    pub fn new(inner: JsonVectorStore) -> Self {
        Self {
            inner,
            saves: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            series_reads: AtomicUsize::new(0),
            panic_on_write: AtomicBool::new(false),
        }
    }

    pub fn in_memory(workbook: Workbook) -> Self {
        Self::new(JsonVectorStore::in_memory(workbook))
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn series_reads(&self) -> usize {
        self.series_reads.load(Ordering::SeqCst)
    }

    /// Panic on every `write_cell` from now on
    pub fn panic_on_write(&self) {
        self.panic_on_write.store(true, Ordering::SeqCst);
    }
}

impl VectorStore for CountingStore {
    fn read_time_series(&self) -> Result<SignalTimeSeries> {
        self.series_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_time_series()
    }

    fn read_property_map(&self) -> Result<BTreeMap<String, PropertyId>> {
        self.inner.read_property_map()
    }

    fn read_frame_id_map(&self) -> Result<BTreeMap<String, CanId>> {
        self.inner.read_frame_id_map()
    }

    fn read_delay_list(&self) -> Result<Vec<u64>> {
        self.inner.read_delay_list()
    }

    fn find_property_id(&self, signal: &str) -> Result<Option<PropertyId>> {
        self.inner.find_property_id(signal)
    }

    fn read_sheet(&self, name: &str) -> Result<Option<Sheet>> {
        self.inner.read_sheet(name)
    }

    fn ensure_sheet(&self, name: &str) -> Result<()> {
        self.inner.ensure_sheet(name)
    }

    fn write_cell(&self, sheet: &str, row: usize, col: usize, value: CellValue) -> Result<()> {
        if self.panic_on_write.load(Ordering::SeqCst) {
            panic!("write_cell failed");
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_cell(sheet, row, col, value)
    }

    fn save(&self) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save()
    }

    fn enable_fast_path(&self) -> Result<()> {
        self.inner.enable_fast_path()
    }

    fn clear_fast_path(&self) {
        self.inner.clear_fast_path()
    }
}
