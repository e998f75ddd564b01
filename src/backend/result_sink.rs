//! Result sink
//!
//! Records device readbacks next to the scripted values in the `Results`
//! sheet of the vector store.
//!
//! # Layout
//!
//! ```text
//! row 2:  Time (ms) | Door_Lock |      | Speed |      | ...
//! row 3:            | TX        | RX   | TX    | RX   |
//! row 4:  0         | 1         | 1    | 40    | 39.5 |
//! row 5:  100       | 0         | 0    | 45    | 45   |
//! ```
//!
//! [`ResultSink::prepare`] builds the header, the delay rows and the TX
//! columns, and indexes where each result goes. [`ResultSink::record`] only
//! writes cells in memory. Nothing reaches disk until [`ResultSink::save`].

use crate::backend::vector_store::{
    CellValue, Sheet, VectorStore, FIRST_VALUE_ROW, RESULTS_SHEET, SIGNALS_SHEET, TIME_HEADER,
};
use crate::error::Result;
use crate::types::DeviceSnapshot;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Row holding signal names
pub const HEADER_ROW: usize = 2;

/// Row holding the TX/RX sub-headers
pub const SUBHEADER_ROW: usize = 3;

/// First delay row
pub const FIRST_RESULT_ROW: usize = 4;

/// Where results go, built by [`ResultSink::prepare`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultLayout {
    /// Delay → result row
    pub delay_rows: BTreeMap<u64, usize>,
    /// Signal → TX column
    pub tx_columns: BTreeMap<String, usize>,
    /// Signal → RX column
    pub rx_columns: BTreeMap<String, usize>,
}

impl ResultLayout {
    /// RX cell for a delay and signal
    pub fn rx_cell(&self, delay_ms: u64, signal: &str) -> Option<(usize, usize)> {
        Some((*self.delay_rows.get(&delay_ms)?, *self.rx_columns.get(signal)?))
    }
}

/// Writes correlated results into the vector store
pub struct ResultSink {
    store: Arc<dyn VectorStore>,
    layout: Option<ResultLayout>,
}

impl ResultSink {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            layout: None,
        }
    }

    pub fn layout(&self) -> Option<&ResultLayout> {
        self.layout.as_ref()
    }

    /// Build the results header, delay rows and TX columns
    ///
    /// Signals already present in the header keep their columns, so calling
    /// this again with the same inputs leaves the sheet unchanged.
    pub fn prepare(&mut self, delays: &[u64], signals: &[String]) -> Result<&ResultLayout> {
        self.store.ensure_sheet(RESULTS_SHEET)?;
        let existing = self
            .store
            .read_sheet(RESULTS_SHEET)?
            .unwrap_or_else(|| Sheet::new(RESULTS_SHEET));

        self.store
            .write_cell(RESULTS_SHEET, HEADER_ROW, 1, CellValue::text(TIME_HEADER))?;

        let mut layout = ResultLayout::default();
        let known = existing.signal_columns();
        let mut next_col = existing.max_col().max(1) + 1;

        for signal in signals {
            let tx_col = match known.get(signal) {
                Some(col) => *col,
                None => {
                    let col = next_col;
                    next_col += 2;
                    col
                }
            };
            self.store
                .write_cell(RESULTS_SHEET, HEADER_ROW, tx_col, CellValue::text(signal.as_str()))?;
            self.store
                .write_cell(RESULTS_SHEET, SUBHEADER_ROW, tx_col, CellValue::text("TX"))?;
            self.store
                .write_cell(RESULTS_SHEET, SUBHEADER_ROW, tx_col + 1, CellValue::text("RX"))?;
            layout.tx_columns.insert(signal.clone(), tx_col);
            layout.rx_columns.insert(signal.clone(), tx_col + 1);
        }

        for (index, delay) in delays.iter().enumerate() {
            let row = FIRST_RESULT_ROW + index;
            self.store
                .write_cell(RESULTS_SHEET, row, 1, CellValue::Number(*delay as f64))?;
            layout.delay_rows.entry(*delay).or_insert(row);
        }

        self.copy_tx_values(&layout)?;

        tracing::debug!(
            "Results sheet prepared: {} delays, {} signals",
            layout.delay_rows.len(),
            layout.rx_columns.len()
        );
        Ok(self.layout.insert(layout))
    }

    /// Copy scripted values down from the signals sheet, shifted one row
    fn copy_tx_values(&self, layout: &ResultLayout) -> Result<()> {
        let Some(source) = self.store.read_sheet(SIGNALS_SHEET)? else {
            tracing::warn!("No {} sheet, TX columns left empty", SIGNALS_SHEET);
            return Ok(());
        };
        let source_columns = source.signal_columns();

        for (signal, tx_col) in &layout.tx_columns {
            let Some(src_col) = source_columns.get(signal) else {
                continue;
            };
            for row in FIRST_VALUE_ROW..=source.max_row() {
                let value = source.cell(row, *src_col);
                if !value.is_empty() {
                    self.store
                        .write_cell(RESULTS_SHEET, row + 1, *tx_col, value.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Write a snapshot into the row for `delay_ms`
    ///
    /// Returns the number of cells written. Signals without a results column
    /// and delays without a row are skipped.
    pub fn record(&self, delay_ms: u64, snapshot: &DeviceSnapshot) -> Result<usize> {
        let Some(layout) = self.layout.as_ref() else {
            tracing::warn!("Result sink not prepared, dropping results for {} ms", delay_ms);
            return Ok(0);
        };
        let Some(row) = layout.delay_rows.get(&delay_ms).copied() else {
            tracing::warn!("No results row for delay {} ms", delay_ms);
            return Ok(0);
        };

        let mut written = 0;
        for (signal, value) in snapshot.iter() {
            if let Some(col) = layout.rx_columns.get(signal) {
                self.store
                    .write_cell(RESULTS_SHEET, row, *col, CellValue::text(value.to_string()))?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Persist everything recorded so far
    pub fn save(&self) -> Result<()> {
        self.store.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::vector_store::{JsonVectorStore, Workbook};
    use crate::types::SnapshotValue;

    fn workbook() -> Workbook {
        let mut signals = Sheet::new(SIGNALS_SHEET);
        signals.set_cell(1, 2, CellValue::text("0x21400100"));
        signals.set_cell(2, 1, CellValue::text(TIME_HEADER));
        signals.set_cell(2, 2, CellValue::text("Door_Lock"));
        signals.set_cell(3, 1, CellValue::Number(0.0));
        signals.set_cell(3, 2, CellValue::Number(1.0));
        signals.set_cell(4, 1, CellValue::Number(100.0));
        signals.set_cell(4, 2, CellValue::Number(0.0));
        Workbook {
            sheets: vec![signals],
        }
    }

    fn results(store: &JsonVectorStore) -> Sheet {
        store
            .workbook()
            .unwrap()
            .sheet(RESULTS_SHEET)
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_prepare_builds_layout() {
        let store = Arc::new(JsonVectorStore::in_memory(workbook()));
        let mut sink = ResultSink::new(store.clone());
        let layout = sink
            .prepare(&[0, 100], &["Door_Lock".to_string()])
            .unwrap()
            .clone();

        assert_eq!(layout.rx_cell(0, "Door_Lock"), Some((4, 3)));
        assert_eq!(layout.rx_cell(100, "Door_Lock"), Some((5, 3)));

        let sheet = results(&store);
        assert_eq!(sheet.cell(2, 1), &CellValue::text(TIME_HEADER));
        assert_eq!(sheet.cell(2, 2), &CellValue::text("Door_Lock"));
        assert_eq!(sheet.cell(3, 2), &CellValue::text("TX"));
        assert_eq!(sheet.cell(3, 3), &CellValue::text("RX"));
        assert_eq!(sheet.cell(4, 1), &CellValue::Number(0.0));
        // TX copied down one row
        assert_eq!(sheet.cell(4, 2), &CellValue::Number(1.0));
        assert_eq!(sheet.cell(5, 2), &CellValue::Number(0.0));
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let store = Arc::new(JsonVectorStore::in_memory(workbook()));
        let mut sink = ResultSink::new(store.clone());
        let signals = vec!["Door_Lock".to_string(), "Speed".to_string()];

        sink.prepare(&[0, 100], &signals).unwrap();
        let first = results(&store);
        let first_layout = sink.layout().cloned();

        sink.prepare(&[0, 100], &signals).unwrap();
        assert_eq!(results(&store), first);
        assert_eq!(sink.layout().cloned(), first_layout);
    }

    #[test]
    fn test_record_writes_rx_cells_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector.json");
        workbook().save(&path).unwrap();

        let store = Arc::new(JsonVectorStore::open(&path));
        let mut sink = ResultSink::new(store.clone());
        sink.prepare(&[0, 100], &["Door_Lock".to_string()]).unwrap();

        let mut snapshot = DeviceSnapshot::new();
        snapshot.insert("Door_Lock", SnapshotValue::Value("1".to_string()));
        snapshot.insert("Unlisted", SnapshotValue::NotFound);
        assert_eq!(sink.record(0, &snapshot).unwrap(), 1);
        assert_eq!(sink.record(250, &snapshot).unwrap(), 0);

        assert_eq!(results(&store).cell(4, 3), &CellValue::text("1"));
        assert!(Workbook::load(&path).unwrap().sheet(RESULTS_SHEET).is_none());

        sink.save().unwrap();
        let saved = Workbook::load(&path).unwrap();
        assert_eq!(
            saved.sheet(RESULTS_SHEET).unwrap().cell(4, 3),
            &CellValue::text("1")
        );
    }

    #[test]
    fn test_record_before_prepare_is_noop() {
        let store = Arc::new(JsonVectorStore::in_memory(workbook()));
        let sink = ResultSink::new(store);
        assert_eq!(sink.record(0, &DeviceSnapshot::new()).unwrap(), 0);
    }
}
