use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

use super::writer::{render, Layout};
use super::Flattener;
use crate::types::Row;

/// Rows per worksheet, header included
const MAX_ROWS: u32 = 1_048_576;
const MAX_COLUMNS: usize = 16_384;
const MAX_SHEET_NAME: usize = 31;

/// One worksheet and the next row to fill
struct Sheet {
    layout: Layout,
    next_row: u32,
}

/// Writes flattened rows into one workbook, a worksheet per output table.
///
/// Failures are handled like [`CsvWriter`](super::CsvWriter): logged,
/// counted as warnings and skipped.
pub struct XlsxWriter {
    workbook: Workbook,
    sheets: IndexMap<String, Sheet>,
    warnings: usize,
    rows: usize,
}

impl Default for XlsxWriter {
    fn default() -> Self {
        XlsxWriter {
            workbook: Workbook::new(),
            sheets: IndexMap::new(),
            warnings: 0,
            rows: 0,
        }
    }
}

impl XlsxWriter {
    pub fn new() -> Self {
        XlsxWriter::default()
    }

    /// Adds a worksheet for every output table of `flattener`.
    pub fn for_flattener(flattener: &Flattener) -> Self {
        let mut writer = XlsxWriter::new();
        for output in flattener.outputs() {
            let headers = flattener.headers(output).unwrap_or_default();
            if let Err(err) = writer.add_table(output, &headers) {
                warn!(table = output, error = %err, "failed to add worksheet, table skipped");
                writer.warnings += 1;
            }
        }
        writer
    }

    /// Adds a worksheet named `output` and writes its header row.
    pub fn add_table(&mut self, output: &str, headers: &[(String, String)]) -> Result<()> {
        if output.is_empty()
            || output.chars().count() > MAX_SHEET_NAME
            || output.contains(['[', ']', ':', '*', '?', '/', '\\'])
        {
            bail!("{} is not a valid worksheet name", output);
        }
        if headers.len() > MAX_COLUMNS {
            bail!("{} has {} columns, a worksheet holds {}", output, headers.len(), MAX_COLUMNS);
        }

        let worksheet = self.workbook.add_worksheet();
        worksheet
            .set_name(output)
            .with_context(|| format!("Failed to name worksheet {}", output))?;
        for (col, (_, header)) in headers.iter().enumerate() {
            worksheet
                .write_string(0, col as u16, header.as_str())
                .with_context(|| format!("Failed to write headers of {}", output))?;
        }
        self.sheets.insert(
            output.to_string(),
            Sheet {
                layout: Layout::new(headers),
                next_row: 1,
            },
        );
        Ok(())
    }

    /// Writes one record's rows, see [`CsvWriter::write`](super::CsvWriter::write).
    pub fn write(&mut self, batch: &IndexMap<String, Vec<Row>>) {
        for (output, rows) in batch {
            let Some(sheet) = self.sheets.get_mut(output) else {
                debug!(table = %output, rows = rows.len(), "no worksheet for table");
                continue;
            };
            let worksheet = match self.workbook.worksheet_from_name(output) {
                Ok(worksheet) => worksheet,
                Err(err) => {
                    warn!(table = %output, error = %err, "worksheet lookup failed");
                    self.warnings += rows.len();
                    continue;
                }
            };
            for row in rows {
                if sheet.next_row >= MAX_ROWS {
                    warn!(table = %output, "worksheet is full, row skipped");
                    self.warnings += 1;
                    continue;
                }
                let (cells, unknown) = sheet.layout.cells(output, row);
                self.warnings += unknown;
                let mut failed = false;
                for (col, value) in cells.into_iter().enumerate() {
                    let Some(value) = value else {
                        continue;
                    };
                    if let Err(err) = write_cell(worksheet, sheet.next_row, col as u16, value) {
                        warn!(table = %output, column = col, error = %err, "failed to write cell");
                        self.warnings += 1;
                        failed = true;
                    }
                }
                sheet.next_row += 1;
                if !failed {
                    self.rows += 1;
                }
            }
        }
    }

    /// Saves the workbook to `path`.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.workbook
            .save(path)
            .with_context(|| format!("Failed to save workbook: {}", path.display()))
    }

    /// Serialised workbook.
    pub fn to_buffer(&mut self) -> Result<Vec<u8>> {
        self.workbook.save_to_buffer().context("Failed to serialise workbook")
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// Numbers and booleans keep their type, everything else is text.
fn write_cell(worksheet: &mut Worksheet, row: u32, col: u16, value: &Value) -> std::result::Result<(), XlsxError> {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(number) => worksheet.write_number(row, col, number),
            None => worksheet.write_string(row, col, n.to_string()),
        },
        Value::Bool(b) => worksheet.write_boolean(row, col, *b),
        other => worksheet.write_string(row, col, render(other)),
    }
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(paths: &[&str]) -> Vec<(String, String)> {
        paths.iter().map(|path| (path.to_string(), path.to_string())).collect()
    }

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_writes_workbook() {
        let mut writer = XlsxWriter::new();
        writer
            .add_table("tenders", &headers(&["rowID", "/tender/id", "/tender/value/amount"]))
            .unwrap();
        let mut batch = IndexMap::new();
        batch.insert(
            "tenders".to_string(),
            vec![
                row(json!({"rowID": "a", "/tender/id": "t1", "/tender/value/amount": 100})),
                row(json!({"rowID": "b", "/tender/id": "t2", "/tender/extra": true})),
            ],
        );
        batch.insert("awards".to_string(), vec![row(json!({"rowID": "c"}))]);
        writer.write(&batch);
        assert_eq!(writer.rows(), 2);
        assert_eq!(writer.warnings(), 1);

        let bytes = writer.to_buffer().unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn test_rejects_invalid_sheet_names() {
        let mut writer = XlsxWriter::new();
        assert!(writer.add_table("tenders/items", &headers(&["rowID"])).is_err());
        assert!(writer
            .add_table("a_table_name_longer_than_the_limit", &headers(&["rowID"]))
            .is_err());
        assert!(writer.add_table("tenders_items", &headers(&["rowID"])).is_ok());
    }

    #[test]
    fn test_for_flattener_writes_every_output() {
        use crate::analyze::fixtures::{analysis_config, releases, schema};
        use crate::analyze::Preprocessor;
        use crate::flatten::{FlattenOptions, TableOptions};

        let records = releases();
        let mut preprocessor = Preprocessor::new(&schema(), &analysis_config()).unwrap();
        preprocessor.process_items(&records).unwrap();
        let registry = preprocessor.into_tables();
        let options = FlattenOptions::new([("tenders", TableOptions::split()), ("parties", TableOptions::default())]);
        let flattener = Flattener::new(options, &registry).unwrap();

        let mut writer = XlsxWriter::for_flattener(&flattener);
        for (_, batch) in flattener.flatten(&records) {
            writer.write(&batch);
        }
        assert_eq!(writer.warnings(), 0);
        assert_eq!(writer.rows(), 2 + 4 + 3);
        assert!(!writer.to_buffer().unwrap().is_empty());
    }
}
