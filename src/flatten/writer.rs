use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

use super::Flattener;
use crate::types::Row;

/// Paths behind an output table's header line
pub(super) struct Layout {
    columns: Vec<String>,
    known: HashSet<String>,
}

impl Layout {
    pub(super) fn new(headers: &[(String, String)]) -> Self {
        let columns: Vec<String> = headers.iter().map(|(path, _)| path.clone()).collect();
        let known = columns.iter().cloned().collect();
        Layout { columns, known }
    }

    /// Cells of `row` in header order. Fields outside the header are
    /// reported one by one and left out; the returned count says how many.
    pub(super) fn cells<'r>(&self, output: &str, row: &'r Row) -> (Vec<Option<&'r Value>>, usize) {
        let mut unknown = 0;
        for field in row.keys().filter(|key| !self.known.contains(*key)) {
            warn!(table = %output, field = %field, "field outside the table headers, value dropped");
            unknown += 1;
        }
        let cells = self.columns.iter().map(|path| row.get(path)).collect();
        (cells, unknown)
    }
}

/// One output table: its CSV writer and the paths behind its header
struct Sink<W: Write> {
    writer: csv::Writer<W>,
    layout: Layout,
}

/// Writes flattened rows as CSV, one sink per output table.
///
/// Problems with a single table, row or field are logged and counted as
/// warnings; they never stop the other tables from being written.
pub struct CsvWriter<W: Write> {
    sinks: IndexMap<String, Sink<W>>,
    warnings: usize,
    rows: usize,
}

impl<W: Write> Default for CsvWriter<W> {
    fn default() -> Self {
        CsvWriter {
            sinks: IndexMap::new(),
            warnings: 0,
            rows: 0,
        }
    }
}

impl CsvWriter<File> {
    /// Opens `<output>.csv` in `dir` for every output table of `flattener`.
    pub fn create_in<P: AsRef<Path>>(dir: P, flattener: &Flattener) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

        let mut writer = CsvWriter::new();
        for output in flattener.outputs() {
            let headers = flattener.headers(output).unwrap_or_default();
            let path = dir.join(format!("{}.csv", output));
            match File::create(&path) {
                Ok(file) => {
                    if let Err(err) = writer.add_table(output, &headers, file) {
                        warn!(table = output, error = %err, "failed to write headers, table skipped");
                        writer.warnings += 1;
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to open output file, table skipped");
                    writer.warnings += 1;
                }
            }
        }
        Ok(writer)
    }
}

impl<W: Write> CsvWriter<W> {
    pub fn new() -> Self {
        CsvWriter::default()
    }

    /// Registers a sink and writes its header line.
    pub fn add_table(&mut self, output: &str, headers: &[(String, String)], sink: W) -> Result<()> {
        let mut writer = csv::Writer::from_writer(sink);
        writer
            .write_record(headers.iter().map(|(_, header)| header))
            .with_context(|| format!("Failed to write headers of {}", output))?;
        self.sinks.insert(
            output.to_string(),
            Sink {
                writer,
                layout: Layout::new(headers),
            },
        );
        Ok(())
    }

    /// Writes one record's rows. Rows for unknown tables and failed writes
    /// are skipped; fields outside the header are dropped with a warning.
    pub fn write(&mut self, batch: &IndexMap<String, Vec<Row>>) {
        for (output, rows) in batch {
            let Some(sink) = self.sinks.get_mut(output) else {
                debug!(table = %output, rows = rows.len(), "no open sink for table");
                continue;
            };
            for row in rows {
                let (cells, unknown) = sink.layout.cells(output, row);
                self.warnings += unknown;
                let record = cells.into_iter().map(|cell| cell.map(render).unwrap_or_default());
                match sink.writer.write_record(record) {
                    Ok(()) => self.rows += 1,
                    Err(err) => {
                        warn!(table = %output, error = %err, "failed to write row");
                        self.warnings += 1;
                    }
                }
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        for (output, sink) in self.sinks.iter_mut() {
            sink.writer
                .flush()
                .with_context(|| format!("Failed to flush {}", output))?;
        }
        Ok(())
    }

    /// Warnings raised so far.
    pub fn warnings(&self) -> usize {
        self.warnings
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flushes and hands back the underlying sinks.
    pub fn into_sinks(self) -> Result<IndexMap<String, W>> {
        self.sinks
            .into_iter()
            .map(|(output, sink)| {
                let inner = sink
                    .writer
                    .into_inner()
                    .map_err(|err| anyhow!("Failed to flush {}: {}", output, err.error()))?;
                Ok((output, inner))
            })
            .collect()
    }
}

/// Plain text of a cell.
pub(super) fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
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
    fn test_writes_rows_in_header_order() {
        let mut writer = CsvWriter::new();
        writer
            .add_table("tenders", &headers(&["rowID", "/tender/id", "/tender/value/amount"]), Vec::new())
            .unwrap();

        let mut batch = IndexMap::new();
        batch.insert(
            "tenders".to_string(),
            vec![row(json!({"/tender/value/amount": 100, "rowID": "ocds-1/r1/tender:t1", "/tender/id": "t1"}))],
        );
        writer.write(&batch);
        assert_eq!(writer.rows(), 1);
        assert_eq!(writer.warnings(), 0);

        let sinks = writer.into_sinks().unwrap();
        let text = String::from_utf8(sinks["tenders"].clone()).unwrap();
        assert_eq!(text, "rowID,/tender/id,/tender/value/amount\nocds-1/r1/tender:t1,t1,100\n");
    }

    #[test]
    fn test_unknown_field_is_dropped_from_row() {
        let mut writer = CsvWriter::new();
        writer.add_table("parties", &headers(&["rowID", "/parties/id"]), Vec::new()).unwrap();

        let mut batch = IndexMap::new();
        batch.insert(
            "parties".to_string(),
            vec![
                row(json!({"rowID": "a", "/parties/id": "p1", "/parties/extra": "x"})),
                row(json!({"rowID": "b", "/parties/id": "p2"})),
            ],
        );
        writer.write(&batch);
        assert_eq!(writer.rows(), 2);
        assert_eq!(writer.warnings(), 1);

        let sinks = writer.into_sinks().unwrap();
        let text = String::from_utf8(sinks["parties"].clone()).unwrap();
        assert_eq!(text, "rowID,/parties/id\na,p1\nb,p2\n");
    }

    #[test]
    fn test_missing_values_are_empty() {
        let mut writer = CsvWriter::new();
        let mut display = headers(&["rowID", "/tender/title"]);
        display[1].1 = "Tender Title".to_string();
        writer.add_table("tenders", &display, Vec::new()).unwrap();

        let mut batch = IndexMap::new();
        batch.insert("tenders".to_string(), vec![row(json!({"rowID": "a", "/tender/title": null}))]);
        batch.insert("awards".to_string(), vec![row(json!({"rowID": "b"}))]);
        writer.write(&batch);
        assert_eq!(writer.rows(), 1);

        let sinks = writer.into_sinks().unwrap();
        assert_eq!(String::from_utf8(sinks["tenders"].clone()).unwrap(), "rowID,Tender Title\na,\n");
    }

    fn analysed() -> crate::table::TableRegistry {
        use crate::analyze::fixtures::{analysis_config, releases, schema};
        use crate::analyze::Preprocessor;

        let mut preprocessor = Preprocessor::new(&schema(), &analysis_config()).unwrap();
        preprocessor.process_items(&releases()).unwrap();
        preprocessor.into_tables()
    }

    #[test]
    fn test_empty_titles_keep_their_rows() {
        use crate::analyze::fixtures::{analysis_config, schema};
        use crate::analyze::Preprocessor;
        use crate::flatten::{FlattenOptions, TableOptions};

        let records = vec![
            json!({"ocid": "ocds-7", "id": "r7", "tender": {"id": "t7", "title": ""}}),
            json!({"ocid": "ocds-8", "id": "r8", "tender": {"id": "t8", "title": ""}}),
        ];
        let mut preprocessor = Preprocessor::new(&schema(), &analysis_config()).unwrap();
        preprocessor.process_items(&records).unwrap();
        let registry = preprocessor.into_tables();
        let flattener = Flattener::new(FlattenOptions::new([("tenders", TableOptions::default())]), &registry).unwrap();

        let mut writer = CsvWriter::new();
        writer
            .add_table("tenders", &flattener.headers("tenders").unwrap(), Vec::new())
            .unwrap();
        for (_, batch) in flattener.flatten(&records) {
            writer.write(&batch);
        }
        assert_eq!(writer.rows(), 2);
        assert_eq!(writer.warnings(), 0);
    }

    #[test]
    fn test_fields_missing_from_analysis_are_reported() {
        use crate::flatten::{FlattenOptions, TableOptions};

        let registry = analysed();
        let options = FlattenOptions::new([("tenders", TableOptions::default())]).with_count(true);
        let flattener = Flattener::new(options, &registry).unwrap();
        let headers = flattener.headers("tenders").unwrap();
        let mut writer = CsvWriter::new();
        writer.add_table("tenders", &headers, Vec::new()).unwrap();

        let records = vec![
            json!({"ocid": "ocds-4", "id": "r4", "tender": {"id": "t4", "extra": "surprise", "items": []}}),
            json!({"ocid": "ocds-5", "id": "r5", "tender": {"id": "t5"}}),
        ];
        for (_, batch) in flattener.flatten(&records) {
            writer.write(&batch);
        }
        assert_eq!(writer.rows(), 2);
        assert_eq!(writer.warnings(), 1);

        let sinks = writer.into_sinks().unwrap();
        let text = String::from_utf8(sinks["tenders"].clone()).unwrap();
        assert!(!text.contains("surprise"));
        let count = headers.iter().position(|(path, _)| path == "/tender/itemsCount").unwrap();
        let first: Vec<&str> = text.lines().nth(1).unwrap().split(',').collect();
        assert_eq!(first[count], "0");
    }

    #[test]
    fn test_create_in_writes_flattened_tables() {
        use crate::analyze::fixtures::releases;
        use crate::flatten::{FlattenOptions, TableOptions};

        let records = releases();
        let registry = analysed();
        let options = FlattenOptions::new([("tenders", TableOptions::split())]);
        let flattener = Flattener::new(options, &registry).unwrap();

        let dir = std::env::temp_dir().join(format!("flatsheet-writer-{}", std::process::id()));
        let mut writer = CsvWriter::create_in(&dir, &flattener).unwrap();
        for (_, batch) in flattener.flatten(&records) {
            writer.write(&batch);
        }
        writer.flush().unwrap();
        assert_eq!(writer.warnings(), 0);
        assert_eq!(writer.rows(), 2 + 3);

        let tenders = std::fs::read_to_string(dir.join("tenders.csv")).unwrap();
        assert!(tenders.starts_with("rowID,id,ocid,/tender/id"));
        assert!(dir.join("tenders_items.csv").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
