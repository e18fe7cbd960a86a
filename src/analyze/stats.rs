//! Analysis pass: builds the table registry from the schema, then counts
//! what one pass over the data actually contains.

use serde_json::{json, Map, Value};
use std::borrow::Borrow;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::schema::SchemaWalker;
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::path::{generate_row_id, item_id, join, recalculate_headers, SEPARATOR};
use crate::table::{Table, TableId, TableRegistry};
use crate::types::{cell, text, Column, ColumnType, Row, DEFAULT_FIELDS, ID, OCID, PARENT_ID, ROW_ID};

/// A table receiving data at some location, with the path it started from
#[derive(Debug, Clone)]
struct Scope {
    table: TableId,
    base: String,
    abs_base: String,
    row_id: String,
    /// Index of the row in the table's previews, if it is kept
    preview: Option<usize>,
}

impl Scope {
    fn key(&self, abs: &str) -> String {
        format!("{}{}", self.base, &abs[self.abs_base.len()..])
    }
}

/// Scopes of one row, innermost table first and its ancestors after it
type Frame = Vec<Scope>;

/// Identifiers of the record being analysed
#[derive(Debug, Default)]
struct Record {
    ocid: String,
    id: Value,
    top_id: String,
}

/// Builds and populates the table registry
pub struct Preprocessor {
    registry: TableRegistry,
    entries: HashMap<String, Vec<TableId>>,
    children: HashMap<(TableId, String), TableId>,
    preview_limit: usize,
    record: Record,
}

impl Preprocessor {
    /// Seeds the configured tables and derives their columns from `schema`.
    pub fn new(schema: &Value, config: &AnalysisConfig) -> Result<Self> {
        let mut registry = TableRegistry::new();
        let mut roots = Vec::new();
        for (name, paths) in config.root_tables.iter() {
            roots.push(registry.insert(Table::root(name.clone(), paths.clone(), false))?);
        }
        for (name, paths) in config.combined_tables.iter() {
            roots.push(registry.insert(Table::root(name.clone(), paths.clone(), true))?);
        }

        let walker = SchemaWalker::new(schema, config.max_depth);
        let mut entries: HashMap<String, Vec<TableId>> = HashMap::new();
        for root in roots {
            for path in registry.get(root).path.clone() {
                walker.build(&mut registry, root, &path)?;
                entries.entry(path).or_default().push(root);
            }
        }

        let mut children = HashMap::new();
        for (id, table) in registry.iter() {
            if let Some(parent) = table.parent {
                for path in &table.path {
                    children.insert((parent, path.clone()), id);
                }
            }
        }
        debug!(tables = registry.len(), "table registry built from schema");

        Ok(Preprocessor {
            registry,
            entries,
            children,
            preview_limit: config.preview_rows,
            record: Record::default(),
        })
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.registry
    }

    pub fn into_tables(self) -> TableRegistry {
        self.registry
    }

    /// Analyses every record, returning how many were processed.
    pub fn process_items<I>(&mut self, records: I) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: Borrow<Value>,
    {
        let mut count = 0;
        for record in records {
            self.process_item(record.borrow())?;
            count += 1;
        }
        Ok(count)
    }

    /// Analyses one record.
    pub fn process_item(&mut self, record: &Value) -> Result<()> {
        match record {
            Value::Object(fields) => {
                let id = record.get(ID).cloned().unwrap_or(Value::Null);
                self.record = Record {
                    ocid: record.get(OCID).and_then(text).unwrap_or_default(),
                    top_id: text(&id).unwrap_or_default(),
                    id,
                };
                self.visit_object(fields, "", "", &[])
            }
            _ => {
                warn!("skipping record that is not a JSON object");
                Ok(())
            }
        }
    }

    fn visit_object(&mut self, fields: &Map<String, Value>, abs: &str, path: &str, frames: &[Frame]) -> Result<()> {
        for (key, value) in fields.iter() {
            let pointer = join(path, key);
            let abs_pointer = join(abs, key);
            match value {
                Value::Null => {}
                Value::String(s) if s.is_empty() => {}
                Value::Array(items) if items.is_empty() => {}
                Value::Object(_) => self.visit_nested(value, &abs_pointer, &pointer, frames)?,
                Value::Array(items) if items.iter().any(Value::is_object) => {
                    self.visit_nested(value, &abs_pointer, &pointer, frames)?
                }
                _ => {
                    for frame in frames {
                        self.count_value(frame, &abs_pointer, key, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn visit_nested(&mut self, value: &Value, abs: &str, path: &str, frames: &[Frame]) -> Result<()> {
        let mut receiving: Vec<Frame> = Vec::new();
        let mut claimed: Vec<(TableId, &Frame)> = Vec::new();
        for frame in frames {
            match self.children.get(&(frame[0].table, path.to_string())) {
                Some(child) => claimed.push((*child, frame)),
                None => receiving.push(frame.clone()),
            }
        }
        let entries = self.entries.get(path).cloned().unwrap_or_default();

        match value {
            Value::Object(fields) => {
                let mut next = receiving;
                for (child, parent) in &claimed {
                    next.push(self.start_row(*child, Some(*parent), value, abs, path)?);
                }
                for entry in &entries {
                    next.push(self.start_row(*entry, None, value, abs, path)?);
                }
                self.visit_object(fields, abs, path, &next)
            }
            Value::Array(items) => {
                for (child, parent) in &claimed {
                    self.grow_array(*child, parent, abs, path, items.len());
                }
                for (i, item) in items.iter().enumerate() {
                    let Value::Object(fields) = item else {
                        continue;
                    };
                    let item_abs = join(abs, &i.to_string());
                    let mut next = receiving.clone();
                    for (child, parent) in &claimed {
                        next.push(self.start_row(*child, Some(*parent), item, &item_abs, path)?);
                    }
                    for entry in &entries {
                        next.push(self.start_row(*entry, None, item, &item_abs, path)?);
                    }
                    self.visit_object(fields, &item_abs, path, &next)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Registers the array length on the root and widens the combined
    /// columns of every table above the array.
    fn grow_array(&mut self, child: TableId, parent: &Frame, abs: &str, path: &str, len: usize) {
        if self.registry.set_array(child, path, len) {
            debug!(array = path, len, "array grew");
        }
        for scope in parent {
            let keyed = scope.key(abs);
            let Some((array_parent, key)) = keyed.rsplit_once('/') else {
                continue;
            };
            let table = self.registry.get_mut(scope.table);
            if recalculate_headers(table, array_parent, key, len) {
                debug!(table = %table.name, array = %keyed, len, "combined columns widened");
            }
        }
    }

    fn start_row(
        &mut self,
        table: TableId,
        parent: Option<&Frame>,
        object: &Value,
        abs: &str,
        path: &str,
    ) -> Result<Frame> {
        let key = path.rsplit(SEPARATOR).next().unwrap_or_default();
        let row_id = generate_row_id(&self.record.ocid, &item_id(object, abs), key, &self.record.top_id);

        let target = self.registry.get_mut(table);
        target.inc();
        for field in DEFAULT_FIELDS {
            if field == PARENT_ID && parent.is_none() {
                continue;
            }
            if target.contains(field) {
                target.inc_column(field, false)?;
            }
        }

        let preview = if target.preview_rows.len() < self.preview_limit {
            let mut row = Row::new();
            row.insert(ROW_ID.to_string(), Value::String(row_id.clone()));
            row.insert(ID.to_string(), self.record.id.clone());
            if let Some(parent) = parent {
                row.insert(PARENT_ID.to_string(), Value::String(parent[0].row_id.clone()));
            }
            row.insert(OCID.to_string(), Value::String(self.record.ocid.clone()));
            target.preview_rows.push(row.clone());
            target.preview_rows_combined.push(row);
            Some(target.preview_rows.len() - 1)
        } else {
            None
        };

        let mut frame = vec![Scope {
            table,
            base: path.to_string(),
            abs_base: abs.to_string(),
            row_id,
            preview,
        }];
        if let Some(parent) = parent {
            frame.extend(parent.iter().cloned());
        }
        Ok(frame)
    }

    fn count_value(&mut self, frame: &Frame, abs: &str, key: &str, value: &Value) -> Result<()> {
        let Some(column_type) = ColumnType::from_value(value) else {
            return Ok(());
        };
        let scope = &frame[0];
        let path = scope.key(abs);

        if !self.registry.get(scope.table).contains(&path) {
            debug!(table = %self.registry.get(scope.table).name, path = %path, "column not in schema");
            self.registry
                .add_column(scope.table, &path, &json!({ "title": key }), column_type, &Value::Null, false, true);
        }
        let title = self.registry.get(scope.table).titles.get(&path).cloned().unwrap_or_default();
        let shown = cell(value);
        let table = self.registry.get_mut(scope.table);
        table.observe_type(&path, column_type);
        table.inc_column(&path, false)?;
        if let (Some(row), Some(shown)) = (scope.preview, &shown) {
            table.preview_rows[row].insert(path.clone(), shown.clone());
            table.preview_rows_combined[row].insert(path.clone(), shown.clone());
        }

        for ancestor in &frame[1..] {
            let combined = ancestor.key(abs);
            let table = self.registry.get_mut(ancestor.table);
            if !table.combined_columns.contains_key(&combined) {
                table
                    .combined_columns
                    .insert(combined.clone(), Column::new(combined.clone(), title.clone(), column_type));
                table.titles.insert(combined.clone(), title.clone());
            }
            table.inc_column(&combined, true)?;
            if let (Some(row), Some(shown)) = (ancestor.preview, &shown) {
                table.preview_rows_combined[row].insert(combined, shown.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::fixtures::{analysis_config, releases, schema};

    fn analyzed() -> Preprocessor {
        let mut preprocessor = Preprocessor::new(&schema(), &analysis_config()).unwrap();
        preprocessor.process_items(&releases()).unwrap();
        preprocessor
    }

    #[test]
    fn test_schema_tables() {
        let preprocessor = Preprocessor::new(&schema(), &analysis_config()).unwrap();
        let registry = preprocessor.tables();
        let names: Vec<&str> = registry.iter().map(|(_, t)| t.name.as_str()).collect();
        assert_eq!(names, vec!["tenders", "parties", "tenders_items", "tenders_items_addit"]);

        let tenders = registry.table("tenders").unwrap();
        assert!(tenders.contains("/tender/id"));
        assert!(tenders.contains("/tender/value/amount"));
        assert!(!tenders.contains("/tender/items/id"));
        assert!(tenders.combined_columns.contains_key("/tender/items/0/id"));
        assert!(tenders
            .combined_columns
            .contains_key("/tender/items/0/additionalClassifications/0/scheme"));
        assert_eq!(tenders.arrays.keys().collect::<Vec<_>>(), vec![
            "/tender/items",
            "/tender/items/additionalClassifications"
        ]);

        let items = registry.table("tenders_items").unwrap();
        assert!(items
            .combined_columns
            .contains_key("/tender/items/additionalClassifications/0/scheme"));
        assert_eq!(registry.table("parties").unwrap().columns["/parties/roles"].column_type, ColumnType::Array);
    }

    #[test]
    fn test_hits_and_rows() {
        let preprocessor = analyzed();
        let registry = preprocessor.tables();

        let tenders = registry.table("tenders").unwrap();
        assert_eq!(tenders.total_rows, 2);
        assert_eq!(tenders.columns["/tender/id"].hits, 2);
        assert_eq!(tenders.columns["rowID"].hits, 2);
        assert_eq!(tenders.combined_columns["/tender/items/1/id"].hits, 1);

        let items = registry.table("tenders_items").unwrap();
        assert_eq!(items.total_rows, 3);
        assert_eq!(items.columns["parentID"].hits, 3);
        assert_eq!(items.columns["/tender/items/id"].hits, 3);

        let parties = registry.table("parties").unwrap();
        assert_eq!(parties.total_rows, 4);
        assert_eq!(parties.columns["/parties/roles"].hits, 3);
        assert!(parties.missing_rows(true).contains(&"/parties/address/locality"));
    }

    #[test]
    fn test_arrays_track_maximum() {
        let preprocessor = analyzed();
        let tenders = preprocessor.tables().table("tenders").unwrap();
        assert_eq!(tenders.arrays["/tender/items"], 2);
        assert_eq!(tenders.arrays["/tender/items/additionalClassifications"], 2);
    }

    #[test]
    fn test_arrays_maximum_is_order_independent() {
        let mut records = releases();
        records.reverse();
        let mut preprocessor = Preprocessor::new(&schema(), &analysis_config()).unwrap();
        preprocessor.process_items(records).unwrap();
        let tenders = preprocessor.tables().table("tenders").unwrap();
        assert_eq!(tenders.arrays["/tender/items"], 2);
        assert_eq!(tenders.arrays["/tender/items/additionalClassifications"], 2);
    }

    #[test]
    fn test_combined_columns_widen_in_place() {
        let preprocessor = analyzed();
        let tenders = preprocessor.tables().table("tenders").unwrap();
        let keys: Vec<&str> = tenders.combined_columns.keys().map(String::as_str).collect();
        let zero = keys.iter().position(|k| *k == "/tender/items/0/id").unwrap();
        assert_eq!(keys[zero + 1], "/tender/items/1/id");
        assert!(tenders
            .combined_columns
            .contains_key("/tender/items/0/additionalClassifications/1/id"));
        assert_eq!(
            tenders.combined_columns["/tender/items/0/additionalClassifications/1/id"].hits,
            1
        );
        let items = preprocessor.tables().table("tenders_items").unwrap();
        assert_eq!(
            items.combined_columns["/tender/items/additionalClassifications/1/id"].hits,
            1
        );
    }

    #[test]
    fn test_additional_columns() {
        let mut preprocessor = Preprocessor::new(&schema(), &analysis_config()).unwrap();
        let record = serde_json::json!({
            "ocid": "ocds-9",
            "id": "r9",
            "tender": {"id": "t9", "extra": "surprise", "items": [{"id": "i9", "note": "x"}, {"id": "i10", "note": "y"}]}
        });
        preprocessor.process_item(&record).unwrap();
        let registry = preprocessor.tables();

        let tenders = registry.table("tenders").unwrap();
        assert_eq!(tenders.additional_columns["/tender/extra"].hits, 1);
        assert_eq!(tenders.types["/tender/extra"], vec![ColumnType::String]);

        let items = registry.table("tenders_items").unwrap();
        assert_eq!(items.additional_columns["/tender/items/note"].hits, 2);
        assert_eq!(tenders.combined_columns["/tender/items/1/note"].hits, 1);
    }

    #[test]
    fn test_preview_rows() {
        let preprocessor = analyzed();
        let registry = preprocessor.tables();

        let tenders = registry.table("tenders").unwrap();
        assert_eq!(tenders.preview_rows.len(), 2);
        let first = &tenders.preview_rows[0];
        assert_eq!(first["rowID"], "ocds-1/r1/tender:t1");
        assert_eq!(first["id"], "r1");
        assert_eq!(first["/tender/submissionMethod"], "electronic;written");
        assert!(first.keys().all(|key| !key.starts_with("/tender/items")));

        let combined = &tenders.preview_rows_combined[0];
        assert_eq!(combined["/tender/title"], "Pens");
        assert_eq!(combined["/tender/items/1/id"], "i2");
        assert_eq!(combined["/tender/items/0/additionalClassifications/1/id"], "c2");

        let items = registry.table("tenders_items").unwrap();
        assert_eq!(items.preview_rows.len(), 3);
        assert_eq!(items.preview_rows[0]["parentID"], "ocds-1/r1/tender:t1");
        assert_eq!(
            items.preview_rows_combined[0]["/tender/items/additionalClassifications/0/id"],
            "c1"
        );
    }

    #[test]
    fn test_preview_rows_are_bounded() {
        let config = AnalysisConfig {
            preview_rows: 1,
            ..analysis_config()
        };
        let mut preprocessor = Preprocessor::new(&schema(), &config).unwrap();
        preprocessor.process_items(&releases()).unwrap();
        let parties = preprocessor.tables().table("parties").unwrap();
        assert_eq!(parties.total_rows, 4);
        assert_eq!(parties.preview_rows.len(), 1);
        assert_eq!(parties.preview_rows[0]["/parties/id"], "p1");
    }

    #[test]
    fn test_non_object_record_is_skipped() {
        let mut preprocessor = Preprocessor::new(&schema(), &analysis_config()).unwrap();
        preprocessor.process_item(&serde_json::json!([1, 2])).unwrap();
        assert_eq!(preprocessor.tables().table("tenders").unwrap().total_rows, 0);
    }
}
