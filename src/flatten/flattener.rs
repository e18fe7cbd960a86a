//! Flattening engine
//!
//! A [`Flattener`] is an owned, read-only view over an analysed
//! [`TableRegistry`] prepared for one set of [`FlattenOptions`]. Calling
//! [`Flattener::flatten`] opens a fresh lazy pass over a record source; the
//! view is never mutated, so passes can be repeated or interleaved.
//!
//! Leaf values go to the most specific table matching their location: once
//! an entry table starts rows at a path, tables above it no longer receive
//! that subtree.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

use super::options::{FlattenOptions, OutputNames, TableOptions};
use crate::error::{Error, Result};
use crate::path::{generate_row_id, get_matching_tables, is_prefix, item_id, join, schema_path, SEPARATOR};
use crate::table::{Table, TableId, TableRegistry};
use crate::types::{cell, is_synthetic, text, Column, ColumnType, Row, ID, OCID, PARENT_ID, ROW_ID};

/// What a split table does with the subtree of one of its child tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Active(usize),
    Dropped,
}

/// A table taking part in the run, with its columns prepared for the options
#[derive(Debug, Clone)]
struct ActiveTable {
    id: TableId,
    table: Table,
    options: TableOptions,
    output: String,
    /// Starts rows wherever one of its paths matches
    entry: bool,
    parent: Option<usize>,
    children: HashMap<String, Route>,
    /// Child arrays below the split threshold, kept in this table's rows
    inline: Vec<String>,
    /// Arrays whose length is written to a `<array>Count` column
    counters: Vec<String>,
}

impl ActiveTable {
    fn new(id: TableId, table: Table, options: TableOptions, entry: bool) -> Self {
        ActiveTable {
            id,
            table,
            options,
            output: String::new(),
            entry,
            parent: None,
            children: HashMap::new(),
            inline: Vec::new(),
            counters: Vec::new(),
        }
    }

    fn prepare(&mut self, root: &Table, count: bool) {
        fold_combined(&mut self.table);
        let table = &mut self.table;
        let options = &self.options;

        for path in &options.unnest {
            let column = table
                .combined_columns
                .get(path)
                .cloned()
                .unwrap_or_else(|| Column::new(path.clone(), path.clone(), ColumnType::String));
            table.columns.entry(path.clone()).or_insert(column);
        }

        for pointer in &self.inline {
            let inlined: Vec<(String, Column)> = table
                .combined_columns
                .iter()
                .filter(|(path, _)| !is_synthetic(path) && is_prefix(pointer, &schema_path(path)))
                .map(|(path, column)| (path.clone(), column.clone()))
                .collect();
            for (path, column) in inlined {
                table.columns.entry(path).or_insert(column);
            }
        }

        if count {
            for array in owned_arrays(table, root) {
                let array = table.canonical(&array);
                if self.counters.contains(&array) {
                    continue;
                }
                let key = format!("{}Count", array);
                let name = array.rsplit(SEPARATOR).next().unwrap_or_default();
                let mut column = Column::new(key.clone(), format!("{}Count", name), ColumnType::Integer);
                // present in every row that holds the array, even an empty one
                column.hits = 1;
                table.titles.entry(key.clone()).or_insert_with(|| column.title.clone());
                table.columns.entry(key.clone()).or_insert_with(|| column.clone());
                table.combined_columns.entry(key).or_insert(column);
                self.counters.push(array);
            }
        }

        if !options.only.is_empty() {
            table.columns.retain(|path, _| is_synthetic(path) || options.keeps(path));
            table.combined_columns.retain(|path, _| is_synthetic(path) || options.keeps(path));
        }
    }

    /// Inserts inherited columns right after the leading identifier columns.
    fn inherit(&mut self, repeated: &[(String, Column)]) {
        for columns in [&mut self.table.columns, &mut self.table.combined_columns] {
            let mut position = columns.keys().take_while(|path| is_synthetic(path)).count();
            for (path, column) in repeated {
                if columns.contains_key(path) {
                    continue;
                }
                columns.shift_insert(position, path.clone(), column.clone());
                position += 1;
            }
        }
        for (path, column) in repeated {
            self.table.titles.entry(path.clone()).or_insert_with(|| column.title.clone());
        }
    }

    /// Drops the columns under paths where a more specific entry table
    /// starts its own rows.
    fn yield_to(&mut self, claimed: &[&String]) {
        for columns in [&mut self.table.columns, &mut self.table.combined_columns] {
            columns.retain(|path, _| is_synthetic(path) || !claimed.iter().any(|entry| is_prefix(entry, &schema_path(path))));
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        let columns = if self.options.split {
            &self.table.columns
        } else {
            &self.table.combined_columns
        };
        columns
            .iter()
            .filter(|(path, column)| is_synthetic(path) || column.is_available())
            .map(|(path, column)| (path.clone(), self.display(path, column)))
            .collect()
    }

    fn display(&self, path: &str, column: &Column) -> String {
        if let Some(header) = self.options.headers.get(path) {
            return header.clone();
        }
        if self.options.pretty_headers {
            let title = self.table.titles.get(path).unwrap_or(&column.title);
            if !title.is_empty() {
                return title.clone();
            }
        }
        path.to_string()
    }
}

fn strictly_below(base: &str, path: &str) -> bool {
    base != path && is_prefix(base, path)
}

/// Registered arrays under one of the table's paths with no other registered
/// array in between.
fn owned_arrays(table: &Table, root: &Table) -> Vec<String> {
    root.arrays
        .keys()
        .filter(|array| {
            table.path.iter().any(|base| {
                strictly_below(base, array)
                    && !root
                        .arrays
                        .keys()
                        .any(|other| strictly_below(base, other) && strictly_below(other, array))
            })
        })
        .cloned()
        .collect()
}

/// Folds the columns of every path of a combined table onto its first path,
/// summing the hits of columns that meet.
fn fold_combined(table: &mut Table) {
    if !table.is_combined || table.path.len() < 2 {
        return;
    }
    let columns = fold_columns(table, &table.columns);
    let combined_columns = fold_columns(table, &table.combined_columns);
    let titles: Vec<(String, String)> = table
        .titles
        .iter()
        .map(|(path, title)| (table.canonical(path), title.clone()))
        .collect();
    table.columns = columns;
    table.combined_columns = combined_columns;
    table.titles = IndexMap::new();
    for (path, title) in titles {
        table.titles.entry(path).or_insert(title);
    }
}

fn fold_columns(table: &Table, columns: &IndexMap<String, Column>) -> IndexMap<String, Column> {
    let mut folded: IndexMap<String, Column> = IndexMap::with_capacity(columns.len());
    for (path, column) in columns {
        let canonical = table.canonical(path);
        match folded.get_mut(&canonical) {
            Some(existing) => existing.hits += column.hits,
            None => {
                let mut column = column.clone();
                column.id = canonical.clone();
                folded.insert(canonical, column);
            }
        }
    }
    folded
}

/// Flattens records into per-table rows
#[derive(Debug, Clone)]
pub struct Flattener {
    tables: Vec<ActiveTable>,
    outputs: HashMap<String, usize>,
    entries: HashMap<String, Vec<usize>>,
}

impl Flattener {
    /// Prepares a run over `registry`.
    ///
    /// Selected tables are activated in selection order, then the children of
    /// every split table. Fails on selected tables missing from the registry
    /// and on tables both selected and excluded.
    pub fn new(options: FlattenOptions, registry: &TableRegistry) -> Result<Self> {
        for name in &options.exclude {
            if registry.id(name).is_none() {
                warn!(table = %name, "excluded table is not in the registry");
            }
        }

        let mut tables: Vec<ActiveTable> = Vec::new();
        let mut active: HashMap<TableId, usize> = HashMap::new();
        for (name, table_options) in options.selection.iter() {
            let id = registry.id(name).ok_or_else(|| Error::UnknownTable(name.clone()))?;
            if options.is_excluded(name) {
                return Err(Error::ConflictingOptions {
                    table: name.clone(),
                    reason: "table is both selected and excluded".to_string(),
                });
            }
            active.insert(id, tables.len());
            tables.push(ActiveTable::new(id, registry.get(id).clone(), table_options.clone(), true));
        }

        let mut next = 0;
        while next < tables.len() {
            if tables[next].options.split {
                for child_name in tables[next].table.child_tables.clone() {
                    let Some(child) = registry.id(&child_name) else {
                        continue;
                    };
                    let Some(pointer) = registry.get(child).path.first().cloned() else {
                        continue;
                    };
                    let longest = registry
                        .get(registry.root_of(child))
                        .arrays
                        .get(&pointer)
                        .copied()
                        .unwrap_or(0);
                    if longest < options.split_threshold {
                        debug!(table = %child_name, longest, "array below split threshold, kept inline");
                        tables[next].inline.push(pointer);
                        continue;
                    }
                    let route = if options.is_excluded(&child_name) {
                        debug!(table = %child_name, "child table excluded, its data is dropped");
                        Route::Dropped
                    } else {
                        let index = match active.get(&child) {
                            Some(&index) => index,
                            None => {
                                let child_options = options.selection.get(&child_name).cloned().unwrap_or_default();
                                active.insert(child, tables.len());
                                tables.push(ActiveTable::new(child, registry.get(child).clone(), child_options, false));
                                tables.len() - 1
                            }
                        };
                        tables[index].entry = false;
                        tables[index].parent = Some(next);
                        Route::Active(index)
                    };
                    tables[next].children.insert(pointer, route);
                }
            }
            next += 1;
        }

        let mut names = OutputNames::default();
        let mut outputs = HashMap::new();
        for (index, table) in tables.iter_mut().enumerate() {
            let wanted = table.options.name.clone().unwrap_or_else(|| table.table.name.clone());
            table.output = names.claim(&wanted);
            outputs.insert(table.output.clone(), index);
        }

        for table in tables.iter_mut() {
            let root = registry.get(registry.root_of(table.id));
            table.prepare(root, options.count);
        }

        for index in 0..tables.len() {
            let repeated = repeated_columns(&tables, index);
            if !repeated.is_empty() {
                tables[index].inherit(&repeated);
            }
        }

        let entry_tables: Vec<(usize, &Table)> = tables
            .iter()
            .enumerate()
            .filter(|(_, table)| table.entry)
            .map(|(index, table)| (index, &table.table))
            .collect();
        let mut entries: HashMap<String, Vec<usize>> = HashMap::new();
        for (_, table) in &entry_tables {
            for path in &table.path {
                if entries.contains_key(path) {
                    continue;
                }
                let starting: Vec<usize> = get_matching_tables(entry_tables.iter().copied(), path)
                    .into_iter()
                    .filter(|index| tables[*index].table.matched_path(path) == Some(path.as_str()))
                    .collect();
                entries.insert(path.clone(), starting);
            }
        }

        let entry_paths: Vec<String> = entries.keys().cloned().collect();
        for table in tables.iter_mut() {
            let claimed: Vec<&String> = entry_paths
                .iter()
                .filter(|entry| table.table.path.iter().any(|base| strictly_below(base, entry)))
                .collect();
            if !claimed.is_empty() {
                debug!(table = %table.table.name, claimed = claimed.len(), "subtrees left to more specific tables");
                table.yield_to(&claimed);
            }
        }

        debug!(
            tables = tables.len(),
            entries = entries.len(),
            "flattener prepared"
        );
        Ok(Flattener {
            tables,
            outputs,
            entries,
        })
    }

    /// Lazily flattens `records`, yielding `(record index, output -> rows)`
    /// for each record. Tables without rows are left out of the mapping.
    pub fn flatten<I>(&self, records: I) -> Flatten<'_, I::IntoIter>
    where
        I: IntoIterator,
        I::Item: Borrow<Value>,
    {
        Flatten {
            flattener: self,
            records: records.into_iter(),
            index: 0,
        }
    }

    /// Flattens a single record.
    pub fn flatten_record(&self, record: &Value) -> IndexMap<String, Vec<Row>> {
        let mut walk = Walk::new(self, record);
        match record {
            Value::Object(fields) => walk.visit_object(fields, "", "", &[]),
            _ => warn!("skipping record that is not a JSON object"),
        }
        walk.finish()
    }

    /// Output names in activation order.
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|table| table.output.as_str())
    }

    /// Ordered `(path, header)` pairs of an output table.
    pub fn headers(&self, output: &str) -> Option<Vec<(String, String)>> {
        self.active(output).map(ActiveTable::headers)
    }

    /// Prepared table behind an output.
    pub fn table(&self, output: &str) -> Option<&Table> {
        self.active(output).map(|active| &active.table)
    }

    pub fn options(&self, output: &str) -> Option<&TableOptions> {
        self.active(output).map(|active| &active.options)
    }

    /// Output name given to a registry table, if it takes part in the run.
    pub fn output_name(&self, table: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|active| active.table.name == table)
            .map(|active| active.output.as_str())
    }

    fn active(&self, output: &str) -> Option<&ActiveTable> {
        self.outputs.get(output).map(|index| &self.tables[*index])
    }

    fn has_entries_below(&self, path: &str) -> bool {
        self.entries.keys().any(|entry| strictly_below(path, entry))
    }
}

/// Columns inherited from the `repeat` options of every ancestor, outermost
/// first, restricted by the table's own `only` whitelist
fn repeated_columns(tables: &[ActiveTable], index: usize) -> Vec<(String, Column)> {
    let mut ancestors = Vec::new();
    let mut current = tables[index].parent;
    while let Some(parent) = current {
        ancestors.push(parent);
        current = tables[parent].parent;
    }

    let options = &tables[index].options;
    let mut repeated = Vec::new();
    for ancestor in ancestors.into_iter().rev() {
        let table = &tables[ancestor].table;
        for path in &tables[ancestor].options.repeat {
            if !options.keeps(path) {
                continue;
            }
            let mut column = table
                .columns
                .get(path)
                .or_else(|| table.combined_columns.get(path))
                .cloned()
                .unwrap_or_else(|| Column::new(path.clone(), path.clone(), ColumnType::String));
            column.hits = column.hits.max(1);
            repeated.push((path.clone(), column));
        }
    }
    repeated
}

/// Lazy pass over a record source, see [`Flattener::flatten`]
pub struct Flatten<'f, I> {
    flattener: &'f Flattener,
    records: I,
    index: usize,
}

impl<'f, I> Iterator for Flatten<'f, I>
where
    I: Iterator,
    I::Item: Borrow<Value>,
{
    type Item = (usize, IndexMap<String, Vec<Row>>);

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        let index = self.index;
        self.index += 1;
        Some((index, self.flattener.flatten_record(record.borrow())))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

/// A row being filled, with the location its keys are relative to
#[derive(Debug, Clone)]
struct Frame<'v> {
    table: usize,
    row: usize,
    base: String,
    abs_base: String,
    row_id: String,
    object: &'v Value,
    repeat: Rc<Vec<(String, Value)>>,
    /// `(table, row)` of the split parents, nearest first
    ancestors: Rc<Vec<(usize, usize)>>,
}

impl<'v> Frame<'v> {
    fn key(&self, abs: &str) -> String {
        format!("{}{}", self.base, &abs[self.abs_base.len()..])
    }

    /// Value under this row's object at the schema path `path`.
    fn resolve(&self, path: &str) -> Option<&'v Value> {
        let relative = path.strip_prefix(self.base.as_str())?;
        if !relative.is_empty() && !relative.starts_with(SEPARATOR) {
            return None;
        }
        self.object.pointer(relative)
    }
}

/// State of one record's walk
struct Walk<'f> {
    flattener: &'f Flattener,
    rows: Vec<Vec<Row>>,
    ocid: String,
    record_id: Value,
    top_id: String,
}

impl<'f> Walk<'f> {
    fn new(flattener: &'f Flattener, record: &Value) -> Self {
        let record_id = record.get(ID).cloned().unwrap_or(Value::Null);
        Walk {
            flattener,
            rows: vec![Vec::new(); flattener.tables.len()],
            ocid: record.get(OCID).and_then(text).unwrap_or_default(),
            top_id: text(&record_id).unwrap_or_default(),
            record_id,
        }
    }

    fn finish(self) -> IndexMap<String, Vec<Row>> {
        self.flattener
            .tables
            .iter()
            .zip(self.rows)
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(table, rows)| (table.output.clone(), rows))
            .collect()
    }

    fn visit_object<'v>(&mut self, fields: &'v Map<String, Value>, abs: &str, path: &str, frames: &[Frame<'v>]) {
        let flattener = self.flattener;
        let mut nested = Vec::new();
        for (key, value) in fields.iter() {
            match value {
                Value::Object(_) => nested.push((key, value)),
                Value::Array(items) if items.iter().any(Value::is_object) => nested.push((key, value)),
                Value::Array(items) if items.is_empty() => {}
                _ => {
                    if frames.is_empty() {
                        continue;
                    }
                    let Some(cell) = cell(value) else {
                        continue;
                    };
                    let abs_pointer = join(abs, key);
                    for frame in frames {
                        let column = frame.key(&abs_pointer);
                        if flattener.tables[frame.table].options.keeps(&column) {
                            self.rows[frame.table][frame.row].insert(column, cell.clone());
                        }
                    }
                }
            }
        }
        for (key, value) in nested {
            self.visit_nested(value, &join(abs, key), &join(path, key), frames);
        }
    }

    fn visit_nested<'v>(&mut self, value: &'v Value, abs: &str, path: &str, frames: &[Frame<'v>]) {
        let flattener = self.flattener;
        let entries: &[usize] = flattener.entries.get(path).map(Vec::as_slice).unwrap_or(&[]);
        let mut receiving = Vec::new();
        let mut claimed = Vec::new();
        for frame in frames {
            match flattener.tables[frame.table].children.get(path) {
                Some(Route::Active(child)) => claimed.push((*child, frame)),
                Some(Route::Dropped) => {}
                // a more specific entry table takes the subtree
                None if !entries.is_empty() => {}
                None => receiving.push(frame.clone()),
            }
        }
        if receiving.is_empty() && claimed.is_empty() && entries.is_empty() && !flattener.has_entries_below(path) {
            return;
        }

        match value {
            Value::Object(fields) => {
                let mut next = receiving;
                for (child, parent) in &claimed {
                    next.push(self.start_row(*child, Some(*parent), value, abs, path));
                }
                for entry in entries {
                    next.push(self.start_row(*entry, None, value, abs, path));
                }
                self.visit_object(fields, abs, path, &next);
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    let Value::Object(fields) = item else {
                        continue;
                    };
                    let item_abs = join(abs, &i.to_string());
                    let mut next = receiving.clone();
                    for (child, parent) in &claimed {
                        next.push(self.start_row(*child, Some(*parent), item, &item_abs, path));
                    }
                    for entry in entries {
                        next.push(self.start_row(*entry, None, item, &item_abs, path));
                    }
                    self.visit_object(fields, &item_abs, path, &next);
                }
            }
            _ => {}
        }
    }

    /// Value of `path` as seen from `frame`: its own row, then the rows of
    /// its split parents, then its object.
    fn lookup(&self, frame: &Frame<'_>, path: &str) -> Option<Value> {
        std::iter::once((frame.table, frame.row))
            .chain(frame.ancestors.iter().copied())
            .find_map(|(table, row)| self.rows[table][row].get(path).cloned())
            .or_else(|| frame.resolve(path).and_then(cell))
    }

    fn start_row<'v>(
        &mut self,
        table: usize,
        parent: Option<&Frame<'v>>,
        object: &'v Value,
        abs: &str,
        path: &str,
    ) -> Frame<'v> {
        let flattener = self.flattener;
        let active = &flattener.tables[table];
        let key = path.rsplit(SEPARATOR).next().unwrap_or_default();
        let row_id = generate_row_id(&self.ocid, &item_id(object, abs), key, &self.top_id);

        let mut row = Row::new();
        row.insert(ROW_ID.to_string(), Value::String(row_id.clone()));
        row.insert(ID.to_string(), self.record_id.clone());
        if let Some(parent) = parent {
            row.insert(PARENT_ID.to_string(), Value::String(parent.row_id.clone()));
        }
        row.insert(OCID.to_string(), Value::String(self.ocid.clone()));

        let (repeat, ancestors) = match parent {
            Some(parent) => {
                let paths = &flattener.tables[parent.table].options.repeat;
                let repeat = if paths.is_empty() {
                    parent.repeat.clone()
                } else {
                    let mut values = (*parent.repeat).clone();
                    for path in paths {
                        if let Some(value) = self.lookup(parent, path) {
                            values.push((path.clone(), value));
                        }
                    }
                    Rc::new(values)
                };
                let mut ancestors = vec![(parent.table, parent.row)];
                ancestors.extend(parent.ancestors.iter().copied());
                (repeat, Rc::new(ancestors))
            }
            None => (Rc::new(Vec::new()), Rc::new(Vec::new())),
        };
        for (path, value) in repeat.iter() {
            if active.options.keeps(path) {
                row.insert(path.clone(), value.clone());
            }
        }

        let frame = Frame {
            table,
            row: self.rows[table].len(),
            base: active.table.canonical(path),
            abs_base: abs.to_string(),
            row_id,
            object,
            repeat,
            ancestors,
        };

        for path in &active.options.unnest {
            if !active.options.keeps(path) {
                continue;
            }
            if let Some(value) = frame.resolve(path).and_then(cell) {
                row.insert(path.clone(), value);
            }
        }
        for array in &active.counters {
            let key = format!("{}Count", array);
            if !active.options.keeps(&key) {
                continue;
            }
            if let Some(Value::Array(items)) = frame.resolve(array) {
                row.insert(key, Value::from(items.len()));
            }
        }

        self.rows[table].push(row);
        frame
    }
}
