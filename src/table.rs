//! Table/column model derived from the schema
//!
//! Tables live in a [`TableRegistry`] arena and refer to their parent by
//! [`TableId`]. The parent link is only used for upward lookups: finding the
//! root (which owns the `arrays` registry) and pushing combined columns up
//! the chain.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::path::{combine_path_from, generate_table_name, is_prefix, prepare_title};
use crate::types::{Column, ColumnType, Row, DEFAULT_FIELDS, ROOT_FIELDS};

/// Index of a table inside its [`TableRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableId(pub usize);

/// One destination sheet/file
#[derive(Debug, Clone, Serialize)]
pub struct Table {
    /// Unique name, used for output files
    pub name: String,

    /// Path prefixes routing data to this table
    pub path: Vec<String>,

    /// Rows seen during analysis
    pub total_rows: u64,

    /// Table this one was split out of; `None` for roots
    #[serde(skip)]
    pub parent: Option<TableId>,

    pub is_root: bool,

    /// Table gathers the same structure from several paths. The flattener
    /// folds the columns of every path onto the first one.
    pub is_combined: bool,

    /// Columns of the split representation
    pub columns: IndexMap<String, Column>,

    /// Columns of the unsplit representation, index-qualified
    pub combined_columns: IndexMap<String, Column>,

    /// Columns found in data but not in the schema
    pub additional_columns: IndexMap<String, Column>,

    /// Array path -> maximum observed length. Only meaningful on roots.
    pub arrays: IndexMap<String, usize>,

    /// Path -> display title, for both representations
    pub titles: IndexMap<String, String>,

    /// Names of tables split out of this one
    pub child_tables: Vec<String>,

    /// Path -> types observed in data
    pub types: IndexMap<String, Vec<ColumnType>>,

    /// First analysed rows of the split representation
    pub preview_rows: Vec<Row>,

    /// First analysed rows of the unsplit representation
    pub preview_rows_combined: Vec<Row>,
}

impl Table {
    /// Path of this table as written in output: a combined table reports
    /// every matched path under its first one.
    pub fn canonical(&self, path: &str) -> String {
        match (self.is_combined, self.path.first(), self.matched_path(path)) {
            (true, Some(first), Some(base)) if base != first => format!("{}{}", first, &path[base.len()..]),
            _ => path.to_string(),
        }
    }

    /// Creates a root table seeded with the synthetic identifier columns.
    pub fn root(name: impl Into<String>, path: Vec<String>, is_combined: bool) -> Self {
        let mut table = Table::empty(name.into(), path);
        table.is_root = true;
        table.is_combined = is_combined;
        table.seed(&ROOT_FIELDS);
        table
    }

    fn child(name: String, pointer: &str, parent: TableId) -> Self {
        let mut table = Table::empty(name, vec![pointer.to_string()]);
        table.parent = Some(parent);
        table.seed(&DEFAULT_FIELDS);
        table
    }

    fn empty(name: String, path: Vec<String>) -> Self {
        Table {
            name,
            path,
            total_rows: 0,
            parent: None,
            is_root: false,
            is_combined: false,
            columns: IndexMap::new(),
            combined_columns: IndexMap::new(),
            additional_columns: IndexMap::new(),
            arrays: IndexMap::new(),
            titles: IndexMap::new(),
            child_tables: Vec::new(),
            types: IndexMap::new(),
            preview_rows: Vec::new(),
            preview_rows_combined: Vec::new(),
        }
    }

    fn seed(&mut self, fields: &[&str]) {
        for field in fields {
            let column = Column::new(*field, *field, ColumnType::String);
            self.columns.insert(field.to_string(), column.clone());
            self.combined_columns.insert(field.to_string(), column);
            self.titles.insert(field.to_string(), field.to_string());
        }
    }

    /// Longest of this table's paths that is a prefix of `path`.
    pub fn matched_path(&self, path: &str) -> Option<&str> {
        self.path
            .iter()
            .filter(|candidate| is_prefix(candidate, path))
            .max_by_key(|candidate| candidate.len())
            .map(String::as_str)
    }

    /// True when `path` is a split column of this table.
    pub fn contains(&self, path: &str) -> bool {
        self.columns.contains_key(path)
    }

    /// Counts one more analysed row.
    pub fn inc(&mut self) {
        self.total_rows += 1;
    }

    /// Counts a value at `path`.
    ///
    /// With `combined` only the combined column is touched. Otherwise the
    /// split column is counted together with its combined and additional
    /// twins when they exist. Unknown paths are a model inconsistency.
    pub fn inc_column(&mut self, path: &str, combined: bool) -> Result<()> {
        if combined {
            return match self.combined_columns.get_mut(path) {
                Some(column) => {
                    column.hits += 1;
                    Ok(())
                }
                None => Err(self.unknown_column(path)),
            };
        }
        match self.columns.get_mut(path) {
            Some(column) => column.hits += 1,
            None => return Err(self.unknown_column(path)),
        }
        if let Some(column) = self.combined_columns.get_mut(path) {
            column.hits += 1;
        }
        if let Some(column) = self.additional_columns.get_mut(path) {
            column.hits += 1;
        }
        Ok(())
    }

    fn unknown_column(&self, path: &str) -> Error {
        Error::UnknownColumn {
            table: self.name.clone(),
            path: path.to_string(),
        }
    }

    /// Records a type seen in data at `path`.
    pub fn observe_type(&mut self, path: &str, column_type: ColumnType) {
        let seen = self.types.entry(path.to_string()).or_default();
        if !seen.contains(&column_type) {
            seen.push(column_type);
        }
    }

    fn select(&self, split: bool, available: bool) -> Vec<&str> {
        let columns = if split { &self.columns } else { &self.combined_columns };
        columns
            .iter()
            .filter(|(_, column)| column.is_available() == available)
            .map(|(path, _)| path.as_str())
            .collect()
    }

    /// Columns known from the schema but never seen in analysed data.
    pub fn missing_rows(&self, split: bool) -> Vec<&str> {
        self.select(split, false)
    }

    /// Columns seen at least once in analysed data.
    pub fn available_rows(&self, split: bool) -> Vec<&str> {
        self.select(split, true)
    }
}

/// Arena owning every table of one analysis session
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: Vec<Table>,
    names: HashMap<String, TableId>,
}

impl TableRegistry {
    pub fn new() -> Self {
        TableRegistry::default()
    }

    /// Registers a table. Names must be unique.
    pub fn insert(&mut self, table: Table) -> Result<TableId> {
        if self.names.contains_key(&table.name) {
            return Err(Error::ConflictingOptions {
                table: table.name,
                reason: "table name is registered twice".to_string(),
            });
        }
        let id = TableId(self.tables.len());
        self.names.insert(table.name.clone(), id);
        self.tables.push(table);
        Ok(id)
    }

    pub fn get(&self, id: TableId) -> &Table {
        &self.tables[id.0]
    }

    pub fn get_mut(&mut self, id: TableId) -> &mut Table {
        &mut self.tables[id.0]
    }

    pub fn id(&self, name: &str) -> Option<TableId> {
        self.names.get(name).copied()
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.id(name).map(|id| self.get(id))
    }

    /// Tables in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (TableId, &Table)> {
        self.tables.iter().enumerate().map(|(i, table)| (TableId(i), table))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Follows parent links up to the root of `id`'s chain.
    pub fn root_of(&self, id: TableId) -> TableId {
        let mut current = id;
        while let Some(parent) = self.get(current).parent {
            current = parent;
        }
        current
    }

    /// `id` followed by its ancestors, root last.
    pub fn chain(&self, id: TableId) -> Vec<TableId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.get(current).parent {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Adds a column for a schema leaf at `path`.
    ///
    /// The owning table gets the split column (unless `combined_only`) and a
    /// combined column; every ancestor up to the root gets the combined
    /// column only, each with the combined path seen from its own matched
    /// path. Existing columns keep their counters.
    #[allow(clippy::too_many_arguments)]
    pub fn add_column(
        &mut self,
        id: TableId,
        path: &str,
        item: &Value,
        column_type: ColumnType,
        parent: &Value,
        combined_only: bool,
        additional: bool,
    ) {
        let title = prepare_title(item, parent);
        let root = self.root_of(id);
        let mut current = id;
        let mut combined_only = combined_only;

        loop {
            let combined_path = {
                let base = self.get(current).matched_path(path).unwrap_or("");
                combine_path_from(self.get(root), base, path, "0")
            };
            let table = self.get_mut(current);
            table
                .combined_columns
                .entry(combined_path.clone())
                .or_insert_with(|| Column::new(combined_path.clone(), title.clone(), column_type));
            table.titles.insert(path.to_string(), title.clone());
            table.titles.insert(combined_path, title.clone());

            if !combined_only {
                table
                    .columns
                    .entry(path.to_string())
                    .or_insert_with(|| Column::new(path, title.clone(), column_type));
            }
            if additional && current == id {
                table
                    .additional_columns
                    .entry(path.to_string())
                    .or_insert_with(|| Column::new(path, title.clone(), column_type));
            }

            match table.parent {
                Some(parent) if !table.is_root => {
                    current = parent;
                    combined_only = true;
                }
                _ => break,
            }
        }
    }

    /// Records an occurrence of the array at `path` with `len` elements.
    ///
    /// Returns true when `len` exceeds the maximum registered on the root.
    pub fn set_array(&mut self, id: TableId, path: &str, len: usize) -> bool {
        let root = self.root_of(id);
        let longest = self.get_mut(root).arrays.entry(path.to_string()).or_insert(0);
        if len > *longest {
            *longest = len;
            true
        } else {
            false
        }
    }

    /// Creates the table receiving the array at `pointer` inside `parent`.
    pub fn add_child_table(&mut self, parent: TableId, pointer: &str, parent_key: &str, key: &str) -> TableId {
        let base = generate_table_name(&self.get(parent).name, parent_key, key);
        let mut name = base.clone();
        let mut suffix = 1;
        while self.names.contains_key(&name) {
            name = format!("{}{}", base, suffix);
            suffix += 1;
        }
        if name != base {
            debug!(table = %name, pointer, "table name taken, using suffixed name");
        }

        let id = TableId(self.tables.len());
        self.names.insert(name.clone(), id);
        self.tables.push(Table::child(name.clone(), pointer, parent));
        self.get_mut(parent).child_tables.push(name);

        let root = self.root_of(parent);
        self.get_mut(root).arrays.entry(pointer.to_string()).or_insert(0);
        id
    }

    /// Plain JSON view of a table with the parent link replaced by its name.
    pub fn dump(&self, id: TableId) -> serde_json::Result<Value> {
        let table = self.get(id);
        let mut value = serde_json::to_value(table)?;
        if let Value::Object(ref mut fields) = value {
            let parent = table
                .parent
                .map(|parent| Value::String(self.get(parent).name.clone()))
                .unwrap_or(Value::Null);
            fields.insert("parent".to_string(), parent);
        }
        Ok(value)
    }
}
