//! Builds table columns from a JSON Schema
//!
//! The walk follows `properties` and array `items`, resolving local
//! `$ref`s. Objects are flattened into their table, arrays of objects get a
//! child table, everything else becomes a column.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::path::{join, SEPARATOR};
use crate::table::{TableId, TableRegistry};
use crate::types::ColumnType;

/// Upper bound on chained `$ref` hops before giving up
const MAX_REF_HOPS: usize = 32;

pub(crate) struct SchemaWalker<'s> {
    root: &'s Value,
    max_depth: usize,
}

/// Types declared by a schema node, `type` may be a string or a list.
pub fn extract_type(node: &Value) -> Vec<&str> {
    match node.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn is_object(node: &Value) -> bool {
    extract_type(node).contains(&"object") || node.get("properties").is_some()
}

fn is_array(node: &Value) -> bool {
    extract_type(node).contains(&"array")
}

impl<'s> SchemaWalker<'s> {
    pub(crate) fn new(root: &'s Value, max_depth: usize) -> Self {
        SchemaWalker { root, max_depth }
    }

    /// Follows `$ref` links pointing into the same document.
    fn resolve(&self, node: &'s Value) -> Result<&'s Value> {
        let mut current = node;
        for _ in 0..MAX_REF_HOPS {
            let Some(reference) = current.get("$ref").and_then(Value::as_str) else {
                return Ok(current);
            };
            let Some(pointer) = reference.strip_prefix('#') else {
                return Err(Error::Schema {
                    path: reference.to_string(),
                    reason: "only local references are supported".to_string(),
                });
            };
            current = self.root.pointer(pointer).ok_or_else(|| Error::Schema {
                path: reference.to_string(),
                reason: "reference does not resolve".to_string(),
            })?;
        }
        Err(Error::Schema {
            path: String::new(),
            reason: format!("more than {} chained references", MAX_REF_HOPS),
        })
    }

    /// Object schema whose instances live at `path`; array levels are
    /// stepped through via `items`.
    fn object_at(&self, path: &str) -> Result<Option<&'s Value>> {
        let mut node = self.resolve(self.root)?;
        for segment in path.split(SEPARATOR).filter(|s| !s.is_empty()) {
            if is_array(node) {
                let Some(items) = node.get("items") else {
                    return Ok(None);
                };
                node = self.resolve(items)?;
            }
            let Some(child) = node.get("properties").and_then(|p| p.get(segment)) else {
                return Ok(None);
            };
            node = self.resolve(child)?;
        }
        if is_array(node) {
            match node.get("items") {
                Some(items) => node = self.resolve(items)?,
                None => return Ok(None),
            }
        }
        Ok(Some(node))
    }

    /// Adds the columns and child tables found under `path` to `table`.
    pub(crate) fn build(&self, registry: &mut TableRegistry, table: TableId, path: &str) -> Result<()> {
        let Some(node) = self.object_at(path)? else {
            warn!(table = %registry.get(table).name, path, "path not found in schema");
            return Ok(());
        };
        let key = path.rsplit(SEPARATOR).next().unwrap_or_default();
        self.parse_object(registry, table, node, path, key, 0)
    }

    fn parse_object(
        &self,
        registry: &mut TableRegistry,
        table: TableId,
        schema: &'s Value,
        pointer: &str,
        parent_key: &str,
        depth: usize,
    ) -> Result<()> {
        if depth > self.max_depth {
            debug!(pointer, "maximum schema depth reached");
            return Ok(());
        }
        let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
            return Ok(());
        };

        for (key, property) in properties.iter() {
            let property = self.resolve(property)?;
            let path = join(pointer, key);

            if is_object(property) {
                self.parse_object(registry, table, property, &path, key, depth + 1)?;
            } else if is_array(property) {
                let items = property.get("items").map(|items| self.resolve(items)).transpose()?;
                match items {
                    Some(items) if is_object(items) => {
                        let child = registry.add_child_table(table, &path, parent_key, key);
                        debug!(table = %registry.get(child).name, path = %path, "child table");
                        self.parse_object(registry, child, items, &path, key, depth + 1)?;
                    }
                    _ => registry.add_column(table, &path, property, ColumnType::Array, schema, false, false),
                }
            } else {
                let column_type = extract_type(property)
                    .into_iter()
                    .find_map(ColumnType::from_schema_name)
                    .unwrap_or(ColumnType::String);
                registry.add_column(table, &path, property, column_type, schema, false, false);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;
    use serde_json::json;

    #[test]
    fn test_extract_type() {
        assert_eq!(extract_type(&json!({"type": "string"})), vec!["string"]);
        assert_eq!(extract_type(&json!({"type": ["string", "null"]})), vec!["string", "null"]);
        assert!(extract_type(&json!({})).is_empty());
        assert!(extract_type(&Value::Null).is_empty());
    }

    #[test]
    fn test_resolve_local_reference() {
        let schema = json!({
            "definitions": {"Value": {"title": "Value", "type": "object"}},
            "properties": {"value": {"$ref": "#/definitions/Value"}}
        });
        let walker = SchemaWalker::new(&schema, 8);
        let resolved = walker.resolve(&schema["properties"]["value"]).unwrap();
        assert_eq!(resolved["title"], "Value");

        let broken = json!({"$ref": "#/definitions/Missing"});
        assert!(walker.resolve(&broken).is_err());
        let remote = json!({"$ref": "https://example.com/schema.json"});
        assert!(walker.resolve(&remote).is_err());
    }

    #[test]
    fn test_build_creates_columns_and_children() {
        let schema = json!({
            "properties": {
                "tender": {
                    "title": "Tender",
                    "type": "object",
                    "properties": {
                        "id": {"title": "Tender ID", "type": "string"},
                        "methods": {"title": "Methods", "type": "array", "items": {"type": "string"}},
                        "items": {
                            "type": "array",
                            "items": {"title": "Item", "type": "object", "properties": {"id": {"title": "ID", "type": ["string", "integer"]}}}
                        }
                    }
                }
            }
        });
        let mut registry = TableRegistry::new();
        let tenders = registry
            .insert(Table::root("tenders", vec!["/tender".to_string()], false))
            .unwrap();
        SchemaWalker::new(&schema, 8)
            .build(&mut registry, tenders, "/tender")
            .unwrap();

        let root = registry.get(tenders);
        assert_eq!(root.columns["/tender/id"].title, "Tender Id");
        assert_eq!(root.columns["/tender/methods"].column_type, ColumnType::Array);
        assert!(root.combined_columns.contains_key("/tender/items/0/id"));
        assert_eq!(root.child_tables, vec!["tenders_items"]);

        let items = registry.table("tenders_items").unwrap();
        assert_eq!(items.columns["/tender/items/id"].column_type, ColumnType::String);
        assert_eq!(items.titles["/tender/items/id"], "Item Id");
    }

    #[test]
    fn test_build_missing_path_is_skipped() {
        let schema = json!({"properties": {}});
        let mut registry = TableRegistry::new();
        let awards = registry
            .insert(Table::root("awards", vec!["/awards".to_string()], false))
            .unwrap();
        SchemaWalker::new(&schema, 8).build(&mut registry, awards, "/awards").unwrap();
        assert_eq!(registry.get(awards).columns.len(), 3);
    }
}
