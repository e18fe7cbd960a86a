use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Synthetic identifier fields carried by every row.
pub const ROW_ID: &str = "rowID";
pub const ID: &str = "id";
pub const PARENT_ID: &str = "parentID";
pub const OCID: &str = "ocid";

/// Synthetic fields seeded into root tables.
pub const ROOT_FIELDS: [&str; 3] = [ROW_ID, ID, OCID];

/// Synthetic fields seeded into child tables.
pub const DEFAULT_FIELDS: [&str; 4] = [ROW_ID, ID, PARENT_ID, OCID];

/// Separator used when an array of scalars is written into a single cell.
pub const JOINABLE_SEPARATOR: &str = ";";

/// One flattened output row, keyed by column path.
pub type Row = IndexMap<String, Value>;

/// Returns true for the identifier fields that filters never drop.
pub fn is_synthetic(path: &str) -> bool {
    DEFAULT_FIELDS.contains(&path)
}

/// Text of a scalar used inside identifiers.
pub fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Cell value for a leaf; arrays of scalars are joined.
///
/// Nulls and empty strings carry no data and yield `None`, the same values
/// the analysis pass leaves uncounted.
pub fn cell(value: &Value) -> Option<Value> {
    match value {
        Value::Null | Value::Object(_) => None,
        Value::String(s) if s.is_empty() => None,
        Value::Array(items) => {
            if items.iter().any(|item| item.is_object() || item.is_array()) {
                return None;
            }
            let joined: Vec<String> = items.iter().filter_map(text).collect();
            Some(Value::String(joined.join(JOINABLE_SEPARATOR)))
        }
        _ => Some(value.clone()),
    }
}

/// JSON type of a column, as declared by the schema or observed in data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ColumnType {
    /// Type of a data value; `None` for null.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Some(ColumnType::Integer)
                } else {
                    Some(ColumnType::Number)
                }
            }
            Value::String(_) => Some(ColumnType::String),
            Value::Array(_) => Some(ColumnType::Array),
            Value::Object(_) => Some(ColumnType::Object),
        }
    }

    /// Parses a JSON Schema type name. `null` and unknown names yield `None`.
    pub fn from_schema_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(ColumnType::String),
            "integer" => Some(ColumnType::Integer),
            "number" => Some(ColumnType::Number),
            "boolean" => Some(ColumnType::Boolean),
            "array" => Some(ColumnType::Array),
            "object" => Some(ColumnType::Object),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Number => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Array => "array",
            ColumnType::Object => "object",
        }
    }
}

/// A single output field of a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Path of the column, unique within its field mapping
    pub id: String,

    /// Human readable title built from schema titles
    pub title: String,

    /// Declared or observed type
    #[serde(rename = "type")]
    pub column_type: ColumnType,

    /// Number of analysed rows with a value at this path
    pub hits: u64,
}

impl Column {
    pub fn new(id: impl Into<String>, title: impl Into<String>, column_type: ColumnType) -> Self {
        Column {
            id: id.into(),
            title: title.into(),
            column_type,
            hits: 0,
        }
    }

    /// Same column under a different path, with its counter reset.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Column {
            id: id.into(),
            title: self.title.clone(),
            column_type: self.column_type,
            hits: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.hits > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_type_from_value() {
        assert_eq!(ColumnType::from_value(&json!(1)), Some(ColumnType::Integer));
        assert_eq!(ColumnType::from_value(&json!(1.5)), Some(ColumnType::Number));
        assert_eq!(ColumnType::from_value(&json!("a")), Some(ColumnType::String));
        assert_eq!(ColumnType::from_value(&json!([])), Some(ColumnType::Array));
        assert_eq!(ColumnType::from_value(&Value::Null), None);
    }

    #[test]
    fn test_column_serializes_type_lowercase() {
        let column = Column::new("/tender/id", "Tender Id", ColumnType::String);
        let value = serde_json::to_value(&column).unwrap();
        assert_eq!(value["type"], "string");
        assert_eq!(value["hits"], 0);
    }

    #[test]
    fn test_cell_values() {
        assert_eq!(cell(&json!(["a", "b"])), Some(json!("a;b")));
        assert_eq!(cell(&json!(3)), Some(json!(3)));
        assert_eq!(cell(&json!("")), None);
        assert_eq!(cell(&Value::Null), None);
        assert_eq!(cell(&json!([{"id": 1}])), None);
    }

    #[test]
    fn test_synthetic_fields() {
        assert!(is_synthetic("rowID"));
        assert!(is_synthetic("parentID"));
        assert!(!is_synthetic("/tender/id"));
    }
}
