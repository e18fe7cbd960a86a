//! # Flatsheet - Schema-driven JSON flattening
//!
//! Turns nested, schema-described JSON records into flat tables ready for
//! CSV or spreadsheet (xlsx) output.
//!
//! ## Modules
//!
//! - **analyze**: Build the table model from a JSON Schema and count what the data holds
//! - **flatten**: Walk records against the model, emit per-table rows and write them out
//! - **table**: Tables, columns and the registry that owns them
//! - **path**: Path helpers shared by both passes
//! - **input**: Record sources (NDJSON streams and whole documents)
//!
//! ## Quick Start
//!
//! ```rust
//! use flatsheet::{AnalysisConfig, FlattenOptions, Flattener, Preprocessor, TableOptions};
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let schema = json!({
//!     "properties": {
//!         "tender": {
//!             "title": "Tender",
//!             "type": "object",
//!             "properties": {
//!                 "id": {"title": "Tender ID", "type": "string"},
//!                 "items": {
//!                     "type": "array",
//!                     "items": {"title": "Item", "type": "object", "properties": {"id": {"type": "string"}}}
//!                 }
//!             }
//!         }
//!     }
//! });
//! let releases = vec![json!({
//!     "ocid": "ocds-1",
//!     "id": "r1",
//!     "tender": {"id": "t1", "items": [{"id": "i1"}, {"id": "i2"}]}
//! })];
//!
//! let config = AnalysisConfig::default().with_root("tenders", &["/tender"]);
//! let mut preprocessor = Preprocessor::new(&schema, &config)?;
//! preprocessor.process_items(&releases)?;
//! let registry = preprocessor.into_tables();
//!
//! let options = FlattenOptions::new([("tenders", TableOptions::split())]);
//! let flattener = Flattener::new(options, &registry)?;
//! for (_, tables) in flattener.flatten(&releases) {
//!     // tables["tenders"] holds one row, tables["tenders_items"] two
//!     assert_eq!(tables["tenders_items"].len(), 2);
//! }
//! # Ok(())
//! # }
//! ```

pub mod analyze;
pub mod config;
pub mod error;
pub mod flatten;
pub mod input;
pub mod path;
pub mod table;
pub mod types;

pub use analyze::Preprocessor;
pub use config::{AnalysisConfig, PipelineConfig};
pub use error::{Error, Result};
pub use flatten::{CsvWriter, Flatten, FlattenOptions, Flattener, TableOptions, XlsxWriter};
pub use input::{read_records, InputFormat};
pub use table::{Table, TableId, TableRegistry};
pub use types::{Column, ColumnType, Row};
