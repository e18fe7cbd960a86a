//! Analysis pass
//!
//! Builds the table registry from a JSON Schema and counts what a pass over
//! sample data contains: column hits, array widths and observed types.

mod schema;
mod stats;

pub use schema::extract_type;
pub use stats::Preprocessor;
