//! Flattening: options, the engine and the CSV and spreadsheet output

mod flattener;
mod options;
mod writer;
mod xlsx;

pub use flattener::{Flatten, Flattener};
pub use options::{FlattenOptions, TableOptions};
pub use writer::CsvWriter;
pub use xlsx::XlsxWriter;
