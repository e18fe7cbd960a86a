use thiserror::Error;

/// Errors raised by the table model and the flattening engine.
///
/// Data-quality problems never end up here: unknown data paths are recorded
/// as additional columns and writer failures are logged by the writer.
#[derive(Debug, Error)]
pub enum Error {
    /// A hit was counted for a path the table does not know about.
    #[error("column `{path}` is not defined in table `{table}`")]
    UnknownColumn { table: String, path: String },

    /// A table name in the configuration does not exist in the registry.
    #[error("table `{0}` is not present in the table registry")]
    UnknownTable(String),

    /// Two options for the same table contradict each other.
    #[error("conflicting options for table `{table}`: {reason}")]
    ConflictingOptions { table: String, reason: String },

    /// The JSON Schema could not be walked.
    #[error("schema error at `{path}`: {reason}")]
    Schema { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
