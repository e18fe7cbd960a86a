//! Record sources
//!
//! Streams of concatenated or newline-delimited JSON are pulled one record at
//! a time. Whole documents are parsed with simd-json and the records are taken
//! from the array under a root key.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::io::Read;

/// Layout of the input data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFormat {
    /// NDJSON or concatenated JSON values, one record each
    Stream,
    /// A single JSON document holding the records in an array at `root_key`.
    /// A top-level array is used directly.
    Document { root_key: String },
}

pub type Records = Box<dyn Iterator<Item = Result<Value>>>;

/// Opens a lazy record iterator over `reader`.
pub fn read_records<R: Read + 'static>(reader: R, format: InputFormat) -> Result<Records> {
    match format {
        InputFormat::Stream => {
            let stream = serde_json::Deserializer::from_reader(reader).into_iter::<Value>();
            Ok(Box::new(
                stream.map(|result| result.context("Failed to parse JSON record")),
            ))
        }
        InputFormat::Document { root_key } => {
            let mut content = Vec::new();
            let mut reader = reader;
            reader
                .read_to_end(&mut content)
                .context("Failed to read input document")?;
            let document: Value = simd_json::serde::from_slice(&mut content)
                .map_err(|err| anyhow!("Failed to parse JSON document: {}", err))?;
            let records = match document {
                Value::Array(records) => records,
                Value::Object(mut fields) => match fields.remove(&root_key) {
                    Some(Value::Array(records)) => records,
                    Some(_) => return Err(anyhow!("`{}` is not an array", root_key)),
                    None => return Err(anyhow!("document has no `{}` key", root_key)),
                },
                _ => return Err(anyhow!("document is neither an object nor an array")),
            };
            Ok(Box::new(records.into_iter().map(Ok)))
        }
    }
}
