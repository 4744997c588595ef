//! Built-in format parsers

pub mod csv;
pub mod jsonl;

pub use self::csv::CsvParser;
pub use self::jsonl::JsonLinesParser;

use std::sync::Arc;

use crate::error::{IngestError, IngestResult};
use crate::framework::parser::FormatParser;

/// Look up a built-in parser by its format identifier
pub fn parser_for(format: &str) -> IngestResult<Arc<dyn FormatParser>> {
    match format.trim().to_ascii_lowercase().as_str() {
        "jsonl" | "ndjson" | "json_lines" => Ok(Arc::new(JsonLinesParser)),
        "csv" => Ok(Arc::new(CsvParser::default())),
        "tsv" => Ok(Arc::new(CsvParser::with_delimiter(b'\t'))),
        other => Err(IngestError::config(format!("unknown source format '{}'", other))),
    }
}
