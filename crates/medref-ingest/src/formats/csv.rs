//! Delimited text with a header row

use std::io::BufRead;

use crate::error::{IngestError, IngestResult};
use crate::framework::parser::{FormatParser, ParseOutput};
use crate::framework::types::FieldMap;

/// Each row becomes an object of strings named by the header row
#[derive(Debug, Clone, Copy)]
pub struct CsvParser {
    delimiter: u8,
}

impl Default for CsvParser {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl CsvParser {
    pub fn with_delimiter(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl FormatParser for CsvParser {
    fn format(&self) -> &str {
        if self.delimiter == b'\t' {
            "tsv"
        } else {
            "csv"
        }
    }

    fn parse(&self, reader: &mut dyn BufRead) -> IngestResult<ParseOutput> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .map_err(|e| IngestError::Validation(format!("unreadable header row: {}", e)))?
            .clone();

        let mut output = ParseOutput::default();
        for (index, row) in csv_reader.records().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(e) if e.is_io_error() => {
                    return Err(IngestError::Validation(format!("read failed: {}", e)))
                },
                Err(e) => {
                    output.reject(index, e.to_string());
                    continue;
                },
            };

            if row.len() != headers.len() {
                output.reject(
                    index,
                    format!("expected {} columns, found {}", headers.len(), row.len()),
                );
                continue;
            }

            let fields: FieldMap = headers
                .iter()
                .zip(row.iter())
                .map(|(name, value)| (name.to_string(), serde_json::Value::from(value)))
                .collect();
            output.records.push(fields);
        }

        Ok(output)
    }
}
