//! JSON lines: one object per line

use std::io::BufRead;

use crate::error::IngestResult;
use crate::framework::parser::{FormatParser, ParseOutput};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesParser;

impl FormatParser for JsonLinesParser {
    fn format(&self) -> &str {
        "jsonl"
    }

    fn parse(&self, reader: &mut dyn BufRead) -> IngestResult<ParseOutput> {
        let mut output = ParseOutput::default();
        let mut buf = Vec::new();
        let mut index = 0;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }

            // A corrupt byte costs one record, not the file
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    output.reject(index, format!("line is not valid UTF-8: {}", e));
                    index += 1;
                    continue;
                },
            };
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(serde_json::Value::Object(fields)) => output.records.push(fields),
                Ok(_) => output.reject(index, "line is not a JSON object"),
                Err(e) => output.reject(index, format!("invalid JSON: {}", e)),
            }
            index += 1;
        }

        Ok(output)
    }
}
