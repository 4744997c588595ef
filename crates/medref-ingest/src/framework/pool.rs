//! Parallel parse pool
//!
//! Each file is parsed on its own blocking task; at most `max_workers` run at
//! once. A failing or panicking file is reported as that file's parsing error
//! and never cancels its siblings.
//!
//! Deduplication runs on the same task, so only a file's survivors are held
//! once parsing of a group completes.

use flate2::read::MultiGzDecoder;
use futures::stream::{self, StreamExt};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::dedup::{deduplicate, DedupOutcome};
use super::parser::{RejectedRecord, SourceRegistration};
use super::types::SourceFile;
use crate::error::{IngestError, IngestResult};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Half the available cores, at least one
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

/// Deduplicated records of one file
#[derive(Debug, Clone, Default)]
pub struct ParsedRecords {
    pub dedup: DedupOutcome,
    /// Parser rejects plus records the strategy could not key
    pub rejected: Vec<RejectedRecord>,
    /// Parse and dedup time
    pub parse_time: Duration,
}

impl ParsedRecords {
    /// Every record seen in the file, accepted or not
    pub fn records_found(&self) -> usize {
        self.dedup.total_input + self.rejected.len()
    }
}

/// Parse result for one file
#[derive(Debug)]
pub struct ParsedFile {
    pub file: SourceFile,
    pub outcome: IngestResult<ParsedRecords>,
}

/// Parse `files` concurrently and return results ordered by path
pub async fn parse_all(
    files: Vec<SourceFile>,
    registration: Arc<SourceRegistration>,
    max_workers: usize,
) -> Vec<ParsedFile> {
    let max_workers = max_workers.max(1);
    let total = files.len();

    info!(
        source_type = %registration.source_type,
        files = total,
        max_workers,
        "Parsing files"
    );

    let mut parsed: Vec<ParsedFile> = stream::iter(files)
        .map(|file| {
            let registration = Arc::clone(&registration);
            async move {
                let task_file = file.clone();
                let joined =
                    tokio::task::spawn_blocking(move || parse_file(&task_file, &registration))
                        .await;

                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => Err(IngestError::parsing(
                        file.file_name(),
                        "parser panicked while reading the file",
                    )),
                    Err(e) => Err(IngestError::parsing(
                        file.file_name(),
                        format!("parse task failed: {}", e),
                    )),
                };

                if let Err(e) = &outcome {
                    warn!(file = %file.file_name(), error = %e, "Failed to parse file");
                }

                ParsedFile { file, outcome }
            }
        })
        .buffer_unordered(max_workers)
        .collect()
        .await;

    parsed.sort_by(|a, b| a.file.path.cmp(&b.file.path));
    parsed
}

/// Parse and deduplicate one file on the current thread
pub fn parse_file(
    file: &SourceFile,
    registration: &SourceRegistration,
) -> IngestResult<ParsedRecords> {
    let started = Instant::now();
    let file_name = file.file_name();

    let mut reader = open_reader(file)
        .map_err(|e| IngestError::parsing(&file_name, format!("cannot open file: {}", e)))?;

    let output = registration
        .parser
        .parse(reader.as_mut())
        .map_err(|e| match e {
            IngestError::Parsing { .. } => e,
            other => IngestError::parsing(&file_name, other.to_string()),
        })?;

    let mut rejected = output.rejected;
    let mut records = Vec::with_capacity(output.records.len());
    for (index, fields) in output.records.into_iter().enumerate() {
        match registration.strategy.build_record(fields) {
            Ok(record) => records.push(record),
            Err(e) => rejected.push(RejectedRecord {
                index,
                reason: e.to_string(),
            }),
        }
    }

    let parsed = ParsedRecords {
        dedup: deduplicate(records, &registration.strategy),
        rejected,
        parse_time: started.elapsed(),
    };

    debug!(
        file = %file_name,
        records = parsed.dedup.total_input,
        survivors = parsed.dedup.records.len(),
        rejected = parsed.rejected.len(),
        elapsed_ms = parsed.parse_time.as_millis() as u64,
        "Parsed file"
    );

    Ok(parsed)
}

/// Open a file for streaming, decompressing `.gz` transparently
fn open_reader(file: &SourceFile) -> std::io::Result<Box<dyn BufRead>> {
    let handle = File::open(&file.path)?;
    let gzipped = file
        .path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));

    if gzipped {
        Ok(Box::new(BufReader::with_capacity(
            READ_BUFFER_SIZE,
            MultiGzDecoder::new(handle),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, handle)))
    }
}
