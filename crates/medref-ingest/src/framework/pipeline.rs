//! Ingestion pipeline orchestration
//!
//! For one source type: hash the candidate files, skip unchanged ones, parse
//! the rest in groups, deduplicate each file, drop records the store already
//! holds, upsert the remainder and fingerprint every file that made it to the
//! store. A store that stays unavailable after retries fails the run without
//! fingerprinting any file whose records were not persisted.

use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use medref_common::types::SourceType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::dedup::DedupOutcome;
use super::discovery::discover_files;
use super::errors::{ErrorCollector, ErrorSummary, DEFAULT_MAX_DETAILS_PER_CATEGORY};
use super::fingerprint::{hash_files, FingerprintStore};
use super::filter::{filter_existing, store_keys};
use super::parser::{SourceRegistration, SourceRegistry};
use super::pool::{default_max_workers, parse_all};
use super::progress::{ProgressSnapshot, ProgressTracker, RunState};
use super::retry::{with_retry, RetryPolicy};
use super::store::{RecordStore, UpsertOutcome};
use super::types::{file_name_of, BatchResult, RawRecord, SourceFile};
use crate::error::{ErrorCategory, IngestError, IngestResult};

pub const DEFAULT_HASH_CONCURRENCY: usize = 8;
pub const DEFAULT_FILES_PER_GROUP: usize = 64;
pub const DEFAULT_UPSERT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_SOURCE_CONCURRENCY: usize = 2;

/// Tuning and behaviour switches for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Parse workers; `0` means half the available cores
    pub max_workers: usize,
    pub hash_concurrency: usize,
    /// Files parsed together and sharing one existing-key lookup
    pub files_per_group: usize,
    /// Records per upsert transaction
    pub upsert_batch_size: usize,
    /// Source types ingested at once by `run_sources`
    pub source_concurrency: usize,
    /// Merge records whose key is already stored instead of dropping them
    pub refresh_existing: bool,
    /// Ignore fingerprints and process every file
    pub force_reprocess: bool,
    pub max_error_details: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            hash_concurrency: DEFAULT_HASH_CONCURRENCY,
            files_per_group: DEFAULT_FILES_PER_GROUP,
            upsert_batch_size: DEFAULT_UPSERT_BATCH_SIZE,
            source_concurrency: DEFAULT_SOURCE_CONCURRENCY,
            refresh_existing: false,
            force_reprocess: false,
            max_error_details: DEFAULT_MAX_DETAILS_PER_CATEGORY,
        }
    }
}

impl PipelineConfig {
    pub fn effective_workers(&self) -> usize {
        if self.max_workers == 0 {
            default_max_workers()
        } else {
            self.max_workers
        }
    }

    pub fn validate(&self) -> IngestResult<()> {
        if self.hash_concurrency == 0 {
            return Err(IngestError::config("pipeline.hash_concurrency must be at least 1"));
        }
        if self.files_per_group == 0 {
            return Err(IngestError::config("pipeline.files_per_group must be at least 1"));
        }
        if self.upsert_batch_size == 0 {
            return Err(IngestError::config("pipeline.upsert_batch_size must be at least 1"));
        }
        if self.source_concurrency == 0 {
            return Err(IngestError::config("pipeline.source_concurrency must be at least 1"));
        }
        Ok(())
    }
}

/// Outcome of one source type's run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_type: String,
    pub status: RunState,
    pub total_files_provided: usize,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub total_records_found: u64,
    pub total_records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub duplicates_removed: u64,
    pub content_duplicates_removed: u64,
    pub existing_filtered: u64,
    pub rejected_records: u64,
    pub failed_records: u64,
    pub total_processing_time_seconds: f64,
    pub file_results: Vec<BatchResult>,
    pub errors: ErrorSummary,
    pub progress: ProgressSnapshot,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunState::Completed
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} [{}]: {} files processed, {} skipped, {} failed; {} records found, {} persisted \
             ({} new, {} updated), {} duplicates, {} content duplicates, {} already stored, \
             {} errors in {:.2}s",
            self.source_type,
            self.status,
            self.files_processed,
            self.files_skipped,
            self.files_failed,
            self.total_records_found,
            self.total_records_processed,
            self.records_inserted,
            self.records_updated,
            self.duplicates_removed,
            self.content_duplicates_removed,
            self.existing_filtered,
            self.errors.total,
            self.total_processing_time_seconds,
        )
    }
}

/// A file that parsed and deduplicated, waiting to be persisted
struct PreparedFile {
    file: SourceFile,
    records_found: usize,
    rejected_records: usize,
    dedup: DedupOutcome,
    prepare_time: Duration,
}

/// Mutable state of one run
struct RunContext {
    run_id: Uuid,
    source_type: SourceType,
    started: Instant,
    tracker: ProgressTracker,
    errors: ErrorCollector,
    total_files_provided: usize,
    files_processed: usize,
    files_skipped: usize,
    files_failed: usize,
    file_results: Vec<BatchResult>,
}

impl RunContext {
    fn file_failed(&mut self, error: &IngestError, file: &str, progress: Option<&ProgressBar>) {
        self.errors.record(error, Some(file), None);
        self.tracker.record_file_failed();
        self.files_failed += 1;
        if let Some(bar) = progress {
            bar.inc(1);
        }
    }

    /// Move to a terminal state and build the report
    fn finish(mut self, status: RunState) -> RunReport {
        if let Err(e) = self.tracker.transition(status) {
            warn!(source_type = %self.source_type, error = %e, "Ignoring invalid final transition");
        }

        let sum = |f: fn(&BatchResult) -> usize| -> u64 {
            self.file_results.iter().map(|b| f(b) as u64).sum()
        };

        RunReport {
            run_id: self.run_id,
            source_type: self.source_type.to_string(),
            status: self.tracker.state(),
            total_files_provided: self.total_files_provided,
            files_processed: self.files_processed,
            files_skipped: self.files_skipped,
            files_failed: self.files_failed,
            total_records_found: sum(|b| b.total_input_records),
            total_records_processed: sum(|b| b.persisted()),
            records_inserted: sum(|b| b.new_records),
            records_updated: sum(|b| b.updated_records),
            duplicates_removed: sum(|b| b.duplicates_removed),
            content_duplicates_removed: sum(|b| b.content_duplicates_removed),
            existing_filtered: sum(|b| b.existing_filtered),
            rejected_records: sum(|b| b.rejected_records),
            failed_records: sum(|b| b.failed_records),
            total_processing_time_seconds: self.started.elapsed().as_secs_f64(),
            errors: self.errors.summary(),
            progress: self.tracker.snapshot(),
            file_results: self.file_results,
        }
    }

    fn fail(mut self, error: IngestError) -> RunReport {
        error!(
            run_id = %self.run_id,
            source_type = %self.source_type,
            error = %error,
            "Ingestion run failed"
        );
        self.errors.record(&error, None, None);
        self.finish(RunState::Failed)
    }

    fn cancel(self) -> RunReport {
        warn!(run_id = %self.run_id, source_type = %self.source_type, "Ingestion run cancelled");
        self.finish(RunState::Cancelled)
    }
}

/// Incremental, deduplicating ingestion of registered sources
pub struct IngestionPipeline {
    registry: SourceRegistry,
    fingerprints: FingerprintStore,
    store: Arc<dyn RecordStore>,
    config: PipelineConfig,
    retry: RetryPolicy,
    cancel: CancellationToken,
    progress: Option<ProgressBar>,
}

impl IngestionPipeline {
    pub fn new(
        registry: SourceRegistry,
        fingerprints: FingerprintStore,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            registry,
            fingerprints,
            store,
            config: PipelineConfig::default(),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Advance `bar` by one for every file skipped, failed or processed
    pub fn with_progress_bar(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Discover files under `directory` and run them
    pub async fn run_directory(
        &self,
        source_type: &SourceType,
        directory: &Path,
        extensions: &[String],
    ) -> IngestResult<RunReport> {
        self.registry.get(source_type)?;
        let paths = discover_files(directory, extensions)?;
        self.run(source_type, paths).await
    }

    /// Run several source types, at most `source_concurrency` at once
    pub async fn run_sources(
        &self,
        runs: Vec<(SourceType, Vec<PathBuf>)>,
    ) -> Vec<(SourceType, IngestResult<RunReport>)> {
        let mut results: Vec<(SourceType, IngestResult<RunReport>)> = stream::iter(runs)
            .map(|(source_type, paths)| async move {
                let result = self.run(&source_type, paths).await;
                (source_type, result)
            })
            .buffer_unordered(self.config.source_concurrency.max(1))
            .collect()
            .await;

        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Ingest `paths` for one source type
    ///
    /// Returns `Err` only for problems detected before any file is touched:
    /// a missing registration, invalid configuration or an unreachable store.
    /// Failures after that point are reported in the returned [`RunReport`].
    pub async fn run(&self, source_type: &SourceType, paths: Vec<PathBuf>) -> IngestResult<RunReport> {
        self.config.validate()?;
        self.retry.validate()?;
        let registration = self.registry.get(source_type)?;

        let store = &self.store;
        with_retry(&self.retry, "ping", move || store.ping()).await?;

        let mut ctx = RunContext {
            run_id: Uuid::new_v4(),
            source_type: source_type.clone(),
            started: Instant::now(),
            tracker: ProgressTracker::new(source_type.as_str(), registration.expected_records),
            errors: ErrorCollector::new(self.config.max_error_details),
            total_files_provided: paths.len(),
            files_processed: 0,
            files_skipped: 0,
            files_failed: 0,
            file_results: Vec::new(),
        };

        info!(
            run_id = %ctx.run_id,
            source_type = %source_type,
            files = paths.len(),
            force = self.config.force_reprocess,
            refresh = self.config.refresh_existing,
            "Starting ingestion run"
        );

        ctx.tracker.set_total_files(paths.len());
        ctx.tracker.transition(RunState::Scanning)?;
        if let Some(bar) = &self.progress {
            bar.inc_length(paths.len() as u64);
        }

        let hashed = hash_files(paths, source_type, self.config.hash_concurrency).await;
        for (path, e) in &hashed.failures {
            let name = file_name_of(path);
            ctx.file_failed(e, &name, self.progress.as_ref());
        }

        let fingerprints = &self.fingerprints;
        let force = self.config.force_reprocess;
        let candidates = hashed.files;
        let split = match with_retry(&self.retry, "filter_candidates", move || {
            fingerprints.filter_candidates(candidates.clone(), force)
        })
        .await
        {
            Ok(split) => split,
            Err(e) => return Ok(ctx.fail(e)),
        };

        ctx.files_skipped = split.skip.len();
        ctx.tracker.record_skipped(split.skip.len());
        if let Some(bar) = &self.progress {
            bar.inc(split.skip.len() as u64);
        }

        if split.to_process.is_empty() {
            info!(source_type = %source_type, skipped = ctx.files_skipped, "No changed files to ingest");
            return Ok(ctx.finish(RunState::Completed));
        }

        for group in split.to_process.chunks(self.config.files_per_group) {
            if self.cancel.is_cancelled() {
                return Ok(ctx.cancel());
            }

            if let Err(e) = self.process_group(&mut ctx, &registration, group.to_vec()).await {
                return Ok(match e {
                    GroupError::Cancelled => ctx.cancel(),
                    GroupError::Failed(e) => ctx.fail(e),
                });
            }
        }

        let report = ctx.finish(RunState::Completed);
        info!(run_id = %report.run_id, "{}", report.summary_line());
        Ok(report)
    }

    async fn process_group(
        &self,
        ctx: &mut RunContext,
        registration: &Arc<SourceRegistration>,
        group: Vec<SourceFile>,
    ) -> Result<(), GroupError> {
        ctx.tracker.transition(RunState::Parsing)?;
        let parsed = parse_all(
            group,
            Arc::clone(registration),
            self.config.effective_workers(),
        )
        .await;

        ctx.tracker.transition(RunState::Deduplicating)?;
        let mut prepared = Vec::with_capacity(parsed.len());
        for parsed_file in parsed {
            let file_name = parsed_file.file.file_name();
            let records = match parsed_file.outcome {
                Ok(records) => records,
                Err(e) => {
                    ctx.file_failed(&e, &file_name, self.progress.as_ref());
                    continue;
                },
            };

            for rejected in &records.rejected {
                ctx.errors.record_message(
                    ErrorCategory::Validation,
                    Some(&file_name),
                    None,
                    format!("record {}: {}", rejected.index, rejected.reason),
                );
            }

            prepared.push(PreparedFile {
                file: parsed_file.file,
                records_found: records.records_found(),
                rejected_records: records.rejected.len(),
                dedup: records.dedup,
                prepare_time: records.parse_time,
            });
        }

        let mut existing = if self.config.refresh_existing {
            HashSet::new()
        } else {
            let keys = store_keys(prepared.iter().flat_map(|p| p.dedup.records.iter()));
            self.lookup_existing(&registration.source_type, keys).await?
        };

        ctx.tracker.transition(RunState::Persisting)?;
        for file in prepared {
            if self.cancel.is_cancelled() {
                return Err(GroupError::Cancelled);
            }
            self.persist_file(ctx, registration, file, &mut existing).await?;
        }

        Ok(())
    }

    async fn lookup_existing(
        &self,
        source_type: &SourceType,
        keys: Vec<String>,
    ) -> Result<HashSet<String>, GroupError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let store = &self.store;
        let keys = keys.as_slice();
        let existing = with_retry(&self.retry, "existing_keys", move || {
            store.existing_keys(source_type, keys)
        })
        .await?;
        Ok(existing)
    }

    async fn persist_file(
        &self,
        ctx: &mut RunContext,
        registration: &SourceRegistration,
        prepared: PreparedFile,
        existing: &mut HashSet<String>,
    ) -> Result<(), GroupError> {
        let started = Instant::now();
        let file_name = prepared.file.file_name();
        let source_type = &registration.source_type;

        let (to_upsert, existing_filtered) = if self.config.refresh_existing {
            (prepared.dedup.records, 0)
        } else {
            let outcome = filter_existing(prepared.dedup.records, existing);
            let filtered = outcome.existing.len();
            (outcome.new, filtered)
        };

        let outcome = self
            .upsert_all(source_type, &to_upsert, registration)
            .await?;

        let failed_keys: HashSet<&str> = outcome.failed.iter().map(|f| f.key.as_str()).collect();
        for failed in &outcome.failed {
            ctx.errors.record_message(
                ErrorCategory::StoreIntegrity,
                Some(&file_name),
                Some(&failed.key),
                failed.message.clone(),
            );
        }
        existing.extend(
            to_upsert
                .iter()
                .map(RawRecord::store_key)
                .filter(|key| !failed_keys.contains(key.as_str())),
        );

        let batch = BatchResult {
            source_type: source_type.to_string(),
            file_name: file_name.clone(),
            total_input_records: prepared.records_found,
            new_records: outcome.inserted,
            updated_records: outcome.updated,
            duplicates_removed: prepared.dedup.duplicates_removed,
            content_duplicates_removed: prepared.dedup.content_duplicates_removed,
            existing_filtered,
            rejected_records: prepared.rejected_records,
            failed_records: outcome.failed.len(),
            processing_time: prepared.prepare_time + started.elapsed(),
        };

        let fingerprints = &self.fingerprints;
        let file = &prepared.file;
        let found = batch.total_input_records as u64;
        let processed = batch.persisted() as u64;
        let secs = batch.processing_time.as_secs_f64();
        with_retry(&self.retry, "record_outcome", move || {
            fingerprints.record_outcome(file, found, processed, secs)
        })
        .await?;

        ctx.tracker.record_batch(&batch);
        ctx.files_processed += 1;
        if let Some(bar) = &self.progress {
            bar.inc(1);
            bar.set_message(format!("{} eta {}", source_type, ctx.tracker.eta()));
        }
        ctx.file_results.push(batch);

        Ok(())
    }

    async fn upsert_all(
        &self,
        source_type: &SourceType,
        records: &[RawRecord],
        registration: &SourceRegistration,
    ) -> IngestResult<UpsertOutcome> {
        let store = &self.store;
        let policy = &registration.strategy.merge;
        let mut total = UpsertOutcome::default();

        for chunk in records.chunks(self.config.upsert_batch_size) {
            let outcome = with_retry(&self.retry, "upsert_batch", move || {
                store.upsert_batch(source_type, chunk, policy)
            })
            .await?;
            total.absorb(outcome);
        }

        Ok(total)
    }
}

/// Why a parse group stopped early
enum GroupError {
    Cancelled,
    Failed(IngestError),
}

impl From<IngestError> for GroupError {
    fn from(e: IngestError) -> Self {
        GroupError::Failed(e)
    }
}
