//! Duplication-aware progress tracking
//!
//! Raw throughput and unique throughput diverge wildly when 99% of a dataset
//! is duplicated, so both are tracked. Rates are exponentially smoothed and
//! the ETA is reported as unknown whenever it cannot be meaningful.

use serde::{Serialize, Serializer};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::types::BatchResult;
use crate::error::{IngestError, IngestResult};

/// Weight of the previous smoothed rate
pub const RATE_SMOOTHING_PREVIOUS: f64 = 0.7;
/// Weight of the newest instantaneous rate
pub const RATE_SMOOTHING_CURRENT: f64 = 0.3;
/// ETAs beyond this are reported as unknown
pub const MAX_ETA: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Lifecycle of one ingestion run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Scanning,
    Parsing,
    Deduplicating,
    Persisting,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::NotStarted => "not_started",
            RunState::Scanning => "scanning",
            RunState::Parsing => "parsing",
            RunState::Deduplicating => "deduplicating",
            RunState::Persisting => "persisting",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }

        matches!(
            (self, next),
            (NotStarted, Scanning)
                | (Scanning, Parsing)
                | (Scanning, Completed)
                | (Parsing, Deduplicating)
                | (Deduplicating, Persisting)
                | (Persisting, Deduplicating)
                | (Persisting, Parsing)
                | (Persisting, Completed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimated time remaining
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eta {
    Known(Duration),
    Unknown,
}

impl Eta {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Eta::Known(d) => Some(*d),
            Eta::Unknown => None,
        }
    }
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Unknown => f.write_str("unknown"),
            Eta::Known(d) => {
                let secs = d.as_secs();
                write!(f, "{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
            },
        }
    }
}

/// Seconds as a number, or the string `"unknown"`
impl Serialize for Eta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Eta::Known(d) => serializer.serialize_f64(d.as_secs_f64()),
            Eta::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

/// Point-in-time view of a run's progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub source_type: String,
    pub state: RunState,
    pub files_total: usize,
    pub files_seen: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub raw_records_seen: u64,
    pub unique_records_persisted: u64,
    pub duplicates_removed: u64,
    pub existing_filtered: u64,
    pub expected_records: Option<u64>,
    /// Smoothed raw records per second
    pub raw_rate: Option<f64>,
    /// Smoothed persisted records per second
    pub unique_rate: Option<f64>,
    pub completion_percent: f64,
    pub projected_unique_total: Option<u64>,
    pub eta: Eta,
    pub elapsed_seconds: f64,
}

/// Progress of one source type's run
#[derive(Debug)]
pub struct ProgressTracker {
    source_type: String,
    state: RunState,
    expected_records: Option<u64>,
    files_total: usize,
    files_seen: usize,
    files_skipped: usize,
    files_failed: usize,
    raw_records_seen: u64,
    unique_records_persisted: u64,
    duplicates_removed: u64,
    existing_filtered: u64,
    raw_rate: Option<f64>,
    unique_rate: Option<f64>,
    started_at: Instant,
}

impl ProgressTracker {
    pub fn new(source_type: impl Into<String>, expected_records: Option<u64>) -> Self {
        Self {
            source_type: source_type.into(),
            state: RunState::NotStarted,
            expected_records,
            files_total: 0,
            files_seen: 0,
            files_skipped: 0,
            files_failed: 0,
            raw_records_seen: 0,
            unique_records_persisted: 0,
            duplicates_removed: 0,
            existing_filtered: 0,
            raw_rate: None,
            unique_rate: None,
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn transition(&mut self, next: RunState) -> IngestResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        debug!(source_type = %self.source_type, from = %self.state, to = %next, "Run state changed");
        self.state = next;
        Ok(())
    }

    pub fn set_total_files(&mut self, total: usize) {
        self.files_total = total;
    }

    /// Count unchanged files skipped by the fingerprint check
    pub fn record_skipped(&mut self, count: usize) {
        self.files_skipped += count;
        self.files_seen += count;
    }

    pub fn record_file_failed(&mut self) {
        self.files_failed += 1;
        self.files_seen += 1;
    }

    /// Fold in one processed file
    pub fn record_batch(&mut self, batch: &BatchResult) {
        self.files_seen += 1;
        self.raw_records_seen += batch.total_input_records as u64;
        self.unique_records_persisted += batch.persisted() as u64;
        self.duplicates_removed +=
            (batch.duplicates_removed + batch.content_duplicates_removed) as u64;
        self.existing_filtered += batch.existing_filtered as u64;

        let secs = batch.processing_time.as_secs_f64();
        if secs > 0.0 {
            self.raw_rate = Some(smooth(self.raw_rate, batch.total_input_records as f64 / secs));
            self.unique_rate = Some(smooth(self.unique_rate, batch.persisted() as f64 / secs));
        }

        info!(
            source_type = %self.source_type,
            file = %batch.file_name,
            files_seen = self.files_seen,
            files_total = self.files_total,
            raw_records = self.raw_records_seen,
            unique_records = self.unique_records_persisted,
            eta = %self.eta(),
            "Progress"
        );
    }

    pub fn completion_percent(&self) -> f64 {
        let fraction = match self.expected_records {
            Some(expected) if expected > 0 => self.raw_records_seen as f64 / expected as f64,
            _ if self.files_total > 0 => self.files_seen as f64 / self.files_total as f64,
            _ => 0.0,
        };
        (fraction * 100.0).clamp(0.0, 100.0)
    }

    /// Expected unique total extrapolated from the unique/raw ratio so far
    pub fn projected_unique_total(&self) -> Option<u64> {
        let expected = self.expected_records?;
        if self.raw_records_seen == 0 {
            return None;
        }
        let ratio = self.unique_records_persisted as f64 / self.raw_records_seen as f64;
        Some((expected as f64 * ratio).round() as u64)
    }

    pub fn eta(&self) -> Eta {
        let Some(expected) = self.expected_records else {
            return Eta::Unknown;
        };
        let remaining = expected.saturating_sub(self.raw_records_seen);
        if remaining == 0 {
            return Eta::Known(Duration::ZERO);
        }
        estimate_eta(remaining, self.raw_rate.unwrap_or(0.0))
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            source_type: self.source_type.clone(),
            state: self.state,
            files_total: self.files_total,
            files_seen: self.files_seen,
            files_skipped: self.files_skipped,
            files_failed: self.files_failed,
            raw_records_seen: self.raw_records_seen,
            unique_records_persisted: self.unique_records_persisted,
            duplicates_removed: self.duplicates_removed,
            existing_filtered: self.existing_filtered,
            expected_records: self.expected_records,
            raw_rate: self.raw_rate,
            unique_rate: self.unique_rate,
            completion_percent: self.completion_percent(),
            projected_unique_total: self.projected_unique_total(),
            eta: self.eta(),
            elapsed_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

fn smooth(previous: Option<f64>, instant: f64) -> f64 {
    match previous {
        Some(prev) => RATE_SMOOTHING_PREVIOUS * prev + RATE_SMOOTHING_CURRENT * instant,
        None => instant,
    }
}

/// `remaining / rate`, or unknown when the rate is unusable or the result absurd
pub fn estimate_eta(remaining: u64, rate: f64) -> Eta {
    if remaining == 0 {
        return Eta::Known(Duration::ZERO);
    }
    if !rate.is_finite() || rate <= 0.0 {
        return Eta::Unknown;
    }

    let secs = remaining as f64 / rate;
    if !secs.is_finite() || secs > MAX_ETA.as_secs_f64() {
        return Eta::Unknown;
    }

    Duration::try_from_secs_f64(secs)
        .map(Eta::Known)
        .unwrap_or(Eta::Unknown)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn batch(input: usize, persisted: usize, secs: f64) -> BatchResult {
        BatchResult {
            file_name: "f".to_string(),
            total_input_records: input,
            new_records: persisted,
            duplicates_removed: input - persisted,
            processing_time: Duration::from_secs_f64(secs),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_sample_seeds_rate_then_smooths() {
        let mut tracker = ProgressTracker::new("pubmed", Some(10_000));
        tracker.record_batch(&batch(1000, 10, 1.0));
        assert_eq!(tracker.snapshot().raw_rate, Some(1000.0));

        tracker.record_batch(&batch(2000, 10, 1.0));
        let rate = tracker.snapshot().raw_rate.unwrap();
        assert!((rate - (0.7 * 1000.0 + 0.3 * 2000.0)).abs() < 1e-9);
    }

    #[test]
    fn test_zero_duration_batch_keeps_rate() {
        let mut tracker = ProgressTracker::new("pubmed", Some(10_000));
        tracker.record_batch(&batch(100, 1, 0.0));
        assert_eq!(tracker.snapshot().raw_rate, None);
        assert_eq!(tracker.eta(), Eta::Unknown);
    }

    #[test]
    fn test_eta_sanity() {
        assert_eq!(estimate_eta(100, 0.0), Eta::Unknown);
        assert_eq!(estimate_eta(100, -3.0), Eta::Unknown);
        assert_eq!(estimate_eta(100, f64::NAN), Eta::Unknown);
        assert_eq!(estimate_eta(u64::MAX, 1e-6), Eta::Unknown);
        assert_eq!(estimate_eta(0, 0.0), Eta::Known(Duration::ZERO));
        assert_eq!(estimate_eta(100, 10.0), Eta::Known(Duration::from_secs(10)));

        // One record every ~3 years
        let slow = 1.0 / (3.0 * MAX_ETA.as_secs_f64());
        assert_eq!(estimate_eta(1, slow), Eta::Unknown);
    }

    #[test]
    fn test_eta_uses_raw_rate_not_unique_rate() {
        let mut tracker = ProgressTracker::new("labels", Some(11_000));
        tracker.record_batch(&batch(1000, 1, 1.0));

        assert_eq!(tracker.eta(), Eta::Known(Duration::from_secs(10)));
        assert_eq!(tracker.projected_unique_total(), Some(11));
        assert!((tracker.completion_percent() - 100.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_eta_unknown_without_expected_total() {
        let mut tracker = ProgressTracker::new("labels", None);
        tracker.set_total_files(4);
        tracker.record_batch(&batch(1000, 1, 1.0));
        tracker.record_skipped(1);
        assert_eq!(tracker.eta(), Eta::Unknown);
        assert_eq!(tracker.completion_percent(), 50.0);
    }

    #[test]
    fn test_state_machine() {
        let mut tracker = ProgressTracker::new("labels", None);
        assert!(tracker.transition(RunState::Parsing).is_err());

        for state in [
            RunState::Scanning,
            RunState::Parsing,
            RunState::Deduplicating,
            RunState::Persisting,
            RunState::Deduplicating,
            RunState::Persisting,
            RunState::Parsing,
            RunState::Deduplicating,
            RunState::Persisting,
            RunState::Completed,
        ] {
            tracker.transition(state).unwrap();
        }

        let err = tracker.transition(RunState::Failed).unwrap_err();
        assert!(matches!(err, IngestError::InvalidTransition { .. }));
    }

    #[test]
    fn test_scanning_can_complete_and_anything_can_fail() {
        assert!(RunState::Scanning.can_transition_to(RunState::Completed));
        assert!(!RunState::Parsing.can_transition_to(RunState::Completed));
        assert!(RunState::NotStarted.can_transition_to(RunState::Failed));
        assert!(RunState::Deduplicating.can_transition_to(RunState::Cancelled));
        assert!(!RunState::Failed.can_transition_to(RunState::Scanning));
    }

    #[test]
    fn test_eta_serializes_unknown() {
        assert_eq!(serde_json::to_value(Eta::Unknown).unwrap(), "unknown");
        assert_eq!(
            serde_json::to_value(Eta::Known(Duration::from_millis(2500))).unwrap(),
            2.5
        );
        assert_eq!(Eta::Known(Duration::from_secs(3725)).to_string(), "1h02m05s");
    }
}
