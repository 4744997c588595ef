//! Run-scoped error collection
//!
//! Every error is counted under its category. Detailed entries are kept up to
//! a per-category cap so that a file with a million bad rows cannot blow up
//! the run report.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::{ErrorCategory, IngestError};

pub const DEFAULT_MAX_DETAILS_PER_CATEGORY: usize = 100;

/// One recorded error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_key: Option<String>,
    pub message: String,
}

/// Error section of the run report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    pub total: u64,
    pub counts: BTreeMap<ErrorCategory, u64>,
    pub details: BTreeMap<ErrorCategory, Vec<ErrorDetail>>,
}

impl ErrorSummary {
    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[derive(Debug, Clone)]
pub struct ErrorCollector {
    max_details_per_category: usize,
    summary: ErrorSummary,
}

impl Default for ErrorCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DETAILS_PER_CATEGORY)
    }
}

impl ErrorCollector {
    pub fn new(max_details_per_category: usize) -> Self {
        Self {
            max_details_per_category,
            summary: ErrorSummary::default(),
        }
    }

    /// Record an error, filling in the file and record key it carries itself
    pub fn record(&mut self, error: &IngestError, file: Option<&str>, record_key: Option<&str>) {
        let (file, record_key) = match error {
            IngestError::Parsing { file: own_file, .. } => (file.or(Some(own_file.as_str())), record_key),
            IngestError::StoreIntegrity { key, .. } => (file, record_key.or(key.as_deref())),
            _ => (file, record_key),
        };

        self.record_message(error.category(), file, record_key, error.to_string());
    }

    pub fn record_message(
        &mut self,
        category: ErrorCategory,
        file: Option<&str>,
        record_key: Option<&str>,
        message: impl Into<String>,
    ) {
        let message = message.into();

        if category == ErrorCategory::Validation {
            debug!(category = %category, file, record_key, message = %message, "Recorded error");
        } else {
            warn!(category = %category, file, record_key, message = %message, "Recorded error");
        }

        self.summary.total += 1;
        *self.summary.counts.entry(category).or_insert(0) += 1;

        let details = self.summary.details.entry(category).or_default();
        if details.len() < self.max_details_per_category {
            details.push(ErrorDetail {
                file: file.map(str::to_string),
                record_key: record_key.map(str::to_string),
                message,
            });
        }
    }

    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.summary.count(category)
    }

    pub fn total(&self) -> u64 {
        self.summary.total
    }

    pub fn summary(&self) -> ErrorSummary {
        self.summary.clone()
    }
}
