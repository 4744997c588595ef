//! Pluggable format parsers and source registration
//!
//! Implement [`FormatParser`] for any on-disk format (JSON lines, CSV, XML
//! dumps, ...). The pipeline never branches on source type names: everything
//! it needs to know about a source lives in its [`SourceRegistration`].

use medref_common::types::SourceType;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::Arc;

use super::strategy::DeduplicationStrategy;
use super::types::FieldMap;
use crate::error::{IngestError, IngestResult};

/// A record the parser could read but not accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// Zero-based position of the record within its file
    pub index: usize,
    pub reason: String,
}

/// Output of parsing one file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutput {
    /// Accepted records in file order
    pub records: Vec<FieldMap>,
    pub rejected: Vec<RejectedRecord>,
}

impl ParseOutput {
    pub fn reject(&mut self, index: usize, reason: impl Into<String>) {
        self.rejected.push(RejectedRecord {
            index,
            reason: reason.into(),
        });
    }
}

/// Parser for one on-disk format
///
/// Parsing is CPU-bound and runs on the blocking thread pool, so the trait is
/// synchronous. The reader is already decompressed.
pub trait FormatParser: Send + Sync {
    /// Format identifier, e.g. `jsonl` or `csv`
    fn format(&self) -> &str;

    /// Parse every record in `reader`
    ///
    /// Malformed individual records go to [`ParseOutput::rejected`]; an `Err`
    /// means the file as a whole is unreadable.
    fn parse(&self, reader: &mut dyn BufRead) -> IngestResult<ParseOutput>;
}

/// Everything the pipeline needs to ingest one source type
#[derive(Clone)]
pub struct SourceRegistration {
    pub source_type: SourceType,
    pub parser: Arc<dyn FormatParser>,
    pub strategy: DeduplicationStrategy,
    /// Expected raw record total, used for completion percentage and ETA
    pub expected_records: Option<u64>,
}

impl std::fmt::Debug for SourceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistration")
            .field("source_type", &self.source_type)
            .field("format", &self.parser.format())
            .field("strategy", &self.strategy)
            .field("expected_records", &self.expected_records)
            .finish()
    }
}

impl SourceRegistration {
    pub fn new(
        source_type: SourceType,
        parser: Arc<dyn FormatParser>,
        strategy: DeduplicationStrategy,
    ) -> Self {
        Self {
            source_type,
            parser,
            strategy,
            expected_records: None,
        }
    }

    pub fn with_expected_records(mut self, expected: u64) -> Self {
        self.expected_records = Some(expected);
        self
    }

    pub fn validate(&self) -> IngestResult<()> {
        self.strategy.validate().map_err(|e| {
            IngestError::config(format!("source '{}': {}", self.source_type, e))
        })
    }
}

/// Registered sources keyed by source type
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<SourceType, Arc<SourceRegistration>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, validating its strategy; re-registering replaces it
    pub fn register(&mut self, registration: SourceRegistration) -> IngestResult<()> {
        registration.validate()?;
        self.sources
            .insert(registration.source_type.clone(), Arc::new(registration));
        Ok(())
    }

    pub fn get(&self, source_type: &SourceType) -> IngestResult<Arc<SourceRegistration>> {
        self.sources.get(source_type).cloned().ok_or_else(|| {
            IngestError::config(format!(
                "no parser or deduplication strategy registered for source '{}'",
                source_type
            ))
        })
    }

    pub fn source_types(&self) -> impl Iterator<Item = &SourceType> {
        self.sources.keys()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::formats::JsonLinesParser;

    fn registration(name: &str, identity: &[&str]) -> SourceRegistration {
        SourceRegistration::new(
            SourceType::new(name).unwrap(),
            Arc::new(JsonLinesParser),
            DeduplicationStrategy::new(identity.iter().copied()),
        )
    }

    #[test]
    fn test_missing_registration_is_configuration_error() {
        let registry = SourceRegistry::new();
        let err = registry
            .get(&SourceType::new("trial_registry").unwrap())
            .unwrap_err();
        assert!(matches!(err, IngestError::Configuration(_)));
    }

    #[test]
    fn test_register_rejects_invalid_strategy() {
        let mut registry = SourceRegistry::new();
        let err = registry.register(registration("pubmed", &[])).unwrap_err();
        assert!(err.to_string().contains("pubmed"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = SourceRegistry::new();
        registry.register(registration("pubmed", &["pmid"])).unwrap();
        let found = registry.get(&SourceType::new("pubmed").unwrap()).unwrap();
        assert_eq!(found.parser.format(), "jsonl");
        assert_eq!(registry.len(), 1);
    }
}
