//! Configuration management
//!
//! Settings come from an optional TOML file overlaid with `MEDREF__`-prefixed
//! environment variables, e.g. `MEDREF__PIPELINE__MAX_WORKERS=4` or
//! `MEDREF__DATABASE__URL=sqlite:///var/lib/medref/medref.db`.
//!
//! Keys are case-insensitive and stored lowercase, so field names used in
//! strategies (identity fields, merge rules) should be lowercase too.

use anyhow::Context;
use medref_common::logging::LogConfig;
use medref_common::types::SourceType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::db::DbConfig;
use crate::error::{IngestError, IngestResult};
use crate::formats::parser_for;
use crate::framework::parser::{SourceRegistration, SourceRegistry};
use crate::framework::pipeline::PipelineConfig;
use crate::framework::retry::RetryPolicy;
use crate::framework::strategy::DeduplicationStrategy;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "MEDREF";

/// Separator between nested keys in environment variable names.
pub const ENV_SEPARATOR: &str = "__";

/// Config file looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "medref.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub logging: LogConfig,
    pub database: DbConfig,
    pub pipeline: PipelineConfig,
    pub retry: RetryPolicy,
    pub progress: ProgressConfig,
    pub sources: BTreeMap<String, SourceConfig>,
}

/// Progress display settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Draw a progress bar on stderr during `run`
    pub show_bar: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { show_bar: true }
    }
}

/// One source type's input and deduplication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Built-in parser: `jsonl`, `csv` or `tsv`
    pub format: String,
    pub directory: PathBuf,
    /// File name suffixes to include, e.g. `["jsonl", "jsonl.gz"]`; empty means all
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub expected_records: Option<u64>,
    pub strategy: DeduplicationStrategy,
}

impl IngestConfig {
    /// Load from `path` (or `medref.toml` if present) plus environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            },
            None => {
                builder = builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false));
            },
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: IngestConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IngestResult<()> {
        self.database.validate()?;
        self.pipeline.validate()?;
        self.retry.validate()?;

        for (name, source) in &self.sources {
            SourceType::new(name.as_str())?;
            parser_for(&source.format)?;
            source
                .strategy
                .validate()
                .map_err(|e| IngestError::config(format!("source '{}': {}", name, e)))?;
        }

        Ok(())
    }

    pub fn source(&self, name: &str) -> IngestResult<&SourceConfig> {
        self.sources
            .get(name)
            .ok_or_else(|| IngestError::config(format!("source '{}' is not configured", name)))
    }

    /// Register every configured source with its built-in parser
    pub fn build_registry(&self) -> IngestResult<SourceRegistry> {
        let mut registry = SourceRegistry::new();

        for (name, source) in &self.sources {
            let mut registration = SourceRegistration::new(
                SourceType::new(name.as_str())?,
                parser_for(&source.format)?,
                source.strategy.clone(),
            );
            if let Some(expected) = source.expected_records {
                registration = registration.with_expected_records(expected);
            }
            registry.register(registration)?;
        }

        Ok(registry)
    }
}
