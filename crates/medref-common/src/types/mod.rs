//! Common types used across medref

use crate::error::{MedrefError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of a data source feed, e.g. `drug_labels` or `trial_registry`.
///
/// Source types are lowercase slugs made of ASCII letters, digits, `_` and `-`.
/// They key fingerprints and stored records, so they are validated once at the
/// edge instead of being compared as free-form strings everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceType(String);

impl SourceType {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into().trim().to_lowercase();
        let valid = !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

        if valid {
            Ok(Self(name))
        } else {
            Err(MedrefError::InvalidSourceType(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SourceType {
    type Err = MedrefError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for SourceType {
    type Error = MedrefError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SourceType> for String {
    fn from(value: SourceType) -> Self {
        value.0
    }
}

impl AsRef<str> for SourceType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_normalizes() {
        let st = SourceType::new("  Drug_Labels ").unwrap();
        assert_eq!(st.as_str(), "drug_labels");
        assert_eq!(st.to_string(), "drug_labels");
    }

    #[test]
    fn test_source_type_rejects_invalid() {
        assert!(SourceType::new("").is_err());
        assert!(SourceType::new("drug labels").is_err());
        assert!(SourceType::new("../etc").is_err());
    }

    #[test]
    fn test_source_type_serde() {
        let st: SourceType = serde_json::from_str("\"pubmed\"").unwrap();
        assert_eq!(st.as_str(), "pubmed");
        assert!(serde_json::from_str::<SourceType>("\"bad name\"").is_err());
    }
}
