//! # Configuration
//!
//! Per-instance knobs for a [`crate::corpus::Corpus`], loadable from TOML.
//!
//! Configuration narrows runtime behavior but can never exceed the hard
//! bounds in [`crate::primitives`]: depths are clamped on construction.

use crate::primitives::{DEFAULT_QUERY_LIMIT, DEFAULT_TRAVERSAL_DEPTH, MAX_TRAVERSAL_DEPTH};
use crate::types::CorpusError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime configuration for a corpus instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Depth used by traversal wrappers when the caller gives none.
    pub default_traversal_depth: usize,
    /// Page size used by query wrappers when the caller gives none.
    pub default_query_limit: usize,
    /// Whether relation creation materializes missing endpoint entities.
    /// When off, a missing endpoint fails the call instead.
    pub auto_create_endpoints: bool,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            default_traversal_depth: DEFAULT_TRAVERSAL_DEPTH,
            default_query_limit: DEFAULT_QUERY_LIMIT,
            auto_create_endpoints: true,
        }
    }
}

impl CorpusConfig {
    /// Parse a TOML document. Unknown keys are ignored; missing keys take
    /// their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, CorpusError> {
        let config: Self = toml::from_str(raw)
            .map_err(|error| CorpusError::Validation(format!("config parse failed: {error}")))?;
        Ok(config.clamped())
    }

    /// Load a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CorpusError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|error| CorpusError::Io(error.to_string()))?;
        Self::from_toml_str(&raw)
    }

    /// Enforce the hard bounds from `primitives`.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.default_traversal_depth = self
            .default_traversal_depth
            .clamp(1, MAX_TRAVERSAL_DEPTH);
        self.default_query_limit = self.default_query_limit.max(1);
        self
    }
}

// =============================================================================
// TESTS
// =============================================================================
