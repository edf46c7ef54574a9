//! Error types for catalogue loading and validation.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating the technique catalogue.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Technique directory is missing or unreadable.
    #[error("technique directory not found: {0}")]
    MissingDirectory(PathBuf),

    /// Filesystem error while reading a descriptor.
    #[error("failed to read descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A descriptor failed JSON schema validation.
    #[error("failed to parse descriptor {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A required field is empty or missing.
    #[error("technique {technique_id}: missing required field '{field}'")]
    MissingField {
        technique_id: String,
        field: &'static str,
    },

    /// A declared pattern failed to compile.
    #[error("technique {technique_id}: invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        technique_id: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A pattern weight is outside [0, 1].
    #[error("technique {technique_id}: pattern weight {weight} outside [0, 1]")]
    InvalidWeight { technique_id: String, weight: f64 },

    /// Two descriptors declared the same technique id.
    #[error("duplicate technique id {technique_id} in {path}")]
    DuplicateId {
        technique_id: String,
        path: PathBuf,
    },

    /// Strict mode: at least one descriptor was rejected.
    #[error("strict mode: {rejected} descriptor(s) failed validation")]
    StrictValidation { rejected: usize },

    /// The mitigations file could not be loaded.
    #[error("failed to load mitigations from {path}: {reason}")]
    Mitigations { path: PathBuf, reason: String },
}
