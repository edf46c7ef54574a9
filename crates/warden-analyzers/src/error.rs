//! Error types for the detection channels.

use thiserror::Error;

/// Errors raised by analyzer channels.
///
/// Channel failures never fail a request: the dispatcher converts them
/// into channel-unavailable markers and the aggregator proceeds with the
/// channels that did answer.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// A technique referenced a rule name the engine does not provide.
    #[error("unknown rule '{0}'")]
    UnknownRule(String),

    /// A technique referenced a model the provider cannot load.
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// Model loading failed.
    #[error("failed to load model '{name}': {reason}")]
    ModelLoad { name: String, reason: String },
}
