//! Error types for flow control.

use thiserror::Error;

/// Errors raised by the flow-control layers.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A taint-level update would have decreased an effective level.
    ///
    /// Taint is monotonically non-decreasing; hitting this is a bug in the
    /// caller, reported upward so the single request can be failed without
    /// corrupting tracker state.
    #[error("taint level for {fingerprint} would decrease from {current} to {proposed}")]
    TaintRegression {
        fingerprint: String,
        current: String,
        proposed: String,
    },
}
