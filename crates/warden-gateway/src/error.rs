//! Error types for the gateway.

use thiserror::Error;

/// Errors raised by the gateway and its upstream adapters.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A frame was not valid JSON.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A frame violated the JSON-RPC 2.0 shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An upstream server process could not be started.
    #[error("failed to spawn upstream '{name}': {source}")]
    UpstreamSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O with an upstream server failed.
    #[error("upstream '{name}' I/O error: {reason}")]
    UpstreamIo { name: String, reason: String },

    /// An upstream call exceeded its deadline.
    #[error("upstream '{name}' timed out")]
    UpstreamTimeout { name: String },

    /// The upstream closed its side of the transport.
    #[error("upstream '{name}' closed the connection")]
    UpstreamClosed { name: String },

    /// The upstream answered with a JSON-RPC error.
    #[error("upstream error {code}: {message}")]
    UpstreamRpc { code: i64, message: String },

    /// Gateway configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Core pipeline failure.
    #[error(transparent)]
    Core(#[from] warden_core::CoreError),
}
