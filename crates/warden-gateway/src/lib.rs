//! # Warden Gateway
//!
//! The MCP-facing surface of Warden: JSON-RPC 2.0 framing over
//! newline-delimited stdio, the connection state machine (handshake,
//! draining, cancellation), tool routing across multiplexed upstream
//! servers with conflict renaming, the per-request inspection
//! orchestration against `warden-core`, and the append-only audit sink.
//!
//! ## Per-request flow for `tools/call`
//!
//! ```text
//! parse ─► validate ─► route ─► inspect request ──► BLOCK? ─► -32004
//!                                    │ allow/warn
//!                                    ▼
//!                          forward to upstream (deadline)
//!                                    │
//!                                    ▼
//!                          inspect response ──► BLOCK? ─► sanitize body
//!                                    │
//!                                    ▼
//!                    taint marks + session graph + audit ─► deliver
//! ```

mod audit;
mod error;
mod gateway;
mod protocol;
mod router;
mod settings;
mod upstream;

pub use audit::{AuditRecord, AuditSink, AuditWriter, FinalStatus, JsonlWriter, TracingWriter};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayConfig, GatewayState};
pub use protocol::{codes, methods, response_text_view, JsonRpcMessage, RequestEnvelope, PROTOCOL_VERSION};
pub use router::{ToolRegistration, ToolRouter};
pub use settings::GatewaySettings;
pub use upstream::{
    StdioUpstream, UpstreamClient, UpstreamFile, UpstreamHandle, UpstreamManager,
    UpstreamServerConfig,
};

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
