//! # Warden Flow
//!
//! The two enforcement layers that bracket the detection channels:
//!
//! - **Isolation policy gate** — a pre-execution filter over `(tool name,
//!   arguments)`: capability grants, path allow/deny prefixes, network
//!   allow-lists, and resource bounds. A rejection short-circuits the
//!   pipeline before any analyzer runs.
//! - **Taint tracker** — post-execution information-flow control: data
//!   from sensitive sources is fingerprinted and tracked through tool
//!   calls, and flows to forbidden sinks are denied even when no detection
//!   technique fires on the request in isolation.
//!
//! Together these provide the defense-in-depth property: detection can
//! miss, the gate and the flow policy still hold.

mod error;
mod isolation;
mod taint;

pub use error::FlowError;
pub use isolation::{
    GateDecision, IsolationPolicy, PolicyGate, PolicyViolation, ToolCapability,
};
pub use taint::{
    FlowCheck, FlowTracker, FlowViolation, SinkKind, TaintLevel, TaintSource, ViolationSummary,
};

/// Result type for flow-control operations.
pub type Result<T> = std::result::Result<T, FlowError>;
