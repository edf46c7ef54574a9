//! # Warden Core
//!
//! The unified inspection pipeline for MCP Warden. This crate composes
//! the leaf components into one facade and owns the two hardest pieces of
//! the pipeline:
//!
//! - the **technique dispatcher**, which fans one request out across the
//!   detection channels of every applicable technique under a per-request
//!   concurrency cap and wall-clock budget, and
//! - the **risk aggregator**, which folds per-technique verdicts, the
//!   isolation pre-gate, the flow post-check, and the adaptive adjustment
//!   into one deterministic allow / warn / block decision.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          Warden                               │
//! ├───────────────────────────────────────────────────────────────┤
//! │  isolation gate ──► normalizer ──► dispatcher ──► aggregator  │
//! │   (pre-filter)      (variants)    ┌──────────┐   (decision)   │
//! │                                   │ pattern  │                │
//! │                                   │ rule     │       │        │
//! │                                   │ ml       │       ▼        │
//! │                                   │ behavior │    adaptive    │
//! │                                   └──────────┘   adjustment   │
//! │  taint tracker ◄── response/outcome bookkeeping ◄─────┘       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pipeline is fail-open per channel and fail-closed per policy:
//! a broken channel degrades to "unavailable", a policy violation always
//! blocks.

mod aggregate;
mod config;
mod dispatch;
mod error;
mod verdict;
mod warden;

pub use aggregate::Aggregator;
pub use config::{ChannelWeights, CombinerMode, CoreConfig};
pub use warden::{InspectionOutcome, Warden};
pub use dispatch::{Dispatcher, InspectionRequest};
pub use error::CoreError;
pub use verdict::{AggregateVerdict, Channel, Decision, RiskLevel, TechniqueVerdict};

// Re-export the component types callers interact with.
pub use warden_catalog::{Catalog, CatalogOptions, InspectionScope, Severity, Tactic};
pub use warden_flow::{FlowTracker, IsolationPolicy, PolicyGate, SinkKind, TaintLevel};
pub use warden_session::{
    AdaptiveEngine, BehavioralRisk, GraphAnalyzer, SessionStore, TaskContext, TrustLevel, UserRole,
};

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
