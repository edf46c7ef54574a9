//! # Warden Session
//!
//! Per-session state for the MCP Warden pipeline:
//!
//! - **Call graphs** — each session owns a directed graph of tool calls;
//!   edges record data-flow dependencies between consecutive calls.
//! - **Behavioral analysis** — structural features, known multi-stage
//!   attack patterns, and attack-stage identification over a bounded
//!   snapshot of the graph.
//! - **Adaptive adjustment** — context-aware risk deltas from user role,
//!   trust, task context, behavioral priors, and time of day, with a
//!   false-positive feedback loop that can raise trust.
//!
//! Session mutation is serialized per session; analysis always runs on a
//! snapshot so the per-session lock is held only for insertion.

mod adaptive;
mod analyzer;
mod error;
mod graph;
mod store;

pub use adaptive::{
    AdaptiveDecision, AdaptiveEngine, EngineStats, TaskContext, TrustLevel, UserProfile, UserRole,
};
pub use analyzer::{BehavioralRisk, GraphAnalyzer, GraphFeatures};
pub use error::SessionError;
pub use graph::{infer_call_type, AttackStage, CallNode, CallType, EdgeKind, GraphSnapshot, SessionGraph};
pub use store::{SessionContext, SessionState, SessionStore};

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
