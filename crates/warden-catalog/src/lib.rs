//! # Warden Catalogue
//!
//! Declarative attack-technique catalogue for the MCP Warden inspection
//! pipeline. Each technique is described by one on-disk descriptor
//! (`SAFE-T<number>.json`) carrying its identity, tactic, severity, and
//! detection configuration: pattern matchers, rule references, an optional
//! ML model reference, and optional behavioral feature checks.
//!
//! The catalogue is loaded once at startup, pre-compiling every regular
//! expression, and held behind an atomically swappable snapshot. In-flight
//! inspections keep the snapshot they started with; `reload()` installs a
//! new one without coordination.
//!
//! ## Failure model
//!
//! Descriptors that fail validation are rejected with a precise error and
//! recorded in the snapshot's rejection list. Startup proceeds with the
//! valid subset unless strict mode is on, in which case loading fails.

mod catalog;
mod error;
mod mitigation;
mod technique;

pub use catalog::{
    ApplicabilityProbe, Catalog, CatalogOptions, CatalogSnapshot, InspectionScope,
    RejectedDescriptor, ReloadReport,
};
pub use error::CatalogError;
pub use mitigation::{Mitigation, MitigationFile};
pub use technique::{
    BehavioralCheck, CompiledMatcher, DetectionSpec, MlModelRef, PatternKind, PatternMatcher,
    PatternSpec, Severity, Tactic, Technique, TechniqueSpec,
};

/// Result type for catalogue operations.
pub type Result<T> = std::result::Result<T, CatalogError>;
