//! # Warden Analyzers
//!
//! The per-technique detection channels of the MCP Warden pipeline:
//!
//! - **Pattern analyzer** — pre-compiled regex and substring matchers from
//!   the catalogue, scored so one strong match dominates and further
//!   matches saturate quickly.
//! - **Rule engine** — structured validators referenced by logical name
//!   from technique descriptors. Pure functions from request text and
//!   arguments to a scored verdict with stable sub-check identifiers.
//! - **ML inference adapter** — lazily loaded, cached classifiers behind
//!   an `infer(model, text)` contract. Load failure is reported as channel
//!   unavailability, never as a clean verdict.
//! - **Obfuscation normalizer** — a bounded, deterministic set of
//!   deobfuscated variants of a string, fed back into the text channels.
//!
//! Every analyzer here is stateless with respect to requests and safe for
//! concurrent use; the dispatcher in `warden-core` owns scheduling.

mod error;
mod ml;
mod obfuscation;
mod pattern;
pub mod rules;

pub use error::AnalyzerError;
pub use ml::{Classification, Classifier, LexicalClassifier, MlEngine, MlOutcome, ModelProvider};
pub use obfuscation::{ObfuscationIndicators, ObfuscationReport, Normalizer, VariantSet};
pub use pattern::{PatternAnalyzer, PatternOutcome};
pub use rules::{RuleContext, RuleOutcome};

/// Result type for analyzer operations.
pub type Result<T> = std::result::Result<T, AnalyzerError>;
