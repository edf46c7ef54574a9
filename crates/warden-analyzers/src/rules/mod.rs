//! Rule channel: structured per-technique validators.
//!
//! Rules are referenced by logical name from technique descriptors. Each
//! rule is a pure, deterministic function from `(text_view, arguments,
//! context)` to a scored verdict; every sub-check that fires contributes a
//! weight to the running risk and a stable `rule_id` string so audit
//! records can report exactly which sub-checks triggered.
//!
//! Both built-in families trigger when the accumulated risk reaches 0.7.

mod path_traversal;
mod prompt_injection;

use serde_json::{Map, Value};

pub use path_traversal::validate_file_path;
pub use prompt_injection::validate_instruction_text;

/// Trigger threshold shared by the built-in rule families.
pub(crate) const TRIGGER_THRESHOLD: f64 = 0.7;

/// Ambient context handed to rule validators.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleContext<'a> {
    /// Routed tool name, if the request is a tool call.
    pub tool_name: Option<&'a str>,
}

/// Result of one rule evaluation.
#[derive(Debug, Clone, Default)]
pub struct RuleOutcome {
    /// True when the accumulated risk reached the trigger threshold.
    pub triggered: bool,
    /// Accumulated risk, capped at 1.0.
    pub confidence: f64,
    /// Stable identifiers of the sub-checks that fired.
    pub rule_ids: Vec<&'static str>,
    /// Human-readable reasons, one per fired sub-check.
    pub reasons: Vec<String>,
}

impl RuleOutcome {
    pub(crate) fn record(&mut self, rule_id: &'static str, weight: f64, reason: String) {
        self.confidence += weight;
        if !self.rule_ids.contains(&rule_id) {
            self.rule_ids.push(rule_id);
        }
        self.reasons.push(reason);
    }

    pub(crate) fn finish(mut self) -> Self {
        self.confidence = self.confidence.min(1.0);
        self.triggered = self.confidence >= TRIGGER_THRESHOLD;
        self
    }

    /// Merges another outcome, keeping the maximum risk.
    ///
    /// Used when a rule evaluates several candidate values (e.g. multiple
    /// path arguments) and the worst one decides.
    pub(crate) fn max(self, other: Self) -> Self {
        if other.confidence > self.confidence {
            other
        } else {
            self
        }
    }
}

/// Resolves a logical rule name and runs it.
///
/// Returns `None` for an unknown name; the dispatcher reports that as a
/// channel-unavailable marker rather than failing the request.
pub fn evaluate(
    name: &str,
    text_view: &str,
    arguments: &Map<String, Value>,
    context: &RuleContext<'_>,
) -> Option<RuleOutcome> {
    match name {
        "prompt_injection" => Some(validate_instruction_text(text_view, context)),
        "path_traversal" => Some(validate_file_path(text_view, arguments, context)),
        _ => None,
    }
}

/// Argument keys treated as filesystem paths across the pipeline.
pub(crate) const PATH_ARGUMENT_KEYS: &[&str] =
    &["path", "file", "filename", "directory", "dir", "filepath"];

/// Collects the path-shaped argument values of a request.
pub(crate) fn path_arguments(arguments: &Map<String, Value>) -> Vec<&str> {
    PATH_ARGUMENT_KEYS
        .iter()
        .filter_map(|key| arguments.get(*key))
        .filter_map(|value| value.as_str())
        .collect()
}
