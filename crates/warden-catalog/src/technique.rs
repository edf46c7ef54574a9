//! Technique data model and descriptor schema.
//!
//! A [`TechniqueSpec`] is the serde image of one on-disk descriptor; a
//! [`Technique`] is the compiled, immutable form the pipeline works with.
//! Compilation happens exactly once at load time so that request handling
//! never touches the regex compiler.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Intent category of a technique, mirroring the SAFE-MCP tactic taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tactic {
    #[serde(rename = "Initial Access")]
    InitialAccess,
    Execution,
    Persistence,
    #[serde(rename = "Privilege Escalation")]
    PrivilegeEscalation,
    #[serde(rename = "Defense Evasion")]
    DefenseEvasion,
    #[serde(rename = "Credential Access")]
    CredentialAccess,
    Discovery,
    #[serde(rename = "Lateral Movement")]
    LateralMovement,
    Collection,
    #[serde(rename = "Command and Control")]
    CommandAndControl,
    Exfiltration,
    Impact,
    #[serde(rename = "Resource Development")]
    ResourceDevelopment,
    Reconnaissance,
}

impl std::fmt::Display for Tactic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InitialAccess => "Initial Access",
            Self::Execution => "Execution",
            Self::Persistence => "Persistence",
            Self::PrivilegeEscalation => "Privilege Escalation",
            Self::DefenseEvasion => "Defense Evasion",
            Self::CredentialAccess => "Credential Access",
            Self::Discovery => "Discovery",
            Self::LateralMovement => "Lateral Movement",
            Self::Collection => "Collection",
            Self::CommandAndControl => "Command and Control",
            Self::Exfiltration => "Exfiltration",
            Self::Impact => "Impact",
            Self::ResourceDevelopment => "Resource Development",
            Self::Reconnaissance => "Reconnaissance",
        };
        write!(f, "{}", name)
    }
}

/// Severity of a technique when it matches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{}", name)
    }
}

/// Kind of a declarative pattern matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Regex,
    Substring,
}

/// One pattern matcher as declared in a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSpec {
    /// Matcher kind.
    #[serde(rename = "type")]
    pub kind: PatternKind,
    /// The regex source or substring literal.
    pub pattern: String,
    /// Whether matching respects case. Defaults to insensitive.
    #[serde(default)]
    pub case_sensitive: bool,
    /// Contribution weight in [0, 1].
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Reference to an ML classifier for one technique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlModelRef {
    /// Logical model name resolved by the inference adapter.
    pub name: String,
    /// Confidence threshold for a positive classification.
    #[serde(default = "default_ml_threshold")]
    pub threshold: f64,
    /// Channel weight for the weighted combiner.
    #[serde(default = "default_ml_weight")]
    pub weight: f64,
}

fn default_ml_threshold() -> f64 {
    0.75
}

fn default_ml_weight() -> f64 {
    0.10
}

/// One behavioral feature check: fires when the named session-graph
/// feature reaches the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralCheck {
    /// Feature name (e.g. `stage_count`, `pattern_matches`, `chain_length`).
    pub feature: String,
    /// Inclusive trigger threshold.
    pub threshold: f64,
}

/// Detection configuration for one technique.
///
/// All channels are optional; a technique with an empty configuration loads
/// but can never match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionSpec {
    /// Pattern matchers, evaluated in definition order.
    #[serde(default)]
    pub patterns: Vec<PatternSpec>,
    /// Logical rule names resolved by the rule engine.
    #[serde(default)]
    pub rules: Vec<String>,
    /// Optional ML classifier reference.
    #[serde(default)]
    pub ml_model: Option<MlModelRef>,
    /// Optional behavioral feature checks.
    #[serde(default)]
    pub behavioral: Option<Vec<BehavioralCheck>>,
}

impl DetectionSpec {
    /// Returns true if no channel is configured at all.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
            && self.rules.is_empty()
            && self.ml_model.is_none()
            && self.behavioral.is_none()
    }
}

/// The serde image of one `SAFE-T<number>.json` descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechniqueSpec {
    /// Stable identifier, e.g. `SAFE-T1102`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Intent category.
    pub tactic: Tactic,
    /// Severity when matched.
    pub severity: Severity,
    /// Whether the technique participates in dispatch.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Linked mitigation identifiers, in recommendation order.
    #[serde(default)]
    pub mitigations: Vec<String>,
    /// Detection configuration.
    #[serde(default)]
    pub detection: DetectionSpec,
}

fn default_enabled() -> bool {
    true
}

/// A pattern matcher with its compiled form.
#[derive(Debug)]
pub struct PatternMatcher {
    /// The declared spec, kept for evidence strings and serialization.
    pub spec: PatternSpec,
    /// Compiled matcher.
    pub compiled: CompiledMatcher,
}

/// Compiled form of a [`PatternSpec`].
#[derive(Debug)]
pub enum CompiledMatcher {
    /// Pre-compiled regular expression.
    Regex(Regex),
    /// Substring needle; lowercased at compile time when case-insensitive.
    Substring { needle: String, case_sensitive: bool },
}

impl PatternMatcher {
    fn compile(spec: PatternSpec, technique_id: &str) -> Result<Self, CatalogError> {
        let compiled = match spec.kind {
            PatternKind::Regex => {
                let regex = RegexBuilder::new(&spec.pattern)
                    .case_insensitive(!spec.case_sensitive)
                    .size_limit(1 << 20)
                    .build()
                    .map_err(|source| CatalogError::InvalidPattern {
                        technique_id: technique_id.to_string(),
                        pattern: spec.pattern.clone(),
                        source,
                    })?;
                CompiledMatcher::Regex(regex)
            }
            PatternKind::Substring => {
                let needle = if spec.case_sensitive {
                    spec.pattern.clone()
                } else {
                    spec.pattern.to_lowercase()
                };
                CompiledMatcher::Substring {
                    needle,
                    case_sensitive: spec.case_sensitive,
                }
            }
        };
        Ok(Self { spec, compiled })
    }

    /// Tests this matcher against `text`.
    pub fn is_match(&self, text: &str) -> bool {
        match &self.compiled {
            CompiledMatcher::Regex(regex) => regex.is_match(text),
            CompiledMatcher::Substring {
                needle,
                case_sensitive,
            } => {
                if *case_sensitive {
                    text.contains(needle.as_str())
                } else {
                    text.to_lowercase().contains(needle.as_str())
                }
            }
        }
    }

    /// The declared literal, truncated to a length safe for evidence strings.
    pub fn evidence_literal(&self) -> &str {
        const MAX: usize = 64;
        let pattern = self.spec.pattern.as_str();
        match pattern.char_indices().nth(MAX) {
            Some((idx, _)) => &pattern[..idx],
            None => pattern,
        }
    }
}

/// A fully compiled, immutable technique.
///
/// Never mutated during request handling; reload builds a fresh set.
#[derive(Debug)]
pub struct Technique {
    /// The declared descriptor.
    pub spec: TechniqueSpec,
    /// Compiled pattern matchers in definition order.
    pub matchers: Vec<PatternMatcher>,
}

impl Technique {
    /// Compiles a descriptor into its runtime form.
    pub fn compile(spec: TechniqueSpec) -> Result<Self, CatalogError> {
        if spec.id.is_empty() {
            return Err(CatalogError::MissingField {
                technique_id: "<unknown>".to_string(),
                field: "id",
            });
        }
        if spec.name.is_empty() {
            return Err(CatalogError::MissingField {
                technique_id: spec.id.clone(),
                field: "name",
            });
        }
        for pattern in &spec.detection.patterns {
            if !(0.0..=1.0).contains(&pattern.weight) {
                return Err(CatalogError::InvalidWeight {
                    technique_id: spec.id.clone(),
                    weight: pattern.weight,
                });
            }
        }

        let matchers = spec
            .detection
            .patterns
            .iter()
            .cloned()
            .map(|pattern| PatternMatcher::compile(pattern, &spec.id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { spec, matchers })
    }

    /// Stable identifier.
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// True if any rule reference names the given logical rule.
    pub fn has_rule(&self, name: &str) -> bool {
        self.spec.rules().iter().any(|rule| rule == name)
    }
}

impl TechniqueSpec {
    /// Rule references configured for this technique.
    pub fn rules(&self) -> &[String] {
        &self.detection.rules
    }
}
