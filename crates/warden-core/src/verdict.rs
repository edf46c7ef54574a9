//! Verdict types for the inspection pipeline.

use serde::{Deserialize, Serialize};
use warden_catalog::{Severity, Tactic};

/// Final decision for one inspected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Warn,
    Block,
}

impl Decision {
    /// True for a blocking decision.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block)
    }
}

/// Risk level of an aggregate verdict.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl From<Severity> for RiskLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low => Self::Low,
            Severity::Medium => Self::Medium,
            Severity::High => Self::High,
            Severity::Critical => Self::Critical,
        }
    }
}

/// One analysis lane within the detection pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Pattern,
    Rule,
    Ml,
    Behavioral,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pattern => "pattern",
            Self::Rule => "rule",
            Self::Ml => "ml",
            Self::Behavioral => "behavioral",
        };
        write!(f, "{}", name)
    }
}

/// Verdict for one (request, technique) pair, compressed across channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechniqueVerdict {
    pub technique_id: String,
    pub technique_name: String,
    pub tactic: Tactic,
    pub severity: Severity,
    pub matched: bool,
    /// Maximum confidence among the channels that matched.
    pub confidence: f64,
    /// The channel that produced the maximum, when matched.
    pub method: Option<Channel>,
    /// Evidence concatenated channel by channel, order preserved.
    pub evidence: Vec<String>,
}

/// The aggregate verdict for one inspected message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateVerdict {
    pub decision: Decision,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    /// Techniques that matched, most severe first.
    pub matched_techniques: Vec<TechniqueVerdict>,
    /// Adaptive deltas applied, as tagged strings.
    pub adjustments: Vec<String>,
    /// All evidence, in pipeline order.
    pub evidence: Vec<String>,
    /// Policy violations (isolation gate or flow tracker), if any.
    pub violations: Vec<String>,
    /// Recommended mitigations, ordered by first appearance.
    pub mitigations: Vec<String>,
}

impl AggregateVerdict {
    /// A clean allow verdict.
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            risk_level: RiskLevel::None,
            confidence: 0.0,
            matched_techniques: Vec::new(),
            adjustments: Vec::new(),
            evidence: Vec::new(),
            violations: Vec::new(),
            mitigations: Vec::new(),
        }
    }

    /// True for a blocking verdict.
    pub fn is_blocked(&self) -> bool {
        self.decision.is_blocked()
    }

    /// The structured `data` payload attached to a security-violation
    /// JSON-RPC error. Schema-stable: additions only.
    pub fn error_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "risk_level": self.risk_level,
            "matched_techniques": self
                .matched_techniques
                .iter()
                .map(|verdict| verdict.technique_id.clone())
                .collect::<Vec<_>>(),
            "confidence": self.confidence,
            "mitigations": self.mitigations,
            "violations": self.violations,
            "evidence": self.evidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_from_severity() {
        assert_eq!(RiskLevel::from(Severity::Low), RiskLevel::Low);
        assert_eq!(RiskLevel::from(Severity::Critical), RiskLevel::Critical);
        assert!(RiskLevel::Critical > RiskLevel::None);
    }

    #[test]
    fn test_allow_verdict_shape() {
        let verdict = AggregateVerdict::allow();
        assert_eq!(verdict.decision, Decision::Allow);
        assert!(!verdict.is_blocked());
        assert!(verdict.matched_techniques.is_empty());
    }

    #[test]
    fn test_error_payload_fields() {
        let mut verdict = AggregateVerdict::allow();
        verdict.decision = Decision::Block;
        verdict.risk_level = RiskLevel::High;
        verdict.matched_techniques.push(TechniqueVerdict {
            technique_id: "SAFE-T1105".to_string(),
            technique_name: "Path Traversal".to_string(),
            tactic: Tactic::InitialAccess,
            severity: Severity::Critical,
            matched: true,
            confidence: 0.95,
            method: Some(Channel::Rule),
            evidence: vec!["parent traversal sequence".to_string()],
        });

        let payload = verdict.error_payload();
        assert_eq!(payload["risk_level"], "HIGH");
        assert_eq!(payload["matched_techniques"][0], "SAFE-T1105");
    }

    #[test]
    fn test_decision_serde() {
        assert_eq!(serde_json::to_string(&Decision::Block).unwrap(), "\"BLOCK\"");
        assert_eq!(serde_json::to_string(&RiskLevel::None).unwrap(), "\"NONE\"");
    }
}
