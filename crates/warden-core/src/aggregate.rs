//! Risk aggregator.
//!
//! Folds the per-technique verdicts, the isolation pre-gate result, the
//! flow-tracker post-check, and the obfuscation classification into one
//! deterministic decision. Two combiners are supported and deliberately
//! kept distinct — each carries its own thresholds (see `CoreConfig`):
//!
//! - **max**: overall severity is the highest severity among matched
//!   techniques; HIGH/CRITICAL block, MEDIUM warns.
//! - **weighted**: score is the weight of each matched technique's
//!   deciding channel times its confidence, summed; the score is compared
//!   against the block/warn thresholds.

use tracing::debug;

use warden_analyzers::ObfuscationReport;
use warden_catalog::{CatalogSnapshot, Severity};
use warden_flow::{FlowCheck, GateDecision, TaintLevel};

use crate::config::{CombinerMode, CoreConfig};
use crate::verdict::{AggregateVerdict, Channel, Decision, RiskLevel, TechniqueVerdict};

/// The risk aggregator.
pub struct Aggregator {
    config: CoreConfig,
}

impl Aggregator {
    /// Creates an aggregator over the pipeline configuration.
    pub fn new(config: CoreConfig) -> Self {
        Self { config }
    }

    /// Produces the aggregate verdict plus the scalar base risk handed to
    /// the adaptive adjuster.
    ///
    /// Decision precedence: isolation rejection, then flow violation,
    /// then the configured combiner over technique verdicts.
    pub fn aggregate(
        &self,
        technique_verdicts: Vec<TechniqueVerdict>,
        gate: Option<&GateDecision>,
        flow: Option<&FlowCheck>,
        obfuscation: Option<&ObfuscationReport>,
        snapshot: &CatalogSnapshot,
    ) -> (AggregateVerdict, f64) {
        // 1. Isolation pre-gate rejection short-circuits everything else.
        if let Some(decision) = gate {
            if !decision.accepted {
                return (self.from_gate_rejection(decision, snapshot), 1.0);
            }
        }

        // 2. A flow violation blocks regardless of detection results.
        if let Some(check) = flow {
            if let Some(violation) = &check.violation {
                let severity = match violation.taint_level {
                    TaintLevel::Critical | TaintLevel::High => Severity::Critical,
                    TaintLevel::Medium => Severity::High,
                    _ => Severity::Medium,
                };
                let mut verdict = AggregateVerdict {
                    decision: Decision::Block,
                    risk_level: severity.into(),
                    confidence: 1.0,
                    matched_techniques: technique_verdicts
                        .into_iter()
                        .filter(|verdict| verdict.matched)
                        .collect(),
                    adjustments: Vec::new(),
                    evidence: vec![
                        format!("flow violation: {}", violation.reason),
                        format!("taint source: {}", violation.source_locator),
                    ],
                    violations: vec![violation.reason.clone()],
                    mitigations: Vec::new(),
                };
                verdict.mitigations =
                    self.collect_mitigations(&verdict.matched_techniques, snapshot);
                return (verdict, 1.0);
            }
        }

        // 3. Combine technique verdicts.
        let mut matched: Vec<TechniqueVerdict> = technique_verdicts
            .into_iter()
            .filter(|verdict| verdict.matched)
            .collect();
        matched.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
        });

        let (decision, risk_level, confidence, base_risk) = match self.config.combiner {
            CombinerMode::Max => self.combine_max(&matched),
            CombinerMode::Weighted => self.combine_weighted(&matched),
        };

        let mut evidence: Vec<String> = Vec::new();
        for verdict in &matched {
            evidence.extend(verdict.evidence.iter().cloned());
        }
        if let Some(report) = obfuscation {
            if report.detected {
                evidence.push(format!(
                    "obfuscation present: {}",
                    report.techniques.join(", ")
                ));
            }
        }

        let mitigations = self.collect_mitigations(&matched, snapshot);

        debug!(
            ?decision,
            ?risk_level,
            matched = matched.len(),
            base_risk,
            "aggregated verdict"
        );

        (
            AggregateVerdict {
                decision,
                risk_level,
                confidence,
                matched_techniques: matched,
                adjustments: Vec::new(),
                evidence,
                violations: Vec::new(),
                mitigations,
            },
            base_risk,
        )
    }

    /// Max combiner: severity of the worst matched technique decides.
    fn combine_max(&self, matched: &[TechniqueVerdict]) -> (Decision, RiskLevel, f64, f64) {
        let Some(worst) = matched.first() else {
            return (Decision::Allow, RiskLevel::None, 0.0, 0.0);
        };
        let confidence = matched
            .iter()
            .map(|verdict| verdict.confidence)
            .fold(0.0, f64::max);
        let decision = match worst.severity {
            Severity::High | Severity::Critical => Decision::Block,
            Severity::Medium => Decision::Warn,
            Severity::Low => Decision::Allow,
        };
        (decision, worst.severity.into(), confidence, confidence)
    }

    /// Weighted combiner: channel-weighted confidence sum against the
    /// score thresholds.
    fn combine_weighted(&self, matched: &[TechniqueVerdict]) -> (Decision, RiskLevel, f64, f64) {
        if matched.is_empty() {
            return (Decision::Allow, RiskLevel::None, 0.0, 0.0);
        }

        let weights = &self.config.weights;
        let score: f64 = matched
            .iter()
            .map(|verdict| {
                let weight = match verdict.method {
                    Some(Channel::Pattern) => weights.pattern,
                    Some(Channel::Rule) => weights.rule,
                    Some(Channel::Ml) => weights.ml,
                    Some(Channel::Behavioral) => weights.behavioral,
                    None => 0.0,
                };
                weight * verdict.confidence
            })
            .sum();
        let score = score.min(1.0);

        let decision = if score >= self.config.block_threshold {
            Decision::Block
        } else if score >= self.config.warn_threshold {
            Decision::Warn
        } else {
            Decision::Allow
        };

        // Severity reported from the highest-severity contributor.
        let severity = matched
            .iter()
            .map(|verdict| verdict.severity)
            .max()
            .unwrap_or(Severity::Low);
        let risk_level = if decision == Decision::Allow {
            RiskLevel::Low
        } else {
            severity.into()
        };

        (decision, risk_level, score, score)
    }

    /// A BLOCK verdict synthesized from an isolation-gate rejection.
    ///
    /// The violation is attributed to the catalogue technique whose
    /// domain it falls in (path violations map onto the path-traversal
    /// technique) so the error payload names a technique id; the
    /// analyzers themselves never ran.
    fn from_gate_rejection(
        &self,
        decision: &GateDecision,
        snapshot: &CatalogSnapshot,
    ) -> AggregateVerdict {
        use warden_flow::PolicyViolation;

        let violations: Vec<String> = decision
            .violations
            .iter()
            .map(|violation| violation.to_string())
            .collect();
        let evidence: Vec<String> = violations
            .iter()
            .map(|violation| format!("policy violation: {}", violation))
            .collect();

        let path_violation = decision.violations.iter().any(|violation| {
            matches!(
                violation,
                PolicyViolation::PathBlocked { .. } | PolicyViolation::PathOutsideAllowed { .. }
            )
        });

        let mut matched_techniques = Vec::new();
        if path_violation {
            if let Some(technique) = snapshot
                .list()
                .find(|technique| technique.has_rule("path_traversal"))
            {
                matched_techniques.push(TechniqueVerdict {
                    technique_id: technique.spec.id.clone(),
                    technique_name: technique.spec.name.clone(),
                    tactic: technique.spec.tactic,
                    severity: technique.spec.severity,
                    matched: true,
                    confidence: 1.0,
                    method: Some(Channel::Rule),
                    evidence: evidence.clone(),
                });
            }
        }

        let risk_level = matched_techniques
            .first()
            .map(|verdict| RiskLevel::from(verdict.severity))
            .unwrap_or(RiskLevel::High);
        let mitigations = self.collect_mitigations(&matched_techniques, snapshot);

        AggregateVerdict {
            decision: Decision::Block,
            risk_level,
            confidence: 1.0,
            matched_techniques,
            adjustments: Vec::new(),
            evidence,
            violations,
            mitigations,
        }
    }

    /// Union of the matched techniques' mitigations, ordered by first
    /// appearance.
    fn collect_mitigations(
        &self,
        matched: &[TechniqueVerdict],
        snapshot: &CatalogSnapshot,
    ) -> Vec<String> {
        let mut mitigations: Vec<String> = Vec::new();
        for verdict in matched {
            if let Some(technique) = snapshot.lookup(&verdict.technique_id) {
                for mitigation in &technique.spec.mitigations {
                    if !mitigations.contains(mitigation) {
                        mitigations.push(mitigation.clone());
                    }
                }
            }
        }
        mitigations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_catalog::{Catalog, CatalogOptions, Tactic};

    fn snapshot() -> std::sync::Arc<CatalogSnapshot> {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("SAFE-T1105.json"),
            r##"{
                "id": "SAFE-T1105",
                "name": "Path Traversal",
                "tactic": "Initial Access",
                "severity": "critical",
                "enabled": true,
                "mitigations": ["SAFE-M-20"],
                "detection": {"rules": ["path_traversal"]}
            }"##,
        )
        .unwrap();
        let catalog = Catalog::load(dir.path(), CatalogOptions::default()).unwrap();
        catalog.snapshot()
    }

    fn verdict(severity: Severity, confidence: f64, method: Channel) -> TechniqueVerdict {
        TechniqueVerdict {
            technique_id: "SAFE-T1102".to_string(),
            technique_name: "Prompt Injection".to_string(),
            tactic: Tactic::Execution,
            severity,
            matched: true,
            confidence,
            method: Some(method),
            evidence: vec!["pattern match: ignore".to_string()],
        }
    }

    #[test]
    fn test_max_combiner_blocks_on_high() {
        let aggregator = Aggregator::new(CoreConfig::default());
        let (result, base) = aggregator.aggregate(
            vec![verdict(Severity::High, 0.95, Channel::Pattern)],
            None,
            None,
            None,
            &snapshot(),
        );
        assert_eq!(result.decision, Decision::Block);
        assert_eq!(result.risk_level, RiskLevel::High);
        assert!((base - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_max_combiner_warns_on_medium() {
        let aggregator = Aggregator::new(CoreConfig::default());
        let (result, _) = aggregator.aggregate(
            vec![verdict(Severity::Medium, 0.8, Channel::Rule)],
            None,
            None,
            None,
            &snapshot(),
        );
        assert_eq!(result.decision, Decision::Warn);
    }

    #[test]
    fn test_no_match_allows() {
        let aggregator = Aggregator::new(CoreConfig::default());
        let mut unmatched = verdict(Severity::High, 0.0, Channel::Pattern);
        unmatched.matched = false;
        let (result, base) = aggregator.aggregate(vec![unmatched], None, None, None, &snapshot());
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.risk_level, RiskLevel::None);
        assert_eq!(base, 0.0);
    }

    #[test]
    fn test_weighted_combiner_thresholds() {
        let config = CoreConfig {
            combiner: CombinerMode::Weighted,
            ..Default::default()
        };
        let aggregator = Aggregator::new(config);

        // Pattern 0.6 * 0.95 = 0.57 >= 0.5: block.
        let (result, base) = aggregator.aggregate(
            vec![verdict(Severity::High, 0.95, Channel::Pattern)],
            None,
            None,
            None,
            &snapshot(),
        );
        assert_eq!(result.decision, Decision::Block);
        assert!((base - 0.57).abs() < 1e-9);

        // Rule 0.25 * 0.9 = 0.225 < 0.3: allow.
        let (result, _) = aggregator.aggregate(
            vec![verdict(Severity::High, 0.9, Channel::Rule)],
            None,
            None,
            None,
            &snapshot(),
        );
        assert_eq!(result.decision, Decision::Allow);
    }

    #[test]
    fn test_gate_rejection_blocks_and_names_technique() {
        use warden_flow::{GateDecision, PolicyViolation};

        let aggregator = Aggregator::new(CoreConfig::default());
        let gate = GateDecision {
            accepted: false,
            violations: vec![PolicyViolation::PathBlocked {
                path: "../../etc/passwd".to_string(),
                prefix: "/etc".to_string(),
            }],
        };
        let (result, base) = aggregator.aggregate(vec![], Some(&gate), None, None, &snapshot());

        assert_eq!(result.decision, Decision::Block);
        assert!(result.risk_level >= RiskLevel::High);
        assert_eq!(base, 1.0);
        assert_eq!(result.matched_techniques[0].technique_id, "SAFE-T1105");
        assert!(result
            .evidence
            .iter()
            .any(|line| line.contains("system directory access")));
    }

    #[test]
    fn test_flow_violation_blocks() {
        use warden_flow::{FlowCheck, FlowViolation, SinkKind};

        let aggregator = Aggregator::new(CoreConfig::default());
        let check = FlowCheck {
            allowed: false,
            violation: Some(FlowViolation {
                violation_kind: "critical_data_to_network".to_string(),
                source_locator: "/home/u/.ssh/id_rsa".to_string(),
                sink_kind: SinkKind::Network,
                destination: "https://evil.example.com/".to_string(),
                taint_level: TaintLevel::Critical,
                reason: "CRITICAL tainted data cannot flow to any network endpoint".to_string(),
            }),
            taint_level: TaintLevel::Critical,
            sources: vec![],
        };

        let (result, _) = aggregator.aggregate(vec![], None, Some(&check), None, &snapshot());
        assert_eq!(result.decision, Decision::Block);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(result
            .evidence
            .iter()
            .any(|line| line.contains("/home/u/.ssh/id_rsa")));
        assert!(!result.violations.is_empty());
    }

    #[test]
    fn test_obfuscation_adds_evidence_only() {
        let aggregator = Aggregator::new(CoreConfig::default());
        let report = ObfuscationReport {
            detected: true,
            techniques: vec!["leetspeak"],
            confidence: 0.3,
            indicators: Default::default(),
        };
        let (result, _) = aggregator.aggregate(vec![], None, None, Some(&report), &snapshot());
        assert_eq!(result.decision, Decision::Allow);
        assert!(result
            .evidence
            .iter()
            .any(|line| line.contains("obfuscation present")));
    }
}
