//! Pattern channel: compiled matcher evaluation over text views.

use warden_catalog::Technique;

/// Result of running one technique's pattern matchers.
#[derive(Debug, Clone, Default)]
pub struct PatternOutcome {
    /// True if any matcher fired.
    pub matched: bool,
    /// Saturating confidence in [0, 1].
    pub confidence: f64,
    /// Evidence strings, one per fired matcher, in definition order.
    pub evidence: Vec<String>,
}

/// The pattern analyzer.
///
/// Confidence model: 0 when nothing fires; otherwise
/// `min(1.0, base + (k - 1) * delta)` where `k` is the number of distinct
/// matchers that fired. A single strong match dominates; additional
/// matches saturate toward 1.0 instead of accumulating linearly.
///
/// The analyzer carries no per-request state and is safe to share.
#[derive(Debug, Clone)]
pub struct PatternAnalyzer {
    base: f64,
    delta: f64,
}

impl Default for PatternAnalyzer {
    fn default() -> Self {
        Self::new(0.95, 0.05)
    }
}

impl PatternAnalyzer {
    /// Creates an analyzer with explicit scoring constants.
    pub fn new(base: f64, delta: f64) -> Self {
        Self { base, delta }
    }

    /// Runs one technique's matchers against a set of text views.
    ///
    /// `views` is the original text plus any deobfuscated variants; a
    /// matcher counts as fired if it matches any view. Empty views are
    /// skipped, so empty text can never produce a match.
    pub fn analyze(&self, technique: &Technique, views: &[&str]) -> PatternOutcome {
        let mut evidence = Vec::new();
        let mut fired = 0usize;

        for matcher in &technique.matchers {
            let hit = views
                .iter()
                .filter(|view| !view.is_empty())
                .any(|view| matcher.is_match(view));
            if hit {
                fired += 1;
                evidence.push(format!("pattern match: {}", matcher.evidence_literal()));
            }
        }

        if fired == 0 {
            return PatternOutcome::default();
        }

        let confidence = (self.base + (fired as f64 - 1.0) * self.delta).min(1.0);
        PatternOutcome {
            matched: true,
            confidence,
            evidence,
        }
    }
}
