//! Pipeline configuration.
//!
//! The combiner mode and its thresholds travel together as one unit: the
//! max combiner commits against the adaptive threshold, the weighted
//! combiner against its own block/warn pair. Mixing thresholds across
//! combiners is how inconsistent block lines happen, so they are kept in
//! one struct and validated together.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CoreError;

/// How technique-level verdicts combine into one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CombinerMode {
    /// Severity-driven: block on any HIGH/CRITICAL match.
    #[default]
    Max,
    /// Weighted sum of channel confidences against score thresholds.
    Weighted,
}

/// Per-channel weights for the weighted combiner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelWeights {
    pub pattern: f64,
    pub rule: f64,
    pub ml: f64,
    pub behavioral: f64,
}

impl Default for ChannelWeights {
    fn default() -> Self {
        Self {
            pattern: 0.6,
            rule: 0.25,
            ml: 0.10,
            behavioral: 0.05,
        }
    }
}

/// Configuration for the core pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Active combiner.
    pub combiner: CombinerMode,
    /// Weighted combiner: block when score reaches this.
    pub block_threshold: f64,
    /// Weighted combiner: warn when score reaches this.
    pub warn_threshold: f64,
    /// Channel weights for the weighted combiner.
    pub weights: ChannelWeights,
    /// Max combiner: adjusted risk at or above this blocks.
    pub adaptive_threshold: f64,
    /// Wall-clock budget for the whole dispatch batch, in milliseconds.
    pub inspection_budget_ms: u64,
    /// Per-request cap on concurrent channel tasks.
    pub channel_concurrency: usize,
    /// Obfuscation variant-set cap.
    pub variant_cap: usize,
    /// Per-session call-graph node cap.
    pub graph_cap: usize,
    /// Depth of the graph snapshot handed to behavioral analysis.
    pub snapshot_depth: usize,
    /// Taint registry capacity.
    pub taint_capacity: usize,
    /// Session inactivity timeout, in seconds.
    pub session_inactivity_secs: u64,
    /// Sandbox root for path resolution and flow policy.
    pub workspace_root: String,
    /// Pattern confidence constants.
    pub pattern_base: f64,
    pub pattern_delta: f64,
    /// Fail startup when any technique descriptor is rejected.
    pub strict_catalog: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            combiner: CombinerMode::Max,
            block_threshold: 0.50,
            warn_threshold: 0.30,
            weights: ChannelWeights::default(),
            adaptive_threshold: 0.70,
            inspection_budget_ms: 100,
            channel_concurrency: 8,
            variant_cap: 32,
            graph_cap: 10_000,
            snapshot_depth: 256,
            taint_capacity: 4096,
            session_inactivity_secs: 1800,
            workspace_root: "/workspace".to_string(),
            pattern_base: 0.95,
            pattern_delta: 0.05,
            strict_catalog: false,
        }
    }
}

impl CoreConfig {
    /// The inspection budget as a duration.
    pub fn inspection_budget(&self) -> Duration {
        Duration::from_millis(self.inspection_budget_ms)
    }

    /// The session inactivity timeout as a duration.
    pub fn session_inactivity(&self) -> Duration {
        Duration::from_secs(self.session_inactivity_secs)
    }

    /// Validates threshold ordering and ranges.
    pub fn validate(&self) -> Result<(), CoreError> {
        let unit = |value: f64, name: &str| -> Result<(), CoreError> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(CoreError::Config(format!("{} {} outside [0, 1]", name, value)))
            }
        };
        unit(self.block_threshold, "block_threshold")?;
        unit(self.warn_threshold, "warn_threshold")?;
        unit(self.adaptive_threshold, "adaptive_threshold")?;
        if self.warn_threshold > self.block_threshold {
            return Err(CoreError::Config(format!(
                "warn_threshold {} exceeds block_threshold {}",
                self.warn_threshold, self.block_threshold
            )));
        }
        if self.channel_concurrency == 0 {
            return Err(CoreError::Config("channel_concurrency must be > 0".to_string()));
        }
        Ok(())
    }
}
