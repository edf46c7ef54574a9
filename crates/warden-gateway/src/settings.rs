//! Gateway settings: TOML file plus `WARDEN_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::GatewayError;
use warden_core::{CombinerMode, CoreConfig};

/// The `warden.toml` document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Core pipeline configuration.
    pub core: CoreConfig,
    /// Directory of `SAFE-T*.json` technique descriptors.
    pub techniques_dir: PathBuf,
    /// Upstream server configuration file.
    pub servers_file: PathBuf,
    /// Audit log file; absent means structured logging only.
    pub audit_log: Option<PathBuf>,
    /// Audit queue capacity.
    pub audit_queue_size: usize,
    /// Deadline for one upstream call, in seconds.
    pub upstream_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            techniques_dir: PathBuf::from("config/techniques"),
            servers_file: PathBuf::from("config/servers.json"),
            audit_log: None,
            audit_queue_size: 1024,
            upstream_timeout_secs: 30,
        }
    }
}

impl GatewaySettings {
    /// Loads settings from a TOML file and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            GatewayError::Config(format!("cannot read {}: {}", path.display(), err))
        })?;
        let mut settings: Self = toml::from_str(&raw)
            .map_err(|err| GatewayError::Config(format!("invalid {}: {}", path.display(), err)))?;
        settings.apply_env();
        settings.core.validate()?;
        Ok(settings)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, GatewayError> {
        let mut settings = Self::default();
        settings.apply_env();
        settings.core.validate()?;
        Ok(settings)
    }

    /// The upstream call deadline.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Applies `WARDEN_*` environment variables over the loaded values.
    fn apply_env(&mut self) {
        if let Some(value) = env_parse::<f64>("WARDEN_BLOCK_THRESHOLD") {
            self.core.block_threshold = value;
        }
        if let Some(value) = env_parse::<f64>("WARDEN_WARN_THRESHOLD") {
            self.core.warn_threshold = value;
        }
        if let Ok(value) = std::env::var("WARDEN_COMBINER") {
            match value.as_str() {
                "max" => self.core.combiner = CombinerMode::Max,
                "weighted" => self.core.combiner = CombinerMode::Weighted,
                _ => {}
            }
        }
        if let Some(value) = env_parse::<u64>("WARDEN_INSPECTION_BUDGET_MS") {
            self.core.inspection_budget_ms = value;
        }
        if let Some(value) = env_parse::<u64>("WARDEN_UPSTREAM_TIMEOUT_SECS") {
            self.upstream_timeout_secs = value;
        }
        if let Some(value) = env_parse::<usize>("WARDEN_AUDIT_QUEUE_SIZE") {
            self.audit_queue_size = value;
        }
        if let Some(value) = env_parse::<u64>("WARDEN_SESSION_INACTIVITY_SECS") {
            self.core.session_inactivity_secs = value;
        }
        if let Some(value) = env_parse::<usize>("WARDEN_GRAPH_CAP") {
            self.core.graph_cap = value;
        }
        if let Some(value) = env_parse::<usize>("WARDEN_VARIANT_CAP") {
            self.core.variant_cap = value;
        }
        if let Ok(value) = std::env::var("WARDEN_WORKSPACE_ROOT") {
            self.core.workspace_root = value;
        }
        if let Ok(value) = std::env::var("WARDEN_STRICT") {
            self.core.strict_catalog = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(value) = std::env::var("WARDEN_TECHNIQUES_DIR") {
            self.techniques_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("WARDEN_SERVERS_FILE") {
            self.servers_file = PathBuf::from(value);
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}
