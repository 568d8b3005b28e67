//! TOML configuration for spcguard.
//!
//! Layered: an explicit path, then the `SPCGUARD_CONFIG` environment
//! variable, then `/etc/spcguard/spcguard.toml`, then compiled-in defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::capability::SpecLimits;
use crate::detect::escalation::ActionSet;
use crate::detect::AgentType;

pub const CONFIG_ENV: &str = "SPCGUARD_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/spcguard/spcguard.toml";

/// The longest Western Electric window (rule 4) spans this many points.
const MIN_BASELINE_WINDOW: usize = 7;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the engine and its boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), sources = config.sources.len(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration. An explicit path must load; the
    /// environment and system locations fall back to defaults on error.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SPCGUARD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        self.escalation.validate()?;
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            bail!("logging.format must be \"text\" or \"json\", got {:?}", self.logging.format);
        }
        if self.dedup.window_secs == 0 {
            bail!("dedup.window_secs must be positive");
        }
        if self.baseline.window < MIN_BASELINE_WINDOW {
            bail!(
                "baseline.window must be at least {}, got {}",
                MIN_BASELINE_WINDOW,
                self.baseline.window
            );
        }
        if self.baseline.min_samples < 2 || self.baseline.min_samples > self.baseline.window {
            bail!(
                "baseline.min_samples must be between 2 and baseline.window ({}), got {}",
                self.baseline.window,
                self.baseline.min_samples
            );
        }
        if self.baseline.history_limit < self.baseline.window + 1 {
            bail!("baseline.history_limit must exceed baseline.window");
        }
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {:?}", source.source_id);
            }
            for (parameter, max) in &source.thresholds {
                if !(*max > 0.0) {
                    bail!(
                        "source {:?}: threshold for {:?} must be positive",
                        source.source_id,
                        parameter
                    );
                }
            }
        }
        Ok(())
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    /// How long resolved incidents stay in memory: the 24h safety-circuit
    /// window or the dedup window, whichever is longer.
    pub fn incident_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(24).max(self.dedup.window())
    }
}

// ---------------------------------------------------------------------------
// Server / storage / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the operator HTTP API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/spcguard.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// `"text"` or `"json"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Number of most recent points the control limits are computed from.
    pub window: usize,
    /// Points required before the limits are trusted.
    pub min_samples: usize,
    /// Points retained per stream.
    pub history_limit: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window: 60,
            min_samples: 10,
            history_limit: 1000,
        }
    }
}

/// Proportion-of-ceiling bands. A detected/threshold ratio strictly above a
/// band escalates into it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub green_ratio: f64,
    pub yellow_ratio: f64,
    pub red_ratio: f64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            green_ratio: 0.85,
            yellow_ratio: 0.95,
            red_ratio: 1.0,
        }
    }
}

impl EscalationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.green_ratio > 0.0
            && self.green_ratio < self.yellow_ratio
            && self.yellow_ratio < self.red_ratio)
        {
            bail!(
                "escalation ratios must satisfy 0 < green < yellow < red, got {} / {} / {}",
                self.green_ratio,
                self.yellow_ratio,
                self.red_ratio
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Repeat detections for a source and incident type within this many
    /// seconds of the last incident are suppressed.
    pub window_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { window_secs: 300 }
    }
}

impl DedupConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Active agents silent for longer than this are marked inactive.
    pub heartbeat_timeout_secs: u64,
    /// Period of the `detections_24h` reset tick.
    pub counter_reset_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 120,
            counter_reset_secs: 24 * 3600,
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Static configuration of one monitored source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Hard ceiling (e.g. equipment max rating) per parameter.
    #[serde(default)]
    pub thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub spec_limits: HashMap<String, SpecLimits>,
    /// Per-parameter overrides of the recommended actions.
    #[serde(default)]
    pub actions: HashMap<String, ActionSet>,
}

fn default_agent_type() -> AgentType {
    AgentType::Precision
}

fn default_protocol() -> String {
    "mqtt".to_string()
}

impl SourceConfig {
    pub fn new(source_id: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            source_id: source_id.into(),
            agent_type,
            capabilities: Vec::new(),
            protocol: default_protocol(),
            thresholds: HashMap::new(),
            spec_limits: HashMap::new(),
            actions: HashMap::new(),
        }
    }

    pub fn with_threshold(mut self, parameter: &str, max: f64) -> Self {
        self.thresholds.insert(parameter.to_string(), max);
        self
    }

    pub fn with_spec_limits(mut self, parameter: &str, limits: SpecLimits) -> Self {
        self.spec_limits.insert(parameter.to_string(), limits);
        self
    }

    pub fn threshold(&self, parameter: &str) -> Option<f64> {
        self.thresholds.get(parameter).copied()
    }

    pub fn limits(&self, parameter: &str) -> SpecLimits {
        self.spec_limits.get(parameter).copied().unwrap_or_default()
    }

    pub fn actions_for(&self, parameter: &str) -> ActionSet {
        self.actions
            .get(parameter)
            .cloned()
            .unwrap_or_else(|| ActionSet::defaults_for(parameter))
    }
}
