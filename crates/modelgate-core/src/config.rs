//! modelgate.toml configuration parser.
//!
//! One typed structure per slot holds every policy knob: quality minimums,
//! regression tolerances, improvement margin, A/B split and duration,
//! benchmark limits, and the rollback window. `validate()` runs at load time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::metric::{default_rules, Direction, MetricRule, QUALITY_SCORE};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub data_dir: PathBuf,
    pub listen: String,
    /// VersionMonitor poll cadence.
    pub poll_interval_secs: u64,
    /// Cadence of timer-driven transitions (A/B conclusion, window expiry).
    pub tick_interval_secs: u64,
    pub corpus_dir: PathBuf,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/modelgate"),
            listen: "0.0.0.0:8470".to_string(),
            poll_interval_secs: 24 * 3600,
            tick_interval_secs: 30,
            corpus_dir: PathBuf::from("/etc/modelgate/corpus"),
        }
    }
}

impl ControllerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Where the version feed is read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedConfig {
    /// A JSON document mapping slot id → list of releases.
    File { path: PathBuf },
    /// `GET http://{address}{path}/{slot_id}` returning a JSON list.
    Http {
        address: String,
        #[serde(default = "default_feed_path")]
        path: String,
        #[serde(default = "default_feed_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_feed_path() -> String {
    "/versions".to_string()
}

fn default_feed_timeout_ms() -> u64 {
    10_000
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig::File {
            path: PathBuf::from("/etc/modelgate/feed.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub slot_id: String,
    /// Corpus key, e.g. `image_generation`.
    pub slot_type: String,
    /// Version made active when the slot is first registered.
    #[serde(default)]
    pub bootstrap_version: Option<String>,
    /// `host:port` of an HTTP model adapter used for benchmarking.
    #[serde(default)]
    pub model_endpoint: Option<String>,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub ab_test: AbTestConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
}

impl SlotConfig {
    /// Slot with every section at its default.
    pub fn new(slot_id: &str, slot_type: &str) -> Self {
        Self {
            slot_id: slot_id.to_string(),
            slot_type: slot_type.to_string(),
            bootstrap_version: None,
            model_endpoint: None,
            benchmark: BenchmarkConfig::default(),
            policy: PolicyConfig::default(),
            ab_test: AbTestConfig::default(),
            rollback: RollbackConfig::default(),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let slot = &self.slot_id;
        if slot.trim().is_empty() {
            return Err(invalid("slot_id must not be empty"));
        }
        if !slot
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid(format!(
                "slot {slot}: slot_id may only contain ASCII letters, digits, '-', '_' and '.'"
            )));
        }
        self.benchmark.validate(slot)?;
        self.policy.validate(slot)?;
        self.ab_test.validate(slot)?;
        self.rollback.validate(slot)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub sample_count: usize,
    /// Fraction of failed samples above which the run is incomplete.
    pub max_failure_fraction: f64,
    /// Hard wall-clock cap for one run (candidate + active).
    pub timeout_secs: u64,
    /// Samples evaluated concurrently.
    pub concurrency: usize,
    /// Incomplete runs tolerated before the candidate is rejected.
    pub max_attempts: u32,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            sample_count: 100,
            max_failure_fraction: 0.10,
            timeout_secs: 2 * 3600,
            concurrency: 8,
            max_attempts: 3,
        }
    }
}

impl BenchmarkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self, slot: &str) -> ConfigResult<()> {
        if self.sample_count == 0 {
            return Err(invalid(format!("slot {slot}: benchmark.sample_count must be > 0")));
        }
        if self.concurrency == 0 {
            return Err(invalid(format!("slot {slot}: benchmark.concurrency must be > 0")));
        }
        if !(0.0..=1.0).contains(&self.max_failure_fraction) {
            return Err(invalid(format!(
                "slot {slot}: benchmark.max_failure_fraction must be within [0, 1]"
            )));
        }
        if self.timeout_secs == 0 {
            return Err(invalid(format!("slot {slot}: benchmark.timeout_secs must be > 0")));
        }
        if self.max_attempts == 0 {
            return Err(invalid(format!("slot {slot}: benchmark.max_attempts must be > 0")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Relative improvement on a primary metric that skips the A/B test.
    pub significant_improvement: f64,
    pub metrics: Vec<MetricRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            significant_improvement: 0.10,
            metrics: default_rules(),
        }
    }
}

impl PolicyConfig {
    pub fn rule(&self, name: &str) -> Option<&MetricRule> {
        self.metrics.iter().find(|r| r.name == name)
    }

    fn validate(&self, slot: &str) -> ConfigResult<()> {
        if !(self.significant_improvement.is_finite() && self.significant_improvement > 0.0) {
            return Err(invalid(format!(
                "slot {slot}: policy.significant_improvement must be > 0"
            )));
        }
        let mut seen = HashSet::new();
        for rule in &self.metrics {
            if rule.name.trim().is_empty() {
                return Err(invalid(format!("slot {slot}: metric rule without a name")));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(invalid(format!(
                    "slot {slot}: duplicate metric rule {}",
                    rule.name
                )));
            }
            if let Some(tol) = rule.max_regression
                && !tol.is_valid()
            {
                return Err(invalid(format!(
                    "slot {slot}: metric {} has a negative regression tolerance",
                    rule.name
                )));
            }
            if !(rule.weight.is_finite() && rule.weight >= 0.0) {
                return Err(invalid(format!(
                    "slot {slot}: metric {} has an invalid weight",
                    rule.name
                )));
            }
        }
        if !self.metrics.iter().any(|r| r.primary) {
            return Err(invalid(format!("slot {slot}: policy needs at least one primary metric")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbTestConfig {
    /// Fraction of sessions routed to the candidate (variant B).
    pub traffic_split: f64,
    pub duration_secs: u64,
    /// Length of the single extension granted on insufficient data.
    /// Defaults to `duration_secs`.
    pub extension_secs: Option<u64>,
    pub min_samples_per_variant: u64,
    /// Outcome metric compared between variants.
    pub primary_metric: String,
    pub primary_direction: Direction,
    /// Relative margin the candidate must win by when deciding on
    /// insufficient data.
    pub insufficient_data_margin: f64,
}

impl Default for AbTestConfig {
    fn default() -> Self {
        Self {
            traffic_split: 0.5,
            duration_secs: 24 * 3600,
            extension_secs: None,
            min_samples_per_variant: 200,
            primary_metric: QUALITY_SCORE.to_string(),
            primary_direction: Direction::HigherIsBetter,
            insufficient_data_margin: 0.05,
        }
    }
}

impl AbTestConfig {
    pub fn extension_secs(&self) -> u64 {
        self.extension_secs.unwrap_or(self.duration_secs)
    }

    fn validate(&self, slot: &str) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.traffic_split) {
            return Err(invalid(format!(
                "slot {slot}: ab_test.traffic_split must be within [0, 1]"
            )));
        }
        if self.duration_secs == 0 {
            return Err(invalid(format!("slot {slot}: ab_test.duration_secs must be > 0")));
        }
        if self.primary_metric.trim().is_empty() {
            return Err(invalid(format!("slot {slot}: ab_test.primary_metric must be set")));
        }
        if !(self.insufficient_data_margin.is_finite() && self.insufficient_data_margin >= 0.0) {
            return Err(invalid(format!(
                "slot {slot}: ab_test.insufficient_data_margin must be >= 0"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub window_secs: u64,
    /// Automatic rollback trigger evaluated while the window is open.
    pub alarm: Option<QualityAlarm>,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            window_secs: 48 * 3600,
            alarm: None,
        }
    }
}

impl RollbackConfig {
    fn validate(&self, slot: &str) -> ConfigResult<()> {
        if self.window_secs == 0 {
            return Err(invalid(format!("slot {slot}: rollback.window_secs must be > 0")));
        }
        if let Some(alarm) = &self.alarm {
            if alarm.metric.trim().is_empty() {
                return Err(invalid(format!("slot {slot}: rollback.alarm.metric must be set")));
            }
            if alarm.min_samples == 0 {
                return Err(invalid(format!(
                    "slot {slot}: rollback.alarm.min_samples must be > 0"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome-metric threshold that triggers an automatic rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAlarm {
    pub metric: String,
    pub direction: Direction,
    /// Alarm when the running mean is worse than this value.
    pub threshold: f64,
    #[serde(default = "default_alarm_samples")]
    pub min_samples: u64,
}

fn default_alarm_samples() -> u64 {
    50
}

impl QualityAlarm {
    /// True if `mean` is on the wrong side of the threshold.
    pub fn tripped(&self, mean: f64) -> bool {
        self.direction.is_better(self.threshold, mean)
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: ControllerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.controller.poll_interval_secs == 0 {
            return Err(invalid("controller.poll_interval_secs must be > 0"));
        }
        if self.controller.tick_interval_secs == 0 {
            return Err(invalid("controller.tick_interval_secs must be > 0"));
        }
        let mut ids = HashSet::new();
        for slot in &self.slots {
            slot.validate()?;
            if !ids.insert(slot.slot_id.as_str()) {
                return Err(invalid(format!("duplicate slot id {}", slot.slot_id)));
            }
        }
        Ok(())
    }

    pub fn slot(&self, slot_id: &str) -> Option<&SlotConfig> {
        self.slots.iter().find(|s| s.slot_id == slot_id)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
