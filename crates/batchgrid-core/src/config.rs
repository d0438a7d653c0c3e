//! Batch engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Durations are written as strings (`"50ms"`, `"10s"`, `"5m"`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::OperationKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Landing order of the four groups within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePolicy {
    /// Extract → Restore1 → Grow → Restore2.
    #[default]
    ExtractFirst,
    /// Restore1 → Extract → Grow → Restore2.
    RestoreFirst,
}

/// Memory cost of one thread, per operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadCost {
    pub extract: f64,
    pub restore: f64,
    pub grow: f64,
}

impl Default for ThreadCost {
    fn default() -> Self {
        Self {
            extract: 1.70,
            restore: 1.75,
            grow: 1.75,
        }
    }
}

impl ThreadCost {
    pub fn for_kind(&self, kind: OperationKind) -> f64 {
        match kind {
            OperationKind::Extract => self.extract,
            OperationKind::Restore => self.restore,
            OperationKind::Grow => self.grow,
        }
    }
}

/// Capacity each host must keep unallocated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservePolicy {
    pub default: f64,
    pub hosts: BTreeMap<String, f64>,
}

impl ReservePolicy {
    pub fn for_host(&self, host_id: &str) -> f64 {
        self.hosts.get(host_id).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Fraction of current value taken per batch, in `[0, 1)`.
    pub extract_fraction: f64,
    /// Minimum `value_current / value_max` a batch must restore, in `[0, 1]`.
    pub value_floor: f64,
    pub safety_gap: String,
    pub schedule_policy: SchedulePolicy,
    pub backoff_base: String,
    pub backoff_cap: String,
    /// Pause after tearing down jobs, before capacity is re-read.
    pub settle_delay: String,
    pub min_pass_interval: String,
    /// Defense above the floor tolerated before a prep pass is planned.
    pub prep_defense_slack: f64,
    /// Number of targets taken from the chooser each pass.
    pub max_targets: usize,
    pub thread_cost: ThreadCost,
    pub reserve: ReservePolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            extract_fraction: 0.1,
            value_floor: 1.0,
            safety_gap: "50ms".to_string(),
            schedule_policy: SchedulePolicy::default(),
            backoff_base: "10s".to_string(),
            backoff_cap: "5m".to_string(),
            settle_delay: "200ms".to_string(),
            min_pass_interval: "1s".to_string(),
            prep_defense_slack: 0.0,
            max_targets: 1,
            thread_cost: ThreadCost::default(),
            reserve: ReservePolicy::default(),
        }
    }
}

impl BatchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "loaded batch config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: BatchConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.extract_fraction) {
            return Err(invalid("extract_fraction", format!("{} not in [0, 1)", self.extract_fraction)));
        }
        if !(0.0..=1.0).contains(&self.value_floor) {
            return Err(invalid("value_floor", format!("{} not in [0, 1]", self.value_floor)));
        }
        if !self.prep_defense_slack.is_finite() || self.prep_defense_slack < 0.0 {
            return Err(invalid("prep_defense_slack", format!("{} must be >= 0", self.prep_defense_slack)));
        }
        if self.max_targets == 0 {
            return Err(invalid("max_targets", "must be >= 1".to_string()));
        }
        for kind in OperationKind::ALL {
            let cost = self.thread_cost.for_kind(kind);
            if !cost.is_finite() || cost <= 0.0 {
                return Err(invalid("thread_cost", format!("{kind} cost {cost} must be > 0")));
            }
        }
        let durations = [
            ("safety_gap", &self.safety_gap),
            ("backoff_base", &self.backoff_base),
            ("backoff_cap", &self.backoff_cap),
            ("settle_delay", &self.settle_delay),
            ("min_pass_interval", &self.min_pass_interval),
        ];
        for (field, value) in durations {
            if parse_duration(value).is_none() {
                return Err(invalid(field, format!("unparseable duration {value:?}")));
            }
        }
        if self.backoff_base() > self.backoff_cap() {
            return Err(invalid("backoff_base", "must not exceed backoff_cap".to_string()));
        }
        Ok(())
    }

    pub fn safety_gap(&self) -> Duration {
        parse_duration(&self.safety_gap).unwrap_or(Duration::from_millis(50))
    }

    pub fn backoff_base(&self) -> Duration {
        parse_duration(&self.backoff_base).unwrap_or(Duration::from_secs(10))
    }

    pub fn backoff_cap(&self) -> Duration {
        parse_duration(&self.backoff_cap).unwrap_or(Duration::from_secs(300))
    }

    pub fn settle_delay(&self) -> Duration {
        parse_duration(&self.settle_delay).unwrap_or(Duration::from_millis(200))
    }

    pub fn min_pass_interval(&self) -> Duration {
        parse_duration(&self.min_pass_interval).unwrap_or(Duration::from_secs(1))
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = BatchConfig::from_toml_str("").unwrap();
        assert_eq!(config, BatchConfig::default());
        assert_eq!(config.safety_gap(), Duration::from_millis(50));
        assert_eq!(config.backoff_cap(), Duration::from_secs(300));
    }

    #[test]
    fn parses_full_document() {
        let toml = r#"
            extract_fraction = 0.25
            value_floor = 0.9
            safety_gap = "30ms"
            schedule_policy = "restore_first"
            backoff_base = "2s"
            backoff_cap = "1m"
            max_targets = 2

            [thread_cost]
            extract = 1.6

            [reserve]
            default = 2.0
            hosts = { home = 32.0 }
        "#;
        let config = BatchConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.extract_fraction, 0.25);
        assert_eq!(config.schedule_policy, SchedulePolicy::RestoreFirst);
        assert_eq!(config.safety_gap(), Duration::from_millis(30));
        assert_eq!(config.backoff_cap(), Duration::from_secs(60));
        assert_eq!(config.thread_cost.extract, 1.6);
        assert_eq!(config.thread_cost.grow, 1.75);
        assert_eq!(config.reserve.for_host("home"), 32.0);
        assert_eq!(config.reserve.for_host("n00dles"), 2.0);
    }

    #[test]
    fn rejects_extract_fraction_of_one() {
        let err = BatchConfig::from_toml_str("extract_fraction = 1.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "extract_fraction", .. }));
    }

    #[test]
    fn rejects_bad_duration_string() {
        let err = BatchConfig::from_toml_str("safety_gap = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "safety_gap", .. }));
    }

    #[test]
    fn rejects_overflowing_minutes() {
        assert_eq!(parse_duration("999999999999999999m"), None);
        let err = BatchConfig::from_toml_str("safety_gap = \"999999999999999999m\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "safety_gap", .. }));
    }

    #[test]
    fn rejects_base_above_cap() {
        let err = BatchConfig::from_toml_str("backoff_base = \"10m\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "backoff_base", .. }));
    }

    #[test]
    fn rejects_zero_thread_cost() {
        let err = BatchConfig::from_toml_str("[thread_cost]\ngrow = 0.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "thread_cost", .. }));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("later"), None);
    }
}
