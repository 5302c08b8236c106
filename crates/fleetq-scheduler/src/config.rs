//! Scheduler configuration, loaded from TOML.
//!
//! ```toml
//! tick_interval_secs = 10
//! max_concurrent_per_cluster = 10
//! max_queue_size = 100
//! preemption_enabled = true
//!
//! [limits]
//! max_ram_gb = 32.0
//! max_cpu_cores = 8.0
//! max_gpu_count = 4
//! ```

use std::path::Path;
use std::time::Duration;

use fleetq_state::{MAX_PRIORITY, MIN_PRIORITY};
use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};
use crate::validate::is_positive;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between periodic scheduling passes.
    pub tick_interval_secs: u64,
    /// Admissions allowed per cluster within one pass.
    pub max_concurrent_per_cluster: u32,
    /// Pending deployments accepted before submissions are refused.
    pub max_queue_size: usize,
    /// Whether a blocked higher-priority deployment may evict lower ones.
    pub preemption_enabled: bool,
    /// Per-rank step used for start-time estimates.
    pub eta_step_secs: u64,
    /// Priority given to submissions that don't name one.
    pub default_priority: u8,
    pub limits: DeploymentLimits,
}

/// Upper bounds on a single deployment's request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentLimits {
    pub max_ram_gb: f64,
    pub max_cpu_cores: f64,
    pub max_gpu_count: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            max_concurrent_per_cluster: 10,
            max_queue_size: 100,
            preemption_enabled: true,
            eta_step_secs: 300,
            default_priority: MIN_PRIORITY,
            limits: DeploymentLimits::default(),
        }
    }
}

impl Default for DeploymentLimits {
    fn default() -> Self {
        Self {
            max_ram_gb: 32.0,
            max_cpu_cores: 8.0,
            max_gpu_count: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> SchedulerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> SchedulerResult<Self> {
        let config: SchedulerConfig =
            toml::from_str(content).map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> SchedulerResult<String> {
        toml::to_string_pretty(self).map_err(|e| SchedulerError::Config(e.to_string()))
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.tick_interval_secs == 0 {
            return Err(SchedulerError::Config(
                "tick_interval_secs must be greater than 0".into(),
            ));
        }
        if self.max_concurrent_per_cluster == 0 {
            return Err(SchedulerError::Config(
                "max_concurrent_per_cluster must be greater than 0".into(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(SchedulerError::Config(
                "max_queue_size must be greater than 0".into(),
            ));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.default_priority) {
            return Err(SchedulerError::Config(format!(
                "default_priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
            )));
        }
        if !is_positive(self.limits.max_ram_gb) || !is_positive(self.limits.max_cpu_cores) {
            return Err(SchedulerError::Config(
                "limits.max_ram_gb and limits.max_cpu_cores must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn eta_step(&self) -> Duration {
        Duration::from_secs(self.eta_step_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_concurrent_per_cluster, 10);
        assert_eq!(config.tick_interval(), Duration::from_secs(10));
    }

    #[test]
    fn parse_partial_overrides() {
        let config = SchedulerConfig::from_toml_str(
            r#"
max_concurrent_per_cluster = 2
preemption_enabled = false

[limits]
max_gpu_count = 8
"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_per_cluster, 2);
        assert!(!config.preemption_enabled);
        assert_eq!(config.limits.max_gpu_count, 8);
        assert_eq!(config.limits.max_ram_gb, 32.0);
        assert_eq!(config.tick_interval_secs, 10);
    }

    #[test]
    fn rejects_zero_cap() {
        let err = SchedulerConfig::from_toml_str("max_concurrent_per_cluster = 0").unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
    }

    #[test]
    fn rejects_out_of_range_default_priority() {
        assert!(SchedulerConfig::from_toml_str("default_priority = 6").is_err());
        assert!(SchedulerConfig::from_toml_str("default_priority = 0").is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(SchedulerConfig::from_toml_str("tick_interval_secs = \"soon\"").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = SchedulerConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(SchedulerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetq.toml");
        std::fs::write(&path, "tick_interval_secs = 3\n").unwrap();
        assert_eq!(SchedulerConfig::from_file(&path).unwrap().tick_interval_secs, 3);
        assert!(SchedulerConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
