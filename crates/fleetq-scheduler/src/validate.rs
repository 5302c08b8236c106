//! Request validation for submissions and cluster registration.
//!
//! Every problem with a request is collected so the caller sees all of
//! them at once; a request that fails here never reaches the queue.

use std::collections::HashMap;
use std::sync::LazyLock;

use fleetq_state::{MAX_PRIORITY, MIN_PRIORITY, Resources};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};

/// DNS-label style names: lowercase alphanumerics and hyphens, 1-63 chars.
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex")
});

/// A request to run a new deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub name: String,
    pub image: String,
    pub cluster_id: String,
    pub ram_gb: f64,
    pub cpu_cores: f64,
    #[serde(default)]
    pub gpu_count: u32,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// A request to register a new cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub id: String,
    pub name: String,
    pub ram_gb: f64,
    pub cpu_cores: f64,
    #[serde(default)]
    pub gpu_count: u32,
}

/// Fields of a request that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValidRequest {
    pub resources: Resources,
    pub priority: u8,
}

pub(crate) fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

pub fn validate_priority(priority: u8) -> SchedulerResult<u8> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        Ok(priority)
    } else {
        Err(SchedulerError::Validation(format!(
            "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {priority}"
        )))
    }
}

pub(crate) fn validate_request(
    req: &DeploymentRequest,
    config: &SchedulerConfig,
) -> SchedulerResult<ValidRequest> {
    let limits = &config.limits;
    let mut errors = Vec::new();

    if !NAME_RE.is_match(&req.name) {
        errors.push(
            "name must be 1-63 characters of lowercase letters, digits, and hyphens".to_string(),
        );
    }
    if req.image.trim().is_empty() {
        errors.push("image is required".to_string());
    }
    if req.cluster_id.trim().is_empty() {
        errors.push("cluster_id is required".to_string());
    }
    if !is_positive(req.ram_gb) || req.ram_gb > limits.max_ram_gb {
        errors.push(format!("ram_gb must be in (0, {}]", limits.max_ram_gb));
    }
    if !is_positive(req.cpu_cores) || req.cpu_cores > limits.max_cpu_cores {
        errors.push(format!("cpu_cores must be in (0, {}]", limits.max_cpu_cores));
    }
    if req.gpu_count > limits.max_gpu_count {
        errors.push(format!("gpu_count must be at most {}", limits.max_gpu_count));
    }
    let priority = req.priority.unwrap_or(config.default_priority);
    if let Err(SchedulerError::Validation(msg)) = validate_priority(priority) {
        errors.push(msg);
    }

    if !errors.is_empty() {
        return Err(SchedulerError::Validation(errors.join("; ")));
    }

    let resources = Resources::from_units(req.ram_gb, req.cpu_cores, req.gpu_count);
    // Sub-unit requests round to zero, which would make them free.
    if resources.ram_mb == 0 || resources.cpu_millis == 0 {
        return Err(SchedulerError::Validation(
            "ram_gb and cpu_cores must be at least 1MB and 1 millicore".to_string(),
        ));
    }

    Ok(ValidRequest {
        resources,
        priority,
    })
}

pub(crate) fn validate_cluster(spec: &ClusterSpec) -> SchedulerResult<Resources> {
    let mut errors = Vec::new();
    if !NAME_RE.is_match(&spec.id) {
        errors.push("id must be 1-63 characters of lowercase letters, digits, and hyphens");
    }
    if spec.name.trim().is_empty() {
        errors.push("name is required");
    }
    if !is_positive(spec.ram_gb) {
        errors.push("ram_gb must be greater than 0");
    }
    if !is_positive(spec.cpu_cores) {
        errors.push("cpu_cores must be greater than 0");
    }
    if !errors.is_empty() {
        return Err(SchedulerError::Validation(errors.join("; ")));
    }
    let total = Resources::from_units(spec.ram_gb, spec.cpu_cores, spec.gpu_count);
    if total.ram_mb == 0 || total.cpu_millis == 0 {
        return Err(SchedulerError::Validation(
            "ram_gb and cpu_cores must be at least 1MB and 1 millicore".to_string(),
        ));
    }
    Ok(total)
}
