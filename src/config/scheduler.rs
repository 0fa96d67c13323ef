//! Scheduler configuration structures.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::executor::ExecutionOptions;
use crate::core::SchedulerError;
use crate::util::types::{Priority, ResourceType};

/// Environment variable naming a JSON configuration file.
pub const CONFIG_PATH_VAR: &str = "TASK_GRAPH_CONFIG";

/// Prefix of scalar override variables, e.g. `TASK_GRAPH_MAX_QUEUE_DEPTH`.
pub const ENV_PREFIX: &str = "TASK_GRAPH_";

/// Token bucket configuration for one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Maximum tokens the bucket holds.
    pub capacity: f64,
    /// Tokens restored per second.
    #[serde(default)]
    pub refill_rate: f64,
}

impl ResourceConfig {
    /// Bucket with the given capacity and refill rate.
    pub const fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Validate bucket values.
    pub fn validate(&self) -> Result<(), String> {
        if !self.capacity.is_finite() || self.capacity <= 0.0 {
            return Err("capacity must be greater than 0".into());
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err("refill_rate must not be negative".into());
        }
        Ok(())
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Buckets keyed by resource type.
    pub resources: BTreeMap<ResourceType, ResourceConfig>,
    /// Requests at or above this priority may preempt (0..=10).
    pub preemption_threshold: u8,
    /// Maximum queued admission requests before rejection.
    pub max_queue_depth: usize,
    /// Maximum nodes running at once within a level.
    pub max_parallel_nodes: usize,
    /// Upper bound between admission retries, in milliseconds.
    pub retry_interval_ms: u64,
    /// Admission retries per node before it fails; unbounded when absent.
    pub max_admission_retries: Option<u32>,
    /// Graph wall-clock limit in seconds.
    pub graph_timeout_secs: Option<u64>,
    /// Per-node wall-clock limit in seconds.
    pub node_timeout_secs: Option<u64>,
    /// Seconds an un-retried queue entry survives.
    pub queue_stale_secs: u64,
    /// Execution records kept in history.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resources: BTreeMap::new(),
            preemption_threshold: 8,
            max_queue_depth: 1024,
            max_parallel_nodes: num_cpus::get().max(1),
            retry_interval_ms: 25,
            max_admission_retries: None,
            graph_timeout_secs: None,
            node_timeout_secs: None,
            queue_stale_secs: 30,
            history_limit: 256,
        }
    }
}

impl SchedulerConfig {
    /// Add or replace a resource bucket.
    #[must_use]
    pub fn with_resource(mut self, resource: ResourceType, capacity: f64, refill_rate: f64) -> Self {
        self.resources
            .insert(resource.normalized(), ResourceConfig::new(capacity, refill_rate));
        self
    }

    /// Validate every field.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        for (resource, bucket) in &self.resources {
            bucket
                .validate()
                .map_err(|e| invalid(format!("resource `{resource}` invalid: {e}")))?;
        }
        if self.preemption_threshold > Priority::MAX.value() {
            return Err(invalid(format!(
                "preemption_threshold must be at most {}",
                Priority::MAX
            )));
        }
        if self.max_queue_depth == 0 {
            return Err(invalid("max_queue_depth must be greater than 0"));
        }
        if self.max_parallel_nodes == 0 {
            return Err(invalid("max_parallel_nodes must be greater than 0"));
        }
        if self.retry_interval_ms == 0 {
            return Err(invalid("retry_interval_ms must be greater than 0"));
        }
        if self.graph_timeout_secs == Some(0) {
            return Err(invalid("graph_timeout_secs must be greater than 0"));
        }
        if self.node_timeout_secs == Some(0) {
            return Err(invalid("node_timeout_secs must be greater than 0"));
        }
        if self.queue_stale_secs == 0 {
            return Err(invalid("queue_stale_secs must be greater than 0"));
        }
        if self.history_limit == 0 {
            return Err(invalid("history_limit must be greater than 0"));
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, SchedulerError> {
        let cfg: Self =
            serde_json::from_str(input).map_err(|e| invalid(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from the environment.
    ///
    /// Reads `.env` if present, then the JSON file named by
    /// [`CONFIG_PATH_VAR`], then applies `TASK_GRAPH_*` scalar overrides.
    pub fn from_env() -> Result<Self, SchedulerError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                return Err(invalid(format!(".env could not be loaded: {err}")));
            }
        }
        let mut cfg = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| invalid(format!("cannot read `{path}`: {e}")))?;
                serde_json::from_str(&raw).map_err(|e| invalid(format!("parse error in `{path}`: {e}")))?
            }
            Err(_) => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        tracing::debug!(resources = cfg.resources.len(), "scheduler configuration loaded");
        Ok(cfg)
    }

    /// Apply `TASK_GRAPH_*` scalar overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SchedulerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("PREEMPTION_THRESHOLD") {
            self.preemption_threshold = parse("PREEMPTION_THRESHOLD", &v)?;
        }
        if let Some(v) = get("MAX_QUEUE_DEPTH") {
            self.max_queue_depth = parse("MAX_QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = get("MAX_PARALLEL_NODES") {
            self.max_parallel_nodes = parse("MAX_PARALLEL_NODES", &v)?;
        }
        if let Some(v) = get("RETRY_INTERVAL_MS") {
            self.retry_interval_ms = parse("RETRY_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("MAX_ADMISSION_RETRIES") {
            self.max_admission_retries = Some(parse("MAX_ADMISSION_RETRIES", &v)?);
        }
        if let Some(v) = get("GRAPH_TIMEOUT_SECS") {
            self.graph_timeout_secs = Some(parse("GRAPH_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("NODE_TIMEOUT_SECS") {
            self.node_timeout_secs = Some(parse("NODE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("QUEUE_STALE_SECS") {
            self.queue_stale_secs = parse("QUEUE_STALE_SECS", &v)?;
        }
        if let Some(v) = get("HISTORY_LIMIT") {
            self.history_limit = parse("HISTORY_LIMIT", &v)?;
        }
        Ok(())
    }

    /// Priority threshold for preemption.
    pub const fn preemption_priority(&self) -> Priority {
        Priority::new(self.preemption_threshold)
    }

    /// Queue staleness window.
    pub const fn queue_stale_after(&self) -> Duration {
        Duration::from_secs(self.queue_stale_secs)
    }

    /// Default execution options derived from this configuration.
    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            graph_timeout: self.graph_timeout_secs.map(Duration::from_secs),
            node_timeout: self.node_timeout_secs.map(Duration::from_secs),
            max_admission_retries: self.max_admission_retries,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            max_parallel: self.max_parallel_nodes,
        }
    }
}

fn invalid(message: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidConfig(message.into())
}

fn parse<T>(name: &str, value: &str) -> Result<T, SchedulerError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| invalid(format!("{ENV_PREFIX}{name}=`{value}`: {e}")))
}
