//! Configuration models for resources, admission, and execution limits.

pub mod scheduler;

pub use scheduler::{ResourceConfig, SchedulerConfig, CONFIG_PATH_VAR, ENV_PREFIX};
