//! # Prometheus Task Graph
//!
//! Dependency-graph scheduling with token-bucket admission control for AI
//! agent workloads.
//!
//! Work items form a graph of interdependent nodes. The scheduler resolves an
//! execution order, reports cycles, groups independent nodes into levels, and
//! gates every node's start on constrained resources (compute quota, request
//! budget, concurrency slots) before running it.
//!
//! ## Components
//!
//! - **Resource pool**: one token bucket per resource type with continuous
//!   refill and exact reservation accounting.
//! - **Admission controller**: all-or-nothing grants, a priority wait queue,
//!   and single-victim preemption for urgent requests.
//! - **Resolver**: cycle detection, deterministic topological order, level
//!   assignment.
//! - **Executor**: per-node state machine run level by level on tokio, with
//!   failure propagation, timeouts and cancellation.
//! - **Scheduler**: the facade owning a pool and a graph store.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_task_graph::config::SchedulerConfig;
//! use prometheus_task_graph::core::{work_fn, NodeSpec, Scheduler};
//!
//! let scheduler: Scheduler<(), String> = Scheduler::new(SchedulerConfig::default())?;
//! let receipt = scheduler.submit(vec![
//!     NodeSpec::new("build", ()),
//!     NodeSpec::new("test", ()).depends_on(["build"]),
//!     NodeSpec::new("deploy", ()).depends_on(["test"]),
//! ])?;
//! assert_eq!(receipt.order, ["build", "test", "deploy"]);
//!
//! let work = work_fn(|id, _payload, _deps| async move { Ok(format!("{id} done")) });
//! let summary = scheduler.execute(receipt.graph_id, work, None).await?;
//! assert_eq!(summary.completed, 3);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling: resource accounting, admission, resolution and execution.
pub mod core;
/// Configuration models for resources, admission, and execution limits.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Infrastructure adapters for queue backends.
pub mod infra;
/// Shared utilities.
pub mod util;
