//! Error types for scheduler operations.

use std::time::Duration;

use thiserror::Error;

use crate::util::types::{GraphId, NodeId, ResourceType};

/// Errors produced by scheduler components.
///
/// Admission and node errors are reported as data (decisions, summaries);
/// only usage errors are returned synchronously from the facade.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    /// The submitted graph contains one or more dependency cycles.
    #[error("dependency cycle detected: {}", format_cycles(.0))]
    CycleDetected(Vec<Vec<NodeId>>),
    /// A request named a resource type no bucket is configured for.
    #[error("unknown resource: {0}")]
    UnknownResource(ResourceType),
    /// A request can never be satisfied, even by an empty pool.
    #[error("budget exceeded for {resource}: requested {requested}, capacity {capacity}")]
    BudgetExceeded {
        /// Resource that is too small.
        resource: ResourceType,
        /// Amount requested.
        requested: f64,
        /// Total capacity of the bucket.
        capacity: f64,
    },
    /// Not enough tokens right now; retry later.
    #[error("insufficient {resource}: requested {requested}, available {available}")]
    InsufficientResources {
        /// Resource that is short.
        resource: ResourceType,
        /// Amount requested.
        requested: f64,
        /// Amount available at the time of the check.
        available: f64,
    },
    /// A node's work function returned an error.
    #[error("node `{node}` failed: {message}")]
    NodeExecution {
        /// Failing node.
        node: NodeId,
        /// Error rendered by the work function.
        message: String,
    },
    /// A node or graph ran past its deadline.
    #[error("{scope} timed out after {}ms", .after.as_millis())]
    Timeout {
        /// What timed out (`node <id>` or `graph <id>`).
        scope: String,
        /// Configured limit.
        after: Duration,
    },
    /// The admission wait queue is full.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// No graph with this id is stored.
    #[error("unknown graph: {0}")]
    UnknownGraph(GraphId),
    /// A node depends on an id that was not submitted.
    #[error("node `{node}` depends on unknown node `{dependency}`")]
    UnknownDependency {
        /// Node declaring the dependency.
        node: NodeId,
        /// Missing dependency id.
        dependency: NodeId,
    },
    /// Two submitted nodes share an id.
    #[error("duplicate node id: {0}")]
    DuplicateNode(NodeId),
    /// The graph is executing and cannot be modified.
    #[error("graph {0} is currently executing")]
    GraphBusy(GraphId),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SchedulerError {
    /// Whether retrying the same request later may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientResources { .. } | Self::QueueFull(_)
        )
    }
}

fn format_cycles(cycles: &[Vec<NodeId>]) -> String {
    cycles
        .iter()
        .map(|cycle| cycle.join(" -> "))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
