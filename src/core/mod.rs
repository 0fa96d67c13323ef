//! Core scheduling: resource accounting, admission, resolution and execution.

pub mod admission;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod resource_pool;
pub mod scheduler;

pub use admission::{
    AdmissionController, AdmissionDecision, Allocation, AllocationId, AllocationRequest,
    QueuedRequest, TaskQueue, DEFAULT_PREEMPTION_THRESHOLD, DEFAULT_STALE_AFTER,
};
pub use error::{AppResult, SchedulerError};
pub use events::{EventBus, EventKind, EventSink, InMemoryEventSink, SchedulerEvent, TracingEventSink};
pub use executor::{
    admission_task_id, work_fn, CancelSignal, DependencyGraph, ExecutionOptions, ExecutionSummary,
    FailureKind, FnWork, GraphExecutor, GraphNode, GraphStatus, NodeFailure, NodeState, NodeTiming,
    NodeWork, ResourceEstimator,
};
pub use graph::{resolve, GraphIndex, NodeSpec, Resolution};
pub use resource_pool::{BucketSnapshot, ResourceBucket, ResourcePool, Shortfall};
pub use scheduler::{ExecutionRecord, Scheduler, SubmitReceipt};
