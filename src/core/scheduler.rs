//! Scheduling facade: graph store plus submit, execute, status and reset.
//!
//! A [`Scheduler`] owns one resource pool, one admission controller and a set
//! of submitted graphs. Several graphs may execute concurrently against the
//! same pool; each graph executes at most once at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::core::admission::AdmissionController;
use crate::core::events::{EventBus, EventKind};
use crate::core::executor::{
    CancelSignal, DependencyGraph, ExecutionOptions, ExecutionSummary, FailureKind, GraphExecutor,
    GraphStatus, NodeFailure, NodeState, NodeWork, ResourceEstimator,
};
use crate::core::graph::{NodeSpec, Resolution};
use crate::core::resource_pool::{BucketSnapshot, ResourcePool};
use crate::core::SchedulerError;
use crate::util::clock::Clock;
use crate::util::types::{GraphId, NodeId};

/// What `submit` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    /// Identifier for later calls.
    pub graph_id: GraphId,
    /// Best-effort topological order.
    pub order: Vec<NodeId>,
    /// Parallel groups, level 0 first.
    pub levels: Vec<Vec<NodeId>>,
    /// Cycles found; empty for a DAG.
    pub cycles: Vec<Vec<NodeId>>,
}

impl SubmitReceipt {
    /// The cycle report as an error, for callers that refuse cyclic graphs.
    pub fn cycle_error(&self) -> Option<SchedulerError> {
        (!self.cycles.is_empty()).then(|| SchedulerError::CycleDetected(self.cycles.clone()))
    }
}

/// One entry of the execution history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    /// Graph that ran.
    pub graph_id: GraphId,
    /// Clock reading at start.
    pub started_at: Duration,
    /// Completed nodes.
    pub completed: usize,
    /// Failed nodes.
    pub failed: usize,
    /// Skipped nodes.
    pub skipped: usize,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Whether the graph timeout fired.
    pub timed_out: bool,
    /// Wall time of the run.
    pub total_wall_time: Duration,
}

struct GraphEntry<P, R> {
    graph: Mutex<DependencyGraph<P, R>>,
    cancel: Mutex<Arc<CancelSignal>>,
    executing: AtomicBool,
}

/// Clears the executing flag on drop.
struct ExecutingGuard<'a>(&'a AtomicBool);

impl<'a> ExecutingGuard<'a> {
    fn acquire(flag: &'a AtomicBool, graph_id: GraphId) -> Result<Self, SchedulerError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SchedulerError::GraphBusy(graph_id))?;
        Ok(Self(flag))
    }
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Explicit scheduler instance owning its pool and graph store.
pub struct Scheduler<P, R> {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    pool: Arc<ResourcePool>,
    admission: Arc<AdmissionController>,
    events: EventBus,
    options: ExecutionOptions,
    graphs: RwLock<HashMap<GraphId, Arc<GraphEntry<P, R>>>>,
    history: Mutex<VecDeque<ExecutionRecord>>,
}

impl<P, R> Scheduler<P, R>
where
    P: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Scheduler with a system clock, no event sink and an in-memory queue.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        crate::builders::SchedulerBuilder::new(config).build()
    }

    pub(crate) fn from_parts(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        admission: Arc<AdmissionController>,
        pool: Arc<ResourcePool>,
        events: EventBus,
    ) -> Self {
        let options = config.execution_options();
        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_limit.min(1024))),
            config,
            clock,
            pool,
            admission,
            events,
            options,
            graphs: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve and store a graph.
    ///
    /// Cycles are reported in the receipt rather than refused. Duplicate ids
    /// and unknown dependencies are usage errors.
    pub fn submit(&self, nodes: Vec<NodeSpec<P>>) -> Result<SubmitReceipt, SchedulerError> {
        let graph_id = GraphId::new();
        let graph = DependencyGraph::build(graph_id, nodes)?;
        let resolution = graph.resolution().clone();
        if resolution.has_cycles() {
            tracing::warn!(graph = %graph_id, cycles = resolution.cycles.len(), "graph submitted with cycles");
        }
        tracing::info!(graph = %graph_id, nodes = resolution.order.len(), levels = resolution.levels.len(), "graph submitted");

        let entry = GraphEntry {
            graph: Mutex::new(graph),
            cancel: Mutex::new(Arc::new(CancelSignal::new())),
            executing: AtomicBool::new(false),
        };
        self.graphs.write().insert(graph_id, Arc::new(entry));
        self.events.emit(
            EventKind::GraphSubmitted,
            Some(graph_id),
            graph_id.to_string(),
            None,
        );

        Ok(SubmitReceipt {
            graph_id,
            order: resolution.order,
            levels: resolution.levels,
            cycles: resolution.cycles,
        })
    }

    /// Execute a stored graph with the configured options.
    ///
    /// Without an estimator nodes are never gated by admission. Node and
    /// admission failures are reported in the summary.
    pub async fn execute(
        &self,
        graph_id: GraphId,
        work: Arc<dyn NodeWork<P, R>>,
        estimator: Option<Arc<dyn ResourceEstimator<P>>>,
    ) -> Result<ExecutionSummary<R>, SchedulerError> {
        self.execute_with(graph_id, work, estimator, self.options.clone())
            .await
    }

    /// Execute a stored graph with explicit options.
    ///
    /// Dropping the returned future abandons the run the same way `cancel`
    /// does.
    pub async fn execute_with(
        &self,
        graph_id: GraphId,
        work: Arc<dyn NodeWork<P, R>>,
        estimator: Option<Arc<dyn ResourceEstimator<P>>>,
        options: ExecutionOptions,
    ) -> Result<ExecutionSummary<R>, SchedulerError> {
        let entry = self.entry(graph_id)?;
        // The fresh signal is installed under the same lock `cancel` holds
        // while it checks the executing flag.
        let (_guard, cancel) = {
            let mut slot = entry.cancel.lock();
            let guard = ExecutingGuard::acquire(&entry.executing, graph_id)?;
            let cancel = Arc::new(CancelSignal::new());
            *slot = Arc::clone(&cancel);
            (guard, cancel)
        };

        let started_at = self.clock.now();
        let executor = GraphExecutor::new(
            Arc::clone(&self.admission),
            Arc::clone(&self.clock),
            self.events.clone(),
            options,
        );
        let summary = executor.run(&entry.graph, &cancel, work, estimator).await;
        self.record(ExecutionRecord {
            graph_id,
            started_at,
            completed: summary.completed,
            failed: summary.failed,
            skipped: summary.skipped,
            cancelled: summary.cancelled,
            timed_out: summary.timed_out,
            total_wall_time: summary.total_wall_time,
        });
        Ok(summary)
    }

    /// Per-state node counts.
    pub fn status(&self, graph_id: GraphId) -> Result<GraphStatus, SchedulerError> {
        Ok(self.entry(graph_id)?.graph.lock().status())
    }

    /// Node states in input order.
    pub fn node_states(&self, graph_id: GraphId) -> Result<Vec<(NodeId, NodeState)>, SchedulerError> {
        let entry = self.entry(graph_id)?;
        let graph = entry.graph.lock();
        Ok(graph
            .nodes()
            .iter()
            .map(|node| (node.id.clone(), node.state))
            .collect())
    }

    /// Resolution computed at submit.
    pub fn resolution(&self, graph_id: GraphId) -> Result<Resolution, SchedulerError> {
        Ok(self.entry(graph_id)?.graph.lock().resolution().clone())
    }

    /// Result of a completed node, if any.
    pub fn result(&self, graph_id: GraphId, node_id: &str) -> Result<Option<R>, SchedulerError> {
        let entry = self.entry(graph_id)?;
        let graph = entry.graph.lock();
        Ok(graph.node(node_id).and_then(|node| node.result.clone()))
    }

    /// Put every node back to Pending and release the graph's allocations.
    /// Idempotent; fails with `GraphBusy` while executing.
    pub fn reset(&self, graph_id: GraphId) -> Result<(), SchedulerError> {
        let entry = self.entry(graph_id)?;
        let _guard = ExecutingGuard::acquire(&entry.executing, graph_id)?;
        entry.graph.lock().reset_nodes();
        let released = self.admission.release_graph(graph_id);
        tracing::info!(graph = %graph_id, released, "graph reset");
        Ok(())
    }

    /// Cancel a graph. Idempotent and safe at any point.
    ///
    /// While executing, the run stops, its non-terminal nodes become Skipped
    /// and its allocations are released before `execute` returns. Otherwise
    /// the same transition happens immediately.
    pub fn cancel(&self, graph_id: GraphId) -> Result<(), SchedulerError> {
        let entry = self.entry(graph_id)?;
        let slot = entry.cancel.lock();
        match ExecutingGuard::acquire(&entry.executing, graph_id) {
            Err(_) => {
                tracing::info!(graph = %graph_id, "cancelling running graph");
                slot.cancel();
            }
            Ok(_guard) => {
                drop(slot);
                let failure = NodeFailure::new(FailureKind::Cancelled, "graph cancelled");
                let skipped = entry
                    .graph
                    .lock()
                    .skip_unfinished(&failure, self.clock.now());
                self.admission.release_graph(graph_id);
                if !skipped.is_empty() {
                    for node_id in skipped {
                        self.events.emit(
                            EventKind::NodeSkipped,
                            Some(graph_id),
                            node_id,
                            Some(failure.message.clone()),
                        );
                    }
                    self.events.emit(
                        EventKind::GraphCancelled,
                        Some(graph_id),
                        graph_id.to_string(),
                        None,
                    );
                }
            }
        }
        Ok(())
    }

    /// Drop a stored graph and release its allocations.
    pub fn remove(&self, graph_id: GraphId) -> Result<(), SchedulerError> {
        let entry = self.entry(graph_id)?;
        let _guard = ExecutingGuard::acquire(&entry.executing, graph_id)?;
        self.graphs.write().remove(&graph_id);
        self.admission.release_graph(graph_id);
        tracing::debug!(graph = %graph_id, "graph removed");
        Ok(())
    }

    /// Ids of stored graphs.
    pub fn graph_ids(&self) -> Vec<GraphId> {
        self.graphs.read().keys().copied().collect()
    }

    /// Bucket snapshots, sorted by resource type.
    pub fn resources(&self) -> Vec<BucketSnapshot> {
        self.pool.snapshot()
    }

    /// Execution history, oldest first.
    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Shared resource pool.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// Admission controller shared by every graph.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Configuration in effect.
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Default execution options.
    pub const fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Injected clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn entry(&self, graph_id: GraphId) -> Result<Arc<GraphEntry<P, R>>, SchedulerError> {
        self.graphs
            .read()
            .get(&graph_id)
            .cloned()
            .ok_or(SchedulerError::UnknownGraph(graph_id))
    }

    fn record(&self, record: ExecutionRecord) {
        let mut history = self.history.lock();
        if history.len() >= self.config.history_limit.max(1) {
            history.pop_front();
        }
        history.push_back(record);
    }
}

impl<P, R> std::fmt::Debug for Scheduler<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("graphs", &self.graphs.read().len())
            .field("admission", &self.admission)
            .finish_non_exhaustive()
    }
}
