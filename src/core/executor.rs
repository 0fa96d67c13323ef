//! Graph execution: per-node state machine driven level by level.
//!
//! Nodes in one level run concurrently on the tokio runtime, each inside its
//! own task so a blocked work function never stalls its siblings. A level
//! starts only after every node of the previous level is terminal. Failures
//! and skips propagate to all transitive dependents in one breadth-first pass.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::core::admission::{
    AdmissionController, AdmissionDecision, Allocation, AllocationId, AllocationRequest,
};
use crate::core::events::{EventBus, EventKind};
use crate::core::graph::{GraphIndex, NodeSpec, Resolution};
use crate::core::SchedulerError;
use crate::util::clock::Clock;
use crate::util::types::{GraphId, NodeId};

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting for dependencies or admission.
    Pending,
    /// Work function is executing.
    Running,
    /// Work function returned a result.
    Completed,
    /// Work function failed, timed out, or admission was refused for good.
    Failed,
    /// Never run because a dependency did not complete or the run was cancelled.
    Skipped,
}

impl NodeState {
    /// Completed, Failed and Skipped are terminal.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        })
    }
}

/// Category of a node failure or skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The work function returned an error or panicked.
    Execution,
    /// Node or graph deadline elapsed.
    Timeout,
    /// The node's request can never fit.
    BudgetExceeded,
    /// The node requested an unconfigured resource.
    UnknownResource,
    /// Admission retries ran out.
    InsufficientResources,
    /// A dependency failed or was skipped.
    DependencyFailed,
    /// A dependency sits on a cycle and could not finish first.
    DependencyCycle,
    /// The run was cancelled.
    Cancelled,
}

impl FailureKind {
    /// Classify an admission error.
    pub const fn from_error(err: &SchedulerError) -> Self {
        match err {
            SchedulerError::BudgetExceeded { .. } => Self::BudgetExceeded,
            SchedulerError::UnknownResource(_) => Self::UnknownResource,
            SchedulerError::InsufficientResources { .. } | SchedulerError::QueueFull(_) => {
                Self::InsufficientResources
            }
            SchedulerError::Timeout { .. } => Self::Timeout,
            _ => Self::Execution,
        }
    }
}

/// Error payload stored on a failed or skipped node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    /// Category.
    pub kind: FailureKind,
    /// Human-readable reason.
    pub message: String,
}

impl NodeFailure {
    /// Build a failure.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Failure describing an admission error.
    pub fn from_error(err: &SchedulerError) -> Self {
        Self::new(FailureKind::from_error(err), err.to_string())
    }
}

/// A node with its runtime state.
#[derive(Debug, Clone)]
pub struct GraphNode<P, R> {
    /// Node identifier.
    pub id: NodeId,
    /// Opaque payload.
    pub payload: P,
    /// Declared dependencies.
    pub dependencies: Vec<NodeId>,
    /// Current state.
    pub state: NodeState,
    /// Result once Completed.
    pub result: Option<R>,
    /// Reason once Failed or Skipped.
    pub failure: Option<NodeFailure>,
    /// Clock reading when the node last started running.
    pub started_at: Option<Duration>,
    /// Clock reading when the node reached a terminal state.
    pub finished_at: Option<Duration>,
    /// Number of times the work function was started.
    pub attempts: u32,
}

impl<P, R> GraphNode<P, R> {
    fn reset(&mut self) {
        self.state = NodeState::Pending;
        self.result = None;
        self.failure = None;
        self.started_at = None;
        self.finished_at = None;
        self.attempts = 0;
    }
}

/// Per-state node counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatus {
    /// Pending nodes.
    pub pending: usize,
    /// Running nodes.
    pub running: usize,
    /// Completed nodes.
    pub completed: usize,
    /// Failed nodes.
    pub failed: usize,
    /// Skipped nodes.
    pub skipped: usize,
}

impl GraphStatus {
    /// Total nodes.
    pub const fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.skipped
    }

    /// Whether every node is terminal.
    pub const fn is_finished(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Stored graph: nodes in input order plus their resolution.
#[derive(Debug)]
pub struct DependencyGraph<P, R> {
    id: GraphId,
    nodes: Vec<GraphNode<P, R>>,
    index: GraphIndex,
    resolution: Resolution,
    levels: Vec<Vec<usize>>,
}

impl<P, R> DependencyGraph<P, R> {
    /// Validate and resolve submitted nodes.
    pub fn build(id: GraphId, specs: Vec<NodeSpec<P>>) -> Result<Self, SchedulerError> {
        let index = GraphIndex::build(
            specs
                .iter()
                .map(|spec| (spec.id.as_str(), spec.dependencies.as_slice())),
        )?;
        let (order, levels, cycles) = index.resolve_indices();
        let names = |indices: &[usize]| -> Vec<NodeId> {
            indices.iter().map(|i| index.id(*i).to_string()).collect()
        };
        let resolution = Resolution {
            order: names(&order),
            levels: levels.iter().map(|level| names(level)).collect(),
            cycles: cycles.iter().map(|cycle| names(cycle)).collect(),
        };
        let nodes = specs
            .into_iter()
            .map(|spec| GraphNode {
                id: spec.id,
                payload: spec.payload,
                dependencies: spec.dependencies,
                state: NodeState::Pending,
                result: None,
                failure: None,
                started_at: None,
                finished_at: None,
                attempts: 0,
            })
            .collect();
        Ok(Self {
            id,
            nodes,
            index,
            resolution,
            levels,
        })
    }

    /// Graph identifier.
    pub const fn id(&self) -> GraphId {
        self.id
    }

    /// Order, levels and cycles computed at submit.
    pub const fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// Nodes in input order.
    pub fn nodes(&self) -> &[GraphNode<P, R>] {
        &self.nodes
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&GraphNode<P, R>> {
        self.index.position(id).map(|i| &self.nodes[i])
    }

    /// Per-state counts.
    pub fn status(&self) -> GraphStatus {
        let mut status = GraphStatus::default();
        for node in &self.nodes {
            match node.state {
                NodeState::Pending => status.pending += 1,
                NodeState::Running => status.running += 1,
                NodeState::Completed => status.completed += 1,
                NodeState::Failed => status.failed += 1,
                NodeState::Skipped => status.skipped += 1,
            }
        }
        status
    }

    /// Put every node back to Pending.
    pub fn reset_nodes(&mut self) {
        for node in &mut self.nodes {
            node.reset();
        }
    }

    /// Move every non-terminal node to Skipped with `failure`, returning the
    /// affected ids in input order.
    pub(crate) fn skip_unfinished(&mut self, failure: &NodeFailure, now: Duration) -> Vec<NodeId> {
        let mut skipped = Vec::new();
        for node in &mut self.nodes {
            if node.state.is_terminal() {
                continue;
            }
            node.state = NodeState::Skipped;
            node.finished_at = Some(now);
            node.failure = Some(failure.clone());
            skipped.push(node.id.clone());
        }
        skipped
    }
}

/// Caller-supplied work for one node.
#[async_trait]
pub trait NodeWork<P, R>: Send + Sync + 'static
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Run a node given the results of its dependencies.
    async fn run(
        &self,
        node_id: NodeId,
        payload: P,
        dependency_results: BTreeMap<NodeId, R>,
    ) -> anyhow::Result<R>;
}

/// [`NodeWork`] adapter over an async closure.
pub struct FnWork<F>(F);

/// Wrap an async closure as node work.
pub fn work_fn<P, R, F, Fut>(f: F) -> Arc<dyn NodeWork<P, R>>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(NodeId, P, BTreeMap<NodeId, R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Arc::new(FnWork(f))
}

#[async_trait]
impl<P, R, F, Fut> NodeWork<P, R> for FnWork<F>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(NodeId, P, BTreeMap<NodeId, R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    async fn run(
        &self,
        node_id: NodeId,
        payload: P,
        dependency_results: BTreeMap<NodeId, R>,
    ) -> anyhow::Result<R> {
        (self.0)(node_id, payload, dependency_results).await
    }
}

/// Maps a node to the resources it needs. Without an estimator nodes are
/// never gated.
pub trait ResourceEstimator<P>: Send + Sync + 'static {
    /// Build the admission request for a node. `task_id` and `graph_id` are
    /// overwritten by the executor.
    fn estimate(&self, node_id: &str, payload: &P) -> AllocationRequest;
}

impl<P, F> ResourceEstimator<P> for F
where
    F: Fn(&str, &P) -> AllocationRequest + Send + Sync + 'static,
{
    fn estimate(&self, node_id: &str, payload: &P) -> AllocationRequest {
        self(node_id, payload)
    }
}

/// Knobs for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Wall-clock limit for the whole run; expiry cancels it.
    pub graph_timeout: Option<Duration>,
    /// Wall-clock limit per node; expiry fails the node.
    pub node_timeout: Option<Duration>,
    /// Admission attempts allowed after the first; `None` retries until the
    /// graph timeout.
    pub max_admission_retries: Option<u32>,
    /// Upper bound between admission retries.
    pub retry_interval: Duration,
    /// Maximum nodes running at once within a level.
    pub max_parallel: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            graph_timeout: None,
            node_timeout: None,
            max_admission_retries: None,
            retry_interval: Duration::from_millis(25),
            max_parallel: num_cpus::get().max(1),
        }
    }
}

impl ExecutionOptions {
    /// Set the graph timeout.
    #[must_use]
    pub const fn with_graph_timeout(mut self, timeout: Duration) -> Self {
        self.graph_timeout = Some(timeout);
        self
    }

    /// Set the per-node timeout.
    #[must_use]
    pub const fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    /// Bound admission retries.
    #[must_use]
    pub const fn with_max_admission_retries(mut self, retries: u32) -> Self {
        self.max_admission_retries = Some(retries);
        self
    }

    /// Set the retry interval.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the per-level parallelism cap.
    #[must_use]
    pub const fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }
}

/// Start and end of a node's last run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeTiming {
    /// Clock reading at start.
    pub started_at: Duration,
    /// Clock reading at the terminal transition.
    pub finished_at: Duration,
}

impl NodeTiming {
    /// Time spent running.
    pub const fn elapsed(&self) -> Duration {
        self.finished_at.saturating_sub(self.started_at)
    }
}

/// What `execute` returns. Always produced, even when every node fails.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary<R> {
    /// Graph that ran.
    pub graph_id: GraphId,
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
    /// Timing of every node that started.
    pub per_node_timing: BTreeMap<NodeId, NodeTiming>,
    /// Wall time of the run per the scheduler clock.
    pub total_wall_time: Duration,
    /// Results of completed nodes.
    pub results: BTreeMap<NodeId, R>,
    /// Reasons for failed and skipped nodes, including admission errors.
    pub failures: BTreeMap<NodeId, NodeFailure>,
}

/// Cancellation flag shared between a run and its callers.
#[derive(Debug, Default)]
pub struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    /// Fresh, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

enum Admit<P, R> {
    Start(Launch<P, R>),
    Wait(Option<Duration>),
    Settled,
}

struct Launch<P, R> {
    index: usize,
    node_id: NodeId,
    payload: P,
    inputs: BTreeMap<NodeId, R>,
    allocation: Option<Allocation>,
}

enum NodeOutcome<R> {
    Completed(R),
    Failed(NodeFailure),
    Preempted,
}

type Finished<R> = (usize, Option<AllocationId>, NodeOutcome<R>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunExit {
    Finished,
    Cancelled,
    TimedOut,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Cleans up a run whose future was dropped before it finished: unfinished
/// nodes become Skipped and the graph's allocations go back to the pool.
struct AbandonOnDrop<'a, P, R> {
    executor: &'a GraphExecutor,
    graph: &'a Mutex<DependencyGraph<P, R>>,
    graph_id: GraphId,
    armed: bool,
}

impl<P, R> AbandonOnDrop<'_, P, R> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<P, R> Drop for AbandonOnDrop<'_, P, R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(graph = %self.graph_id, "graph execution dropped before finishing");
        self.executor.abandon(
            self.graph,
            NodeFailure::new(FailureKind::Cancelled, "graph run dropped"),
        );
        self.executor.admission.release_graph(self.graph_id);
    }
}

/// Drives one graph run.
pub struct GraphExecutor {
    admission: Arc<AdmissionController>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    options: ExecutionOptions,
}

impl GraphExecutor {
    /// Executor gating nodes through `admission`.
    pub fn new(
        admission: Arc<AdmissionController>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            admission,
            clock,
            events,
            options,
        }
    }

    /// Options in effect.
    pub const fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Run every level of `graph` and summarize.
    pub async fn run<P, R>(
        &self,
        graph: &Mutex<DependencyGraph<P, R>>,
        cancel: &CancelSignal,
        work: Arc<dyn NodeWork<P, R>>,
        estimator: Option<Arc<dyn ResourceEstimator<P>>>,
    ) -> ExecutionSummary<R>
    where
        P: Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let started_at = self.clock.now();
        let deadline = self.options.graph_timeout.map(|limit| Instant::now() + limit);
        let (graph_id, levels) = {
            let g = graph.lock();
            (g.id, g.levels.clone())
        };
        tracing::info!(graph = %graph_id, levels = levels.len(), "graph execution started");
        let on_drop = AbandonOnDrop {
            executor: self,
            graph,
            graph_id,
            armed: true,
        };

        let mut exit = RunExit::Finished;
        for (depth, level) in levels.iter().enumerate() {
            exit = self
                .run_level(graph, level, cancel, deadline, &work, estimator.as_ref())
                .await;
            if exit != RunExit::Finished {
                break;
            }
            self.sweep_level(graph, level);
            tracing::debug!(graph = %graph_id, level = depth, "level finished");
        }

        match exit {
            RunExit::Finished => {}
            RunExit::Cancelled => {
                tracing::warn!(graph = %graph_id, "graph execution cancelled");
                self.abandon(graph, NodeFailure::new(FailureKind::Cancelled, "graph run cancelled"));
            }
            RunExit::TimedOut => {
                let after = self.options.graph_timeout.unwrap_or_default();
                let err = SchedulerError::Timeout {
                    scope: format!("graph {graph_id}"),
                    after,
                };
                tracing::warn!(graph = %graph_id, "{err}");
                self.abandon(graph, NodeFailure::new(FailureKind::Timeout, err.to_string()));
            }
        }
        on_drop.disarm();
        let leftover = self.admission.release_graph(graph_id);
        if leftover > 0 {
            tracing::debug!(graph = %graph_id, leftover, "released leftover allocations");
        }

        let finished_at = self.clock.now();
        let summary = summarize(
            &graph.lock(),
            finished_at.saturating_sub(started_at),
            exit,
        );
        tracing::info!(
            graph = %graph_id,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "graph execution finished"
        );
        summary
    }

    async fn run_level<P, R>(
        &self,
        graph: &Mutex<DependencyGraph<P, R>>,
        level: &[usize],
        cancel: &CancelSignal,
        deadline: Option<Instant>,
        work: &Arc<dyn NodeWork<P, R>>,
        estimator: Option<&Arc<dyn ResourceEstimator<P>>>,
    ) -> RunExit
    where
        P: Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let mut waiting: VecDeque<usize> = level.iter().copied().collect();
        let mut retries: HashMap<usize, u32> = HashMap::new();
        let mut running: JoinSet<Finished<R>> = JoinSet::new();
        let parallel = self.options.max_parallel.max(1);

        loop {
            if cancel.is_cancelled() {
                running.shutdown().await;
                return RunExit::Cancelled;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                running.shutdown().await;
                return RunExit::TimedOut;
            }

            // Registered before the pass so a release during it is not missed.
            let released = self.admission.capacity_released();
            let mut blocked = false;
            let mut hint: Option<Duration> = None;
            for _ in 0..waiting.len() {
                let Some(index) = waiting.pop_front() else {
                    break;
                };
                if running.len() >= parallel {
                    waiting.push_back(index);
                    continue;
                }
                match self.admit(graph, index, estimator, &mut retries) {
                    Admit::Start(launch) => self.launch(&mut running, launch, work),
                    Admit::Wait(wait) => {
                        blocked = true;
                        if let Some(wait) = wait.filter(|w| !w.is_zero()) {
                            hint = Some(hint.map_or(wait, |h| h.min(wait)));
                        }
                        waiting.push_back(index);
                    }
                    Admit::Settled => {}
                }
            }

            if running.is_empty() && waiting.is_empty() {
                return RunExit::Finished;
            }

            let retry_in = hint
                .map_or(self.options.retry_interval, |h| h.min(self.options.retry_interval))
                .max(Duration::from_millis(1));
            let waiting_on_admission = !waiting.is_empty() && (blocked || running.is_empty());

            tokio::select! {
                joined = running.join_next(), if !running.is_empty() => {
                    if let Some(joined) = joined {
                        if let Some(index) = self.settle(graph, joined) {
                            waiting.push_back(index);
                        }
                    }
                }
                () = released, if waiting_on_admission => {}
                () = tokio::time::sleep(retry_in), if waiting_on_admission => {}
                () = cancel.cancelled() => {}
                () = sleep_until(deadline) => {}
            }
        }
    }

    /// Decide what to do with a Pending node on this pass.
    fn admit<P, R>(
        &self,
        graph: &Mutex<DependencyGraph<P, R>>,
        index: usize,
        estimator: Option<&Arc<dyn ResourceEstimator<P>>>,
        retries: &mut HashMap<usize, u32>,
    ) -> Admit<P, R>
    where
        P: Clone + 'static,
        R: Clone + 'static,
    {
        let (graph_id, node_id, payload, inputs) = {
            let mut g = graph.lock();
            if g.nodes[index].state != NodeState::Pending {
                return Admit::Settled;
            }

            let mut inputs = BTreeMap::new();
            let mut failed_dep = None;
            let mut unfinished_dep = None;
            for &dep in g.index.dependencies(index) {
                let node = &g.nodes[dep];
                match node.state {
                    NodeState::Completed => {
                        if let Some(result) = node.result.as_ref() {
                            inputs.insert(node.id.clone(), result.clone());
                        }
                    }
                    NodeState::Failed | NodeState::Skipped => {
                        failed_dep = Some(dep);
                        break;
                    }
                    NodeState::Pending | NodeState::Running => {
                        unfinished_dep.get_or_insert(dep);
                    }
                }
            }

            if let Some(dep) = failed_dep {
                let failure = NodeFailure::new(
                    FailureKind::DependencyFailed,
                    format!("dependency `{}` {}", g.nodes[dep].id, g.nodes[dep].state),
                );
                self.skip(&mut g, index, failure);
                return Admit::Settled;
            }
            if let Some(dep) = unfinished_dep {
                let failure = NodeFailure::new(
                    FailureKind::DependencyCycle,
                    format!("dependency `{}` is on a cycle with this node", g.nodes[dep].id),
                );
                self.skip(&mut g, index, failure);
                return Admit::Settled;
            }

            let node = &g.nodes[index];
            (g.id, node.id.clone(), node.payload.clone(), inputs)
        };

        let allocation = match estimator {
            None => None,
            Some(estimator) => {
                let mut request = estimator.estimate(&node_id, &payload);
                request.task_id = admission_task_id(graph_id, &node_id);
                request.graph_id = Some(graph_id);
                let task_id = request.task_id.clone();
                match self.admission.request(request) {
                    AdmissionDecision::Granted(allocation) => Some(allocation),
                    AdmissionDecision::Queued { wait_time, .. } => {
                        return self.defer(graph, index, &task_id, retries, wait_time);
                    }
                    AdmissionDecision::Rejected(err) if err.is_retryable() => {
                        return self.defer(graph, index, &task_id, retries, None);
                    }
                    AdmissionDecision::Rejected(err) => {
                        self.fail(&mut graph.lock(), index, NodeFailure::from_error(&err));
                        return Admit::Settled;
                    }
                }
            }
        };

        let now = self.clock.now();
        {
            let mut g = graph.lock();
            let node = &mut g.nodes[index];
            node.state = NodeState::Running;
            node.started_at = Some(now);
            node.finished_at = None;
            node.attempts += 1;
        }
        tracing::info!(graph = %graph_id, node = %node_id, "node started");
        self.events
            .emit(EventKind::NodeStarted, Some(graph_id), node_id.clone(), None);

        Admit::Start(Launch {
            index,
            node_id,
            payload,
            inputs,
            allocation,
        })
    }

    fn defer<P, R>(
        &self,
        graph: &Mutex<DependencyGraph<P, R>>,
        index: usize,
        task_id: &str,
        retries: &mut HashMap<usize, u32>,
        wait: Option<Duration>,
    ) -> Admit<P, R> {
        let attempts = retries.entry(index).or_insert(0);
        *attempts += 1;
        if let Some(limit) = self.options.max_admission_retries {
            if *attempts > limit {
                self.admission.withdraw(task_id);
                let failure = NodeFailure::new(
                    FailureKind::InsufficientResources,
                    format!("admission not granted after {limit} retries"),
                );
                self.fail(&mut graph.lock(), index, failure);
                return Admit::Settled;
            }
        }
        Admit::Wait(wait)
    }

    fn launch<P, R>(
        &self,
        running: &mut JoinSet<Finished<R>>,
        launch: Launch<P, R>,
        work: &Arc<dyn NodeWork<P, R>>,
    ) where
        P: Send + 'static,
        R: Send + 'static,
    {
        let Launch {
            index,
            node_id,
            payload,
            inputs,
            allocation,
        } = launch;
        let work = Arc::clone(work);
        let node_timeout = self.options.node_timeout;
        let allocation_id = allocation.as_ref().map(|a| a.id);
        let revocation = allocation
            .as_ref()
            .filter(|a| a.preemptable)
            .map(Allocation::revocation);

        running.spawn(async move {
            let outcome = run_node(work, node_id, payload, inputs, node_timeout, revocation).await;
            (index, allocation_id, outcome)
        });
    }

    /// Record a finished node task. Returns the index when it must be retried.
    fn settle<P, R>(
        &self,
        graph: &Mutex<DependencyGraph<P, R>>,
        joined: Result<Finished<R>, JoinError>,
    ) -> Option<usize> {
        let (index, allocation_id, outcome) = match joined {
            Ok(finished) => finished,
            Err(err) => {
                tracing::error!("node task ended abnormally: {err}");
                return None;
            }
        };
        if let Some(id) = allocation_id {
            self.admission.release(id);
        }

        let mut g = graph.lock();
        let graph_id = g.id;
        match outcome {
            NodeOutcome::Completed(result) => {
                let now = self.clock.now();
                let node = &mut g.nodes[index];
                node.state = NodeState::Completed;
                node.result = Some(result);
                node.finished_at = Some(now);
                tracing::info!(graph = %graph_id, node = %node.id, "node completed");
                self.events
                    .emit(EventKind::NodeCompleted, Some(graph_id), node.id.clone(), None);
                None
            }
            NodeOutcome::Failed(failure) => {
                self.fail(&mut g, index, failure);
                None
            }
            NodeOutcome::Preempted => {
                let node = &mut g.nodes[index];
                node.state = NodeState::Pending;
                node.started_at = None;
                tracing::warn!(graph = %graph_id, node = %node.id, "node preempted, will retry");
                Some(index)
            }
        }
    }

    /// Nodes whose task vanished are failed so the level stays accounted.
    fn sweep_level<P, R>(&self, graph: &Mutex<DependencyGraph<P, R>>, level: &[usize]) {
        let mut g = graph.lock();
        for &index in level {
            if g.nodes[index].state == NodeState::Running {
                self.fail(
                    &mut g,
                    index,
                    NodeFailure::new(FailureKind::Execution, "execution task aborted"),
                );
            }
        }
    }

    fn fail<P, R>(&self, graph: &mut DependencyGraph<P, R>, index: usize, failure: NodeFailure) {
        let now = self.clock.now();
        let node = &mut graph.nodes[index];
        node.state = NodeState::Failed;
        node.finished_at = Some(now);
        tracing::warn!(graph = %graph.id, node = %node.id, "node failed: {}", failure.message);
        self.events.emit(
            EventKind::NodeFailed,
            Some(graph.id),
            node.id.clone(),
            Some(failure.message.clone()),
        );
        node.failure = Some(failure);
        self.propagate(graph, index);
    }

    fn skip<P, R>(&self, graph: &mut DependencyGraph<P, R>, index: usize, failure: NodeFailure) {
        self.mark_skipped(graph, index, failure);
        self.propagate(graph, index);
    }

    fn mark_skipped<P, R>(&self, graph: &mut DependencyGraph<P, R>, index: usize, failure: NodeFailure) {
        let now = self.clock.now();
        let node = &mut graph.nodes[index];
        node.state = NodeState::Skipped;
        node.finished_at = Some(now);
        tracing::info!(graph = %graph.id, node = %node.id, "node skipped: {}", failure.message);
        self.events.emit(
            EventKind::NodeSkipped,
            Some(graph.id),
            node.id.clone(),
            Some(failure.message.clone()),
        );
        node.failure = Some(failure);
    }

    /// Skip every Pending transitive dependent of `origin`, visiting each once.
    fn propagate<P, R>(&self, graph: &mut DependencyGraph<P, R>, origin: usize) {
        let origin_id = graph.nodes[origin].id.clone();
        let mut visited = vec![false; graph.nodes.len()];
        visited[origin] = true;
        let mut frontier: VecDeque<usize> = graph.index.dependents(origin).iter().copied().collect();

        while let Some(index) = frontier.pop_front() {
            if visited[index] {
                continue;
            }
            visited[index] = true;
            if graph.nodes[index].state != NodeState::Pending {
                continue;
            }
            let failure = NodeFailure::new(
                FailureKind::DependencyFailed,
                format!("upstream `{origin_id}` did not complete"),
            );
            self.mark_skipped(graph, index, failure);
            frontier.extend(graph.index.dependents(index).iter().copied());
        }
    }

    /// Move every non-terminal node to Skipped.
    fn abandon<P, R>(&self, graph: &Mutex<DependencyGraph<P, R>>, failure: NodeFailure) {
        let (graph_id, skipped) = {
            let mut g = graph.lock();
            (g.id, g.skip_unfinished(&failure, self.clock.now()))
        };
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
            Some(failure.message),
        );
    }
}

impl fmt::Debug for GraphExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphExecutor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Task id used for a node's admission requests.
pub fn admission_task_id(graph_id: GraphId, node_id: &str) -> String {
    format!("{graph_id}/{node_id}")
}

async fn run_node<P, R>(
    work: Arc<dyn NodeWork<P, R>>,
    node_id: NodeId,
    payload: P,
    inputs: BTreeMap<NodeId, R>,
    node_timeout: Option<Duration>,
    revocation: Option<Arc<Notify>>,
) -> NodeOutcome<R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    let label = node_id.clone();
    // Nested task: a panic surfaces as a JoinError instead of tearing down
    // the level, and dropping the guard aborts the work on timeout or cancel.
    let mut task = AbortOnDrop(tokio::spawn(async move {
        work.run(node_id, payload, inputs).await
    }));

    let finished = async {
        match (&mut task.0).await {
            Ok(Ok(result)) => NodeOutcome::Completed(result),
            Ok(Err(err)) => {
                NodeOutcome::Failed(NodeFailure::new(FailureKind::Execution, format!("{err:#}")))
            }
            Err(err) if err.is_panic() => NodeOutcome::Failed(NodeFailure::new(
                FailureKind::Execution,
                "work function panicked",
            )),
            Err(err) => NodeOutcome::Failed(NodeFailure::new(FailureKind::Execution, err.to_string())),
        }
    };
    let bounded = async {
        match node_timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.unwrap_or_else(|_| {
                let err = SchedulerError::Timeout {
                    scope: format!("node {label}"),
                    after: limit,
                };
                NodeOutcome::Failed(NodeFailure::new(FailureKind::Timeout, err.to_string()))
            }),
            None => finished.await,
        }
    };

    match revocation {
        Some(revoked) => tokio::select! {
            outcome = bounded => outcome,
            () = revoked.notified() => NodeOutcome::Preempted,
        },
        None => bounded.await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn summarize<P, R: Clone>(
    graph: &DependencyGraph<P, R>,
    total_wall_time: Duration,
    exit: RunExit,
) -> ExecutionSummary<R> {
    let status = graph.status();
    let mut per_node_timing = BTreeMap::new();
    let mut results = BTreeMap::new();
    let mut failures = BTreeMap::new();
    for node in &graph.nodes {
        if let (Some(started_at), Some(finished_at)) = (node.started_at, node.finished_at) {
            per_node_timing.insert(
                node.id.clone(),
                NodeTiming {
                    started_at,
                    finished_at,
                },
            );
        }
        if let Some(result) = node.result.as_ref() {
            results.insert(node.id.clone(), result.clone());
        }
        if let Some(failure) = node.failure.as_ref() {
            failures.insert(node.id.clone(), failure.clone());
        }
    }
    ExecutionSummary {
        graph_id: graph.id,
        completed: status.completed,
        failed: status.failed,
        skipped: status.skipped,
        cancelled: exit == RunExit::Cancelled,
        timed_out: exit == RunExit::TimedOut,
        per_node_timing,
        total_wall_time,
        results,
        failures,
    }
}
