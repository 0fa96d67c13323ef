//! Admission control over the resource pool.
//!
//! A request is either granted (all of its needs reserved at once), parked in
//! the wait queue, or rejected. High-priority requests may reclaim resources
//! from one lower-priority preemptable allocation before they queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::core::events::{EventBus, EventKind};
use crate::core::resource_pool::{ResourcePool, Shortfall};
use crate::core::SchedulerError;
use crate::util::clock::Clock;
use crate::util::types::{GraphId, Priority, ResourceType};

/// Priority at or above which a short request may preempt.
pub const DEFAULT_PREEMPTION_THRESHOLD: Priority = Priority::new(8);

/// Queued requests not retried for this long are dropped from the queue.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Identifier of an active allocation.
pub type AllocationId = u64;

/// What a task needs before it may start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Requesting task; at most one queue entry exists per task id.
    pub task_id: String,
    /// Graph the task belongs to, used to release everything on reset/cancel.
    #[serde(default)]
    pub graph_id: Option<GraphId>,
    /// Queue and preemption priority.
    #[serde(default)]
    pub priority: Priority,
    /// Amount needed per resource type.
    #[serde(default)]
    pub resource_needs: BTreeMap<ResourceType, f64>,
    /// Expected hold time; zero means the allocation never expires.
    #[serde(default)]
    pub duration_estimate: Duration,
    /// Whether a higher-priority request may reclaim this allocation.
    #[serde(default)]
    pub preemptable: bool,
}

impl AllocationRequest {
    /// Request with no needs at normal priority.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            graph_id: None,
            priority: Priority::NORMAL,
            resource_needs: BTreeMap::new(),
            duration_estimate: Duration::ZERO,
            preemptable: false,
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Add a resource need.
    #[must_use]
    pub fn with_need(mut self, resource: ResourceType, amount: f64) -> Self {
        self.resource_needs.insert(resource.normalized(), amount);
        self
    }

    /// Set the expected hold time.
    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_estimate = duration;
        self
    }

    /// Mark as preemptable.
    #[must_use]
    pub const fn preemptable(mut self, preemptable: bool) -> Self {
        self.preemptable = preemptable;
        self
    }

    /// Attach to a graph.
    #[must_use]
    pub const fn for_graph(mut self, graph_id: GraphId) -> Self {
        self.graph_id = Some(graph_id);
        self
    }

    fn effective_needs(&self) -> BTreeMap<ResourceType, f64> {
        self.resource_needs
            .iter()
            .filter(|(_, amount)| **amount > 0.0)
            .map(|(resource, amount)| (resource.clone(), *amount))
            .collect()
    }
}

/// Resources held by a task until released.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Allocation identifier.
    pub id: AllocationId,
    /// Task the allocation was granted to.
    pub task_id: String,
    /// Owning graph, if any.
    pub graph_id: Option<GraphId>,
    /// Priority of the originating request.
    pub priority: Priority,
    /// Whether the allocation may be preempted.
    pub preemptable: bool,
    /// Exact amounts reserved.
    pub resources: BTreeMap<ResourceType, f64>,
    /// Clock reading at grant.
    pub granted_at: Duration,
    /// Clock reading after which the allocation is reclaimed.
    pub expires_at: Option<Duration>,
    revocation: Arc<Notify>,
}

impl Allocation {
    /// Handle notified once if this allocation is preempted.
    pub fn revocation(&self) -> Arc<Notify> {
        Arc::clone(&self.revocation)
    }
}

/// A request waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    /// Original request.
    pub request: AllocationRequest,
    /// Clock reading when first queued.
    pub enqueued_at: Duration,
    /// Clock reading of the most recent retry.
    pub last_seen: Duration,
}

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    /// Everything was reserved.
    Granted(Allocation),
    /// Parked until capacity frees up.
    Queued {
        /// Zero-based queue position.
        position: usize,
        /// Estimated wait for refill; `None` when only a release can help.
        wait_time: Option<Duration>,
        /// Resources that were short at the check.
        shortfalls: Vec<Shortfall>,
    },
    /// Refused.
    Rejected(SchedulerError),
}

impl AdmissionDecision {
    /// Whether resources were granted.
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    /// Granted allocation, if any.
    pub const fn allocation(&self) -> Option<&Allocation> {
        match self {
            Self::Granted(allocation) => Some(allocation),
            _ => None,
        }
    }
}

/// Abstraction for wait-queue backends.
///
/// Entries are ordered by priority (highest first) and FIFO within a
/// priority.
pub trait TaskQueue: Send {
    /// Insert a request and return its position.
    fn enqueue(&mut self, entry: QueuedRequest) -> Result<usize, SchedulerError>;
    /// Remove the entry for a task.
    fn remove(&mut self, task_id: &str) -> Option<QueuedRequest>;
    /// Remove every entry owned by a graph.
    fn remove_graph(&mut self, graph_id: GraphId) -> Vec<QueuedRequest>;
    /// Position of a task's entry.
    fn position(&self, task_id: &str) -> Option<usize>;
    /// Record a retry; returns whether the task is queued.
    fn touch(&mut self, task_id: &str, now: Duration) -> bool;
    /// Remove entries last seen before `cutoff`.
    fn prune_expired(&mut self, cutoff: Duration) -> Vec<QueuedRequest>;
    /// Entries in queue order.
    fn iter(&self) -> Box<dyn Iterator<Item = &QueuedRequest> + '_>;
    /// Maximum depth allowed for this queue.
    fn max_depth(&self) -> usize;
    /// Current depth.
    fn len(&self) -> usize;
    /// Whether the queue is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct AdmissionState {
    queue: Box<dyn TaskQueue>,
    active: BTreeMap<AllocationId, Allocation>,
    next_id: AllocationId,
}

/// Gatekeeper for every mutation of the resource pool.
///
/// The queue and allocation list share one short-lived mutex; bucket state is
/// guarded per resource type inside the pool.
pub struct AdmissionController {
    pool: Arc<ResourcePool>,
    events: EventBus,
    preemption_threshold: Priority,
    stale_after: Duration,
    state: Mutex<AdmissionState>,
    released: Notify,
}

impl AdmissionController {
    /// Create a controller over `pool` using `queue` for waiting requests.
    pub fn new(pool: Arc<ResourcePool>, queue: Box<dyn TaskQueue>, events: EventBus) -> Self {
        Self {
            pool,
            events,
            preemption_threshold: DEFAULT_PREEMPTION_THRESHOLD,
            stale_after: DEFAULT_STALE_AFTER,
            state: Mutex::new(AdmissionState {
                queue,
                active: BTreeMap::new(),
                next_id: 0,
            }),
            released: Notify::new(),
        }
    }

    /// Override the preemption threshold.
    #[must_use]
    pub const fn with_preemption_threshold(mut self, threshold: Priority) -> Self {
        self.preemption_threshold = threshold;
        self
    }

    /// Override how long an un-retried queue entry survives.
    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Underlying pool.
    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Configured preemption threshold.
    pub const fn preemption_threshold(&self) -> Priority {
        self.preemption_threshold
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.pool.clock()
    }

    /// Future resolving the next time resources are returned to the pool.
    pub fn capacity_released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Run the admission algorithm for one request.
    pub fn request(&self, request: AllocationRequest) -> AdmissionDecision {
        let now = self.clock().now();
        self.expire_due();
        self.prune_stale(now);

        let needs = request.effective_needs();
        if let Err(err) = self.pool.check_capacity(&needs) {
            self.state.lock().queue.remove(&request.task_id);
            return self.reject(&request, err);
        }

        let blocked = {
            let mut state = self.state.lock();
            state.queue.touch(&request.task_id, now);
            Self::blocked_by_queue(state.queue.as_ref(), &request, &needs)
        };

        let shortfalls = if blocked {
            tracing::debug!(task = %request.task_id, "waiting behind queued requests");
            self.pool.peek_shortfalls(&needs)
        } else {
            match self.try_grant(&request, &needs) {
                Ok(Ok(allocation)) => return AdmissionDecision::Granted(allocation),
                Ok(Err(shortfalls)) if request.priority >= self.preemption_threshold => {
                    match self.preempt_for(&request, &needs, &shortfalls) {
                        Some(Ok(Ok(allocation))) => return AdmissionDecision::Granted(allocation),
                        Some(Ok(Err(remaining))) => remaining,
                        Some(Err(err)) => return self.reject(&request, err),
                        None => shortfalls,
                    }
                }
                Ok(Err(shortfalls)) => shortfalls,
                Err(err) => return self.reject(&request, err),
            }
        };

        self.park(request, shortfalls, now)
    }

    /// An entry ahead in the queue with priority >= ours that wants one of
    /// our resource types holds us back.
    fn blocked_by_queue(
        queue: &dyn TaskQueue,
        request: &AllocationRequest,
        needs: &BTreeMap<ResourceType, f64>,
    ) -> bool {
        for entry in queue.iter() {
            if entry.request.task_id == request.task_id
                || entry.request.priority < request.priority
            {
                return false;
            }
            let competes = entry
                .request
                .resource_needs
                .iter()
                .any(|(resource, amount)| *amount > 0.0 && needs.contains_key(resource));
            if competes {
                return true;
            }
        }
        false
    }

    fn try_grant(
        &self,
        request: &AllocationRequest,
        needs: &BTreeMap<ResourceType, f64>,
    ) -> Result<Result<Allocation, Vec<Shortfall>>, SchedulerError> {
        let shortfalls = self.pool.try_reserve_all(needs)?;
        if !shortfalls.is_empty() {
            return Ok(Err(shortfalls));
        }
        Ok(Ok(self.record_grant(request, needs)))
    }

    /// Register an allocation for needs that are already reserved in the pool.
    fn record_grant(
        &self,
        request: &AllocationRequest,
        needs: &BTreeMap<ResourceType, f64>,
    ) -> Allocation {
        let now = self.clock().now();
        let allocation = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let allocation = Allocation {
                id: state.next_id,
                task_id: request.task_id.clone(),
                graph_id: request.graph_id,
                priority: request.priority,
                preemptable: request.preemptable,
                resources: needs.clone(),
                granted_at: now,
                expires_at: (!request.duration_estimate.is_zero())
                    .then(|| now + request.duration_estimate),
                revocation: Arc::new(Notify::new()),
            };
            state.active.insert(allocation.id, allocation.clone());
            state.queue.remove(&request.task_id);
            allocation
        };
        tracing::info!(
            task = %allocation.task_id,
            allocation = allocation.id,
            "allocation granted"
        );
        self.events.emit(
            EventKind::AllocationGranted,
            allocation.graph_id,
            &allocation.task_id,
            Some(describe(&allocation.resources)),
        );
        allocation
    }

    /// Reclaim one lower-priority preemptable allocation holding a short
    /// resource: the lowest priority wins, then the most recent grant.
    ///
    /// The victim's amounts are returned and the requester's needs reserved
    /// under the same bucket locks, so the victim cannot win its tokens back
    /// before the requester retries. `None` when there is no candidate.
    fn preempt_for(
        &self,
        request: &AllocationRequest,
        needs: &BTreeMap<ResourceType, f64>,
        shortfalls: &[Shortfall],
    ) -> Option<Result<Result<Allocation, Vec<Shortfall>>, SchedulerError>> {
        let victim = {
            let mut state = self.state.lock();
            let id = state
                .active
                .values()
                .filter(|a| {
                    a.preemptable && a.priority < request.priority && a.task_id != request.task_id
                })
                .filter(|a| {
                    shortfalls
                        .iter()
                        .any(|s| a.resources.get(&s.resource).is_some_and(|v| *v > 0.0))
                })
                .min_by(|a, b| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)))
                .map(|a| a.id)?;
            state.active.remove(&id)?
        };
        let handover = self.pool.release_and_reserve(&victim.resources, needs);
        tracing::info!(
            victim = %victim.task_id,
            by = %request.task_id,
            "allocation preempted"
        );
        self.events.emit(
            EventKind::AllocationPreempted,
            victim.graph_id,
            &victim.task_id,
            Some(format!("preempted by {}", request.task_id)),
        );

        let outcome = match handover {
            Ok(remaining) if remaining.is_empty() => Ok(Ok(self.record_grant(request, needs))),
            Ok(remaining) => {
                self.released.notify_waiters();
                Ok(Err(remaining))
            }
            Err(err) => {
                self.released.notify_waiters();
                Err(err)
            }
        };
        victim.revocation.notify_one();
        Some(outcome)
    }

    fn park(
        &self,
        request: AllocationRequest,
        shortfalls: Vec<Shortfall>,
        now: Duration,
    ) -> AdmissionDecision {
        let wait_time = shortfalls
            .iter()
            .try_fold(Duration::ZERO, |acc, s| s.wait_time().map(|w| acc.max(w)));

        let mut state = self.state.lock();
        if let Some(position) = state.queue.position(&request.task_id) {
            return AdmissionDecision::Queued {
                position,
                wait_time,
                shortfalls,
            };
        }

        let task_id = request.task_id.clone();
        let graph_id = request.graph_id;
        let entry = QueuedRequest {
            request,
            enqueued_at: now,
            last_seen: now,
        };
        match state.queue.enqueue(entry) {
            Ok(position) => {
                drop(state);
                tracing::debug!(task = %task_id, position, "request queued");
                let detail = shortfalls
                    .iter()
                    .map(|s| format!("{} short by {}", s.resource, s.missing()))
                    .collect::<Vec<_>>()
                    .join(", ");
                self.events.emit(
                    EventKind::AllocationQueued,
                    graph_id,
                    &task_id,
                    (!detail.is_empty()).then_some(detail),
                );
                AdmissionDecision::Queued {
                    position,
                    wait_time,
                    shortfalls,
                }
            }
            Err(err) => {
                drop(state);
                tracing::warn!(task = %task_id, "request rejected: {err}");
                self.events.emit(
                    EventKind::AllocationRejected,
                    graph_id,
                    &task_id,
                    Some(err.to_string()),
                );
                AdmissionDecision::Rejected(err)
            }
        }
    }

    fn reject(&self, request: &AllocationRequest, err: SchedulerError) -> AdmissionDecision {
        tracing::warn!(task = %request.task_id, "request rejected: {err}");
        self.events.emit(
            EventKind::AllocationRejected,
            request.graph_id,
            &request.task_id,
            Some(err.to_string()),
        );
        AdmissionDecision::Rejected(err)
    }

    /// Release an allocation, returning exactly what it was granted.
    ///
    /// Returns `None` if it was already released, expired, or preempted.
    pub fn release(&self, id: AllocationId) -> Option<Allocation> {
        let allocation = self.state.lock().active.remove(&id)?;
        self.pool.release_all(&allocation.resources);
        tracing::debug!(task = %allocation.task_id, allocation = id, "allocation released");
        self.events.emit(
            EventKind::AllocationReleased,
            allocation.graph_id,
            &allocation.task_id,
            None,
        );
        self.released.notify_waiters();
        Some(allocation)
    }

    /// Release every allocation and drop every queue entry owned by a graph.
    /// Returns the number of allocations released.
    pub fn release_graph(&self, graph_id: GraphId) -> usize {
        let (released, dropped) = {
            let mut state = self.state.lock();
            let ids: Vec<_> = state
                .active
                .values()
                .filter(|a| a.graph_id == Some(graph_id))
                .map(|a| a.id)
                .collect();
            let released: Vec<_> = ids
                .into_iter()
                .filter_map(|id| state.active.remove(&id))
                .collect();
            let dropped = state.queue.remove_graph(graph_id).len();
            (released, dropped)
        };
        for allocation in &released {
            self.pool.release_all(&allocation.resources);
            self.events.emit(
                EventKind::AllocationReleased,
                allocation.graph_id,
                &allocation.task_id,
                None,
            );
        }
        if !released.is_empty() {
            tracing::debug!(graph = %graph_id, released = released.len(), dropped, "graph allocations released");
            self.released.notify_waiters();
        }
        released.len()
    }

    /// Remove a task's queue entry. Returns whether one existed.
    pub fn withdraw(&self, task_id: &str) -> bool {
        self.state.lock().queue.remove(task_id).is_some()
    }

    /// Reclaim allocations past their expiry.
    pub fn expire_due(&self) -> Vec<Allocation> {
        let now = self.clock().now();
        let expired: Vec<_> = {
            let mut state = self.state.lock();
            let due: Vec<_> = state
                .active
                .values()
                .filter(|a| a.expires_at.is_some_and(|at| at <= now))
                .map(|a| a.id)
                .collect();
            due.into_iter()
                .filter_map(|id| state.active.remove(&id))
                .collect()
        };
        for allocation in &expired {
            self.pool.release_all(&allocation.resources);
            tracing::info!(task = %allocation.task_id, allocation = allocation.id, "allocation expired");
            self.events.emit(
                EventKind::AllocationExpired,
                allocation.graph_id,
                &allocation.task_id,
                None,
            );
        }
        if !expired.is_empty() {
            self.released.notify_waiters();
        }
        expired
    }

    fn prune_stale(&self, now: Duration) {
        let cutoff = now.saturating_sub(self.stale_after);
        if cutoff.is_zero() {
            return;
        }
        let pruned = self.state.lock().queue.prune_expired(cutoff);
        if !pruned.is_empty() {
            tracing::warn!("pruned {} stale queued requests", pruned.len());
        }
    }

    /// Snapshot of active allocations, oldest first.
    pub fn active(&self) -> Vec<Allocation> {
        self.state.lock().active.values().cloned().collect()
    }

    /// Number of active allocations owned by a graph.
    pub fn active_for(&self, graph_id: GraphId) -> usize {
        self.state
            .lock()
            .active
            .values()
            .filter(|a| a.graph_id == Some(graph_id))
            .count()
    }

    /// Snapshot of the wait queue in order.
    pub fn queued(&self) -> Vec<QueuedRequest> {
        self.state.lock().queue.iter().cloned().collect()
    }

    /// Current queue depth.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AdmissionController")
            .field("preemption_threshold", &self.preemption_threshold)
            .field("active", &state.active.len())
            .field("queued", &state.queue.len())
            .finish_non_exhaustive()
    }
}

fn describe(resources: &BTreeMap<ResourceType, f64>) -> String {
    resources
        .iter()
        .map(|(resource, amount)| format!("{resource}={amount}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::queue::InMemoryQueue;
    use crate::util::clock::ManualClock;

    fn controller(clock: &Arc<ManualClock>) -> AdmissionController {
        let pool = Arc::new(ResourcePool::new(clock.clone()));
        pool.configure(ResourceType::Compute, 10.0, 0.0).unwrap();
        pool.configure(ResourceType::RequestBudget, 5.0, 1.0).unwrap();
        AdmissionController::new(
            pool,
            Box::new(InMemoryQueue::new(16)),
            EventBus::disabled(clock.clone()),
        )
    }

    fn compute(task: &str, amount: f64, priority: u8) -> AllocationRequest {
        AllocationRequest::new(task)
            .with_need(ResourceType::Compute, amount)
            .with_priority(priority)
    }

    fn assert_conserved(ctl: &AdmissionController) {
        for snapshot in ctl.pool().snapshot() {
            let held: f64 = ctl
                .active()
                .iter()
                .filter_map(|a| a.resources.get(&snapshot.resource))
                .sum();
            assert!((held - snapshot.granted).abs() < 1e-9);
            assert!((snapshot.granted + snapshot.available - snapshot.capacity).abs() < 1e-9);
        }
    }

    #[test]
    fn grants_and_releases_exact_amounts() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        let decision = ctl.request(compute("a", 4.0, 5));
        let allocation = decision.allocation().cloned().unwrap();
        assert_eq!(allocation.resources.get(&ResourceType::Compute), Some(&4.0));
        assert_conserved(&ctl);

        let released = ctl.release(allocation.id).unwrap();
        assert_eq!(released.resources, allocation.resources);
        assert!(ctl.release(allocation.id).is_none());
        assert_conserved(&ctl);
        assert!((ctl.pool().available(&ResourceType::Compute).unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn over_capacity_is_budget_exceeded() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        let decision = ctl.request(compute("huge", 11.0, 10));
        assert!(matches!(
            decision,
            AdmissionDecision::Rejected(SchedulerError::BudgetExceeded { .. })
        ));
        assert_eq!(ctl.queue_len(), 0);
        assert!(ctl.active().is_empty());
    }

    #[test]
    fn unknown_resource_is_rejected() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        let decision = ctl.request(AllocationRequest::new("m").with_need(ResourceType::Memory, 1.0));
        assert!(matches!(
            decision,
            AdmissionDecision::Rejected(SchedulerError::UnknownResource(ResourceType::Memory))
        ));
    }

    #[test]
    fn partial_shortage_grants_nothing() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        let request = compute("mixed", 2.0, 5).with_need(ResourceType::RequestBudget, 5.0);
        assert!(ctl.request(request).is_granted());

        let second = compute("second", 2.0, 5).with_need(ResourceType::RequestBudget, 1.0);
        let decision = ctl.request(second);
        match decision {
            AdmissionDecision::Queued { shortfalls, .. } => {
                assert_eq!(shortfalls.len(), 1);
                assert_eq!(shortfalls[0].resource, ResourceType::RequestBudget);
            }
            other => panic!("expected queued, got {other:?}"),
        }
        assert!((ctl.pool().available(&ResourceType::Compute).unwrap() - 8.0).abs() < 1e-9);
        assert_conserved(&ctl);
    }

    #[test]
    fn queue_orders_by_priority_then_arrival() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        assert!(ctl.request(compute("holder", 10.0, 5)).is_granted());

        ctl.request(compute("low-1", 1.0, 2));
        ctl.request(compute("mid-1", 1.0, 5));
        ctl.request(compute("low-2", 1.0, 2));
        ctl.request(compute("mid-2", 1.0, 5));
        ctl.request(compute("high", 1.0, 7));

        let order: Vec<_> = ctl.queued().into_iter().map(|q| q.request.task_id).collect();
        assert_eq!(order, vec!["high", "mid-1", "mid-2", "low-1", "low-2"]);
    }

    #[test]
    fn queued_request_keeps_its_place_and_blocks_newcomers() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        let holder = ctl.request(compute("holder", 8.0, 5)).allocation().cloned().unwrap();

        assert!(matches!(
            ctl.request(compute("big", 5.0, 5)),
            AdmissionDecision::Queued { position: 0, .. }
        ));
        // Fits on its own, but "big" arrived first and wants compute too.
        assert!(matches!(
            ctl.request(compute("small", 1.0, 5)),
            AdmissionDecision::Queued { position: 1, .. }
        ));
        // Budget-only requests do not compete with either.
        assert!(ctl
            .request(AllocationRequest::new("budget").with_need(ResourceType::RequestBudget, 1.0))
            .is_granted());

        ctl.release(holder.id);
        assert!(ctl.request(compute("small", 1.0, 5)).allocation().is_none());
        assert!(ctl.request(compute("big", 5.0, 5)).is_granted());
        assert!(ctl.request(compute("small", 1.0, 5)).is_granted());
        assert_eq!(ctl.queue_len(), 0);
        assert_conserved(&ctl);
    }

    #[test]
    fn wait_time_follows_refill_rate() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        assert!(ctl.pool().consume(&ResourceType::RequestBudget, 5.0).unwrap());
        let decision = ctl.request(AllocationRequest::new("b").with_need(ResourceType::RequestBudget, 3.0));
        match decision {
            AdmissionDecision::Queued { wait_time, .. } => {
                assert_eq!(wait_time, Some(Duration::from_secs(3)));
            }
            other => panic!("expected queued, got {other:?}"),
        }
        clock.advance(Duration::from_secs(3));
        assert!(ctl
            .request(AllocationRequest::new("b").with_need(ResourceType::RequestBudget, 3.0))
            .is_granted());
    }

    #[test]
    fn high_priority_preempts_lowest_preemptable() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        let low = ctl
            .request(compute("low", 4.0, 1).preemptable(true))
            .allocation()
            .cloned()
            .unwrap();
        let mid = ctl
            .request(compute("mid", 4.0, 3).preemptable(true))
            .allocation()
            .cloned()
            .unwrap();
        let pinned = ctl
            .request(compute("pinned", 2.0, 0))
            .allocation()
            .cloned()
            .unwrap();

        let revoked = low.revocation();
        let decision = ctl.request(compute("urgent", 3.0, 9));
        assert!(decision.is_granted());

        let active: Vec<_> = ctl.active().into_iter().map(|a| a.id).collect();
        assert!(!active.contains(&low.id));
        assert!(active.contains(&mid.id));
        assert!(active.contains(&pinned.id));
        assert!(ctl.release(low.id).is_none());
        assert_conserved(&ctl);

        // The permit is stored, so a later wait completes immediately.
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(async {
            tokio::time::timeout(Duration::from_millis(50), revoked.notified())
                .await
                .unwrap();
        });
    }

    #[test]
    fn below_threshold_does_not_preempt() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        assert!(ctl.request(compute("low", 10.0, 1).preemptable(true)).is_granted());
        assert!(matches!(
            ctl.request(compute("eager", 1.0, 7)),
            AdmissionDecision::Queued { .. }
        ));
        assert_eq!(ctl.active().len(), 1);
    }

    #[test]
    fn preemption_needs_an_eligible_victim() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        assert!(ctl.request(compute("pinned", 10.0, 1)).is_granted());
        assert!(ctl.request(compute("peer", 0.0, 9)).is_granted());
        assert!(matches!(
            ctl.request(compute("urgent", 5.0, 9)),
            AdmissionDecision::Queued { .. }
        ));
        assert_eq!(ctl.active().len(), 2);
        assert_conserved(&ctl);
    }

    #[test]
    fn allocations_expire_after_duration_estimate() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        let first = compute("short-lived", 10.0, 5).with_duration(Duration::from_secs(5));
        assert!(ctl.request(first).is_granted());
        assert!(!ctl.request(compute("next", 1.0, 5)).is_granted());

        clock.advance(Duration::from_secs(5));
        assert!(ctl.request(compute("next", 1.0, 5)).is_granted());
        assert_conserved(&ctl);
    }

    #[test]
    fn release_graph_clears_allocations_and_queue() {
        let clock = Arc::new(ManualClock::new());
        let ctl = controller(&clock);
        let graph = GraphId::new();
        assert!(ctl.request(compute("g/a", 6.0, 5).for_graph(graph)).is_granted());
        assert!(ctl.request(compute("other", 2.0, 5)).is_granted());
        assert!(!ctl.request(compute("g/b", 6.0, 5).for_graph(graph)).is_granted());

        assert_eq!(ctl.release_graph(graph), 1);
        assert_eq!(ctl.release_graph(graph), 0);
        assert_eq!(ctl.queue_len(), 0);
        assert_eq!(ctl.active_for(graph), 0);
        assert_eq!(ctl.active().len(), 1);
        assert_conserved(&ctl);
    }

    #[test]
    fn stale_entries_stop_blocking() {
        let clock = Arc::new(ManualClock::new());
        let pool = Arc::new(ResourcePool::new(clock.clone()));
        pool.configure(ResourceType::Compute, 10.0, 0.0).unwrap();
        let ctl = AdmissionController::new(
            pool,
            Box::new(InMemoryQueue::new(16)),
            EventBus::disabled(clock.clone()),
        )
        .with_stale_after(Duration::from_secs(10));

        let holder = ctl.request(compute("holder", 8.0, 5)).allocation().cloned().unwrap();
        assert!(!ctl.request(compute("abandoned", 5.0, 5)).is_granted());
        ctl.release(holder.id);

        clock.advance(Duration::from_secs(11));
        assert!(ctl.request(compute("fresh", 1.0, 5)).is_granted());
        assert_eq!(ctl.queue_len(), 0);
    }

    #[test]
    fn full_queue_rejects_softly() {
        let clock = Arc::new(ManualClock::new());
        let pool = Arc::new(ResourcePool::new(clock.clone()));
        pool.configure(ResourceType::Compute, 1.0, 0.0).unwrap();
        let ctl = AdmissionController::new(
            pool,
            Box::new(InMemoryQueue::new(1)),
            EventBus::disabled(clock.clone()),
        );
        assert!(ctl.request(compute("a", 1.0, 5)).is_granted());
        assert!(matches!(ctl.request(compute("b", 1.0, 5)), AdmissionDecision::Queued { .. }));
        match ctl.request(compute("c", 1.0, 5)) {
            AdmissionDecision::Rejected(err) => assert!(err.is_retryable()),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
