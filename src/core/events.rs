//! Observability sinks for scheduler events.
//!
//! Every node transition and admission decision is published as a
//! [`SchedulerEvent`]. Sinks are plain trait objects so metrics or logging
//! layers can subscribe without the scheduler knowing about them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::clock::Clock;
use crate::util::types::GraphId;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A graph was resolved and stored.
    GraphSubmitted,
    /// A graph run was cancelled (explicitly or by graph timeout).
    GraphCancelled,
    /// A node started running.
    NodeStarted,
    /// A node finished successfully.
    NodeCompleted,
    /// A node failed.
    NodeFailed,
    /// A node was skipped.
    NodeSkipped,
    /// Resources were granted to a request.
    AllocationGranted,
    /// A request was parked in the wait queue.
    AllocationQueued,
    /// A request was rejected.
    AllocationRejected,
    /// An active allocation was revoked for a higher-priority request.
    AllocationPreempted,
    /// An allocation was returned to the pool.
    AllocationReleased,
    /// An allocation outlived its duration estimate and was reclaimed.
    AllocationExpired,
}

/// A single structured event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    /// Event category.
    pub kind: EventKind,
    /// Graph the event belongs to, when known.
    pub graph_id: Option<GraphId>,
    /// Node id or allocation task id.
    pub subject: String,
    /// Clock reading when the event was emitted.
    pub at: Duration,
    /// Free-form context.
    pub detail: Option<String>,
}

/// Event sink abstraction.
pub trait EventSink: Send {
    /// Record an event.
    fn record(&mut self, event: SchedulerEvent);
}

/// Bounded in-memory sink. Clones share the same buffer, so a test can keep a
/// handle while the scheduler owns another.
#[derive(Debug, Clone)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<VecDeque<SchedulerEvent>>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a sink keeping at most `max_events` events, dropping the oldest.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events: max_events.max(1),
        }
    }

    /// Snapshot of stored events, oldest first.
    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events of one kind.
    pub fn of_kind(&self, kind: EventKind) -> Vec<SchedulerEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether no events are stored.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drop all stored events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&mut self, event: SchedulerEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Sink that forwards every event to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&mut self, event: SchedulerEvent) {
        tracing::debug!(
            kind = ?event.kind,
            graph = ?event.graph_id,
            subject = %event.subject,
            detail = event.detail.as_deref().unwrap_or(""),
            "scheduler event"
        );
    }
}

/// Shared handle used by components to publish events.
#[derive(Clone)]
pub struct EventBus {
    clock: Arc<dyn Clock>,
    sink: Option<Arc<Mutex<Box<dyn EventSink>>>>,
}

impl EventBus {
    /// Bus publishing into `sink`, timestamped by `clock`.
    pub fn new(clock: Arc<dyn Clock>, sink: Option<Box<dyn EventSink>>) -> Self {
        Self {
            clock,
            sink: sink.map(|s| Arc::new(Mutex::new(s))),
        }
    }

    /// Bus that drops every event.
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, None)
    }

    /// Publish an event.
    pub fn emit(
        &self,
        kind: EventKind,
        graph_id: Option<GraphId>,
        subject: impl Into<String>,
        detail: Option<String>,
    ) {
        if let Some(sink) = self.sink.as_ref() {
            let event = SchedulerEvent {
                kind,
                graph_id,
                subject: subject.into(),
                at: self.clock.now(),
                detail,
            };
            sink.lock().record(event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}
