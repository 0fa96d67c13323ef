//! Tests for event sinks and the event bus

use std::sync::Arc;
use std::time::Duration;

use prometheus_task_graph::core::{EventBus, EventKind, InMemoryEventSink, TracingEventSink};
use prometheus_task_graph::util::{GraphId, ManualClock};

#[test]
fn test_in_memory_sink_is_bounded() {
    let clock = Arc::new(ManualClock::new());
    let sink = InMemoryEventSink::new(2);
    let bus = EventBus::new(clock, Some(Box::new(sink.clone())));

    bus.emit(EventKind::NodeStarted, None, "a", None);
    bus.emit(EventKind::NodeStarted, None, "b", None);
    bus.emit(EventKind::NodeCompleted, None, "c", None);

    let subjects: Vec<_> = sink.events().into_iter().map(|e| e.subject).collect();
    assert_eq!(subjects, vec!["b", "c"]);
    assert_eq!(sink.len(), 2);
}

#[test]
fn test_events_are_timestamped_by_clock() {
    let clock = Arc::new(ManualClock::new());
    let sink = InMemoryEventSink::new(16);
    let bus = EventBus::new(clock.clone(), Some(Box::new(sink.clone())));
    let graph = GraphId::new();

    clock.advance(Duration::from_secs(5));
    bus.emit(EventKind::GraphSubmitted, Some(graph), graph.to_string(), Some("ok".into()));

    let events = sink.of_kind(EventKind::GraphSubmitted);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].at, Duration::from_secs(5));
    assert_eq!(events[0].graph_id, Some(graph));
    assert_eq!(events[0].detail.as_deref(), Some("ok"));
    assert!(sink.of_kind(EventKind::NodeFailed).is_empty());
}

#[test]
fn test_sink_clear() {
    let sink = InMemoryEventSink::new(4);
    let bus = EventBus::new(Arc::new(ManualClock::new()), Some(Box::new(sink.clone())));
    bus.emit(EventKind::AllocationGranted, None, "t", None);
    assert!(!sink.is_empty());
    sink.clear();
    assert!(sink.is_empty());
}

#[test]
fn test_disabled_and_tracing_buses() {
    let clock = Arc::new(ManualClock::new());
    EventBus::disabled(clock.clone()).emit(EventKind::NodeFailed, None, "x", None);
    EventBus::new(clock, Some(Box::new(TracingEventSink))).emit(
        EventKind::AllocationRejected,
        None,
        "y",
        Some("budget".into()),
    );
}

#[test]
fn test_event_kind_serializes_snake_case() {
    let json = serde_json::to_string(&EventKind::AllocationPreempted).unwrap();
    assert_eq!(json, "\"allocation_preempted\"");
}
