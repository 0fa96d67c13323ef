//! Tests for shared types and clocks

use std::time::Duration;

use prometheus_task_graph::util::{
    init_tracing, now_ms, Clock, GraphId, ManualClock, Priority, ResourceType, SystemClock,
};

#[test]
fn test_resource_type_names() {
    for (text, expected) in [
        ("compute", ResourceType::Compute),
        ("memory", ResourceType::Memory),
        ("request_budget", ResourceType::RequestBudget),
        ("time", ResourceType::Time),
        ("concurrency", ResourceType::Concurrency),
        ("gpu_hours", ResourceType::Custom("gpu_hours".into())),
    ] {
        let parsed: ResourceType = text.parse().unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), text);
    }
    assert!("  ".parse::<ResourceType>().is_err());
}

#[test]
fn test_resource_type_serde() {
    let json = serde_json::to_string(&ResourceType::RequestBudget).unwrap();
    assert_eq!(json, "\"request_budget\"");
    let back: ResourceType = serde_json::from_str("\"concurrency\"").unwrap();
    assert_eq!(back, ResourceType::Concurrency);
}

#[test]
fn test_priority_clamps() {
    assert_eq!(Priority::new(42), Priority::MAX);
    assert_eq!(Priority::from(3).value(), 3);
    assert_eq!(Priority::default(), Priority::NORMAL);
    assert!(Priority::new(9) > Priority::new(8));
}

#[test]
fn test_graph_ids_are_unique() {
    let a = GraphId::new();
    let b = GraphId::new();
    assert_ne!(a, b);
    assert_eq!(a.to_string(), a.as_uuid().to_string());
}

#[test]
fn test_clocks() {
    let manual = ManualClock::new();
    manual.advance(Duration::from_millis(250));
    manual.set(Duration::from_millis(100));
    assert_eq!(manual.now(), Duration::from_millis(250));

    let system = SystemClock::new();
    let first = system.now();
    assert!(system.now() >= first);
    assert!(now_ms() > 0);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing("prometheus_task_graph=debug");
    init_tracing("prometheus_task_graph=trace");
    tracing::info!("subscriber installed");
    assert!(tracing::dispatcher::has_been_set());
}
