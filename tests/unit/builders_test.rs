//! Tests for scheduler assembly

use std::sync::Arc;
use std::time::Duration;

use prometheus_task_graph::builders::{build_pool, SchedulerBuilder};
use prometheus_task_graph::config::SchedulerConfig;
use prometheus_task_graph::core::{
    AdmissionDecision, AllocationRequest, EventKind, InMemoryEventSink, NodeSpec, Scheduler,
    SchedulerError,
};
use prometheus_task_graph::infra::InMemoryQueue;
use prometheus_task_graph::util::{Clock, ManualClock, Priority, ResourceType};

fn two_resources() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_resource(ResourceType::Memory, 512.0, 0.0)
        .with_resource(ResourceType::Compute, 4.0, 1.0)
}

#[test]
fn test_build_pool_configures_every_resource() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let pool = build_pool(&two_resources(), clock).unwrap();

    assert_eq!(
        pool.resources(),
        vec![ResourceType::Compute, ResourceType::Memory]
    );
    assert!((pool.available(&ResourceType::Compute).unwrap() - 4.0).abs() < 1e-9);
    assert!((pool.capacity(&ResourceType::Memory).unwrap() - 512.0).abs() < 1e-9);
    assert!(pool.available(&ResourceType::Time).is_err());
}

#[test]
fn test_build_rejects_invalid_config() {
    let mut cfg = two_resources();
    cfg.preemption_threshold = 12;

    let result = SchedulerBuilder::new(cfg).build::<(), ()>();
    assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
}

#[test]
fn test_builder_wires_clock_sink_and_threshold() {
    let mut cfg = two_resources();
    cfg.preemption_threshold = 9;
    let clock = Arc::new(ManualClock::starting_at(Duration::from_secs(5)));
    let sink = InMemoryEventSink::new(16);

    let scheduler: Scheduler<u8, u8> = SchedulerBuilder::new(cfg)
        .with_clock(clock.clone())
        .with_event_sink(sink.clone())
        .build()
        .unwrap();

    assert_eq!(scheduler.admission().preemption_threshold(), Priority::new(9));
    assert_eq!(scheduler.clock().now(), Duration::from_secs(5));

    scheduler.submit(vec![NodeSpec::new("only", 1)]).unwrap();
    let submitted = sink.of_kind(EventKind::GraphSubmitted);
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].at, Duration::from_secs(5));
}

#[test]
fn test_builder_uses_custom_queue() {
    let cfg = SchedulerConfig::default().with_resource(ResourceType::Compute, 1.0, 0.0);
    let scheduler: Scheduler<(), ()> = SchedulerBuilder::new(cfg)
        .with_clock(Arc::new(ManualClock::new()))
        .with_queue(InMemoryQueue::new(1))
        .build()
        .unwrap();
    let admission = scheduler.admission();
    let need = |id: &str| AllocationRequest::new(id).with_need(ResourceType::Compute, 1.0);

    assert!(admission.request(need("first")).is_granted());
    assert!(matches!(
        admission.request(need("second")),
        AdmissionDecision::Queued { position: 0, .. }
    ));
    assert!(matches!(
        admission.request(need("third")),
        AdmissionDecision::Rejected(SchedulerError::QueueFull(_))
    ));
}

#[test]
fn test_builtin_names_share_one_bucket() {
    let cfg = SchedulerConfig::default().with_resource(ResourceType::Custom("compute".into()), 2.0, 0.0);
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let pool = build_pool(&cfg, clock).unwrap();
    assert_eq!(pool.resources(), vec![ResourceType::Compute]);

    let scheduler: Scheduler<(), ()> = SchedulerBuilder::new(cfg)
        .with_clock(Arc::new(ManualClock::new()))
        .build()
        .unwrap();
    let admission = scheduler.admission();
    let spelled = AllocationRequest::new("spelled").with_need(ResourceType::custom("compute"), 1.0);
    let named = AllocationRequest::new("named").with_need(ResourceType::Compute, 1.0);

    assert!(admission.request(spelled).is_granted());
    assert!(admission.request(named).is_granted());
    assert!(scheduler.pool().available(&ResourceType::Compute).unwrap().abs() < 1e-9);
}
