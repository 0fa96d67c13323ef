//! Tests for error classification and rendering

use std::time::Duration;

use prometheus_task_graph::core::SchedulerError;
use prometheus_task_graph::util::{GraphId, ResourceType};

#[test]
fn test_retryable_errors() {
    let short = SchedulerError::InsufficientResources {
        resource: ResourceType::Compute,
        requested: 4.0,
        available: 1.0,
    };
    assert!(short.is_retryable());
    assert!(SchedulerError::QueueFull("full".into()).is_retryable());
}

#[test]
fn test_non_retryable_errors() {
    let never = SchedulerError::BudgetExceeded {
        resource: ResourceType::Memory,
        requested: 20.0,
        capacity: 10.0,
    };
    assert!(!never.is_retryable());
    assert!(!SchedulerError::UnknownResource(ResourceType::Time).is_retryable());
    assert!(!SchedulerError::DuplicateNode("a".into()).is_retryable());
    assert!(!SchedulerError::UnknownGraph(GraphId::new()).is_retryable());
}

#[test]
fn test_cycle_error_display() {
    let err = SchedulerError::CycleDetected(vec![
        vec!["a".into(), "b".into()],
        vec!["x".into()],
    ]);
    assert_eq!(err.to_string(), "dependency cycle detected: a -> b; x");
}

#[test]
fn test_timeout_display() {
    let err = SchedulerError::Timeout {
        scope: "node fetch".into(),
        after: Duration::from_millis(150),
    };
    assert_eq!(err.to_string(), "node fetch timed out after 150ms");
}

#[test]
fn test_usage_error_display() {
    let err = SchedulerError::UnknownDependency {
        node: "deploy".into(),
        dependency: "tset".into(),
    };
    assert_eq!(err.to_string(), "node `deploy` depends on unknown node `tset`");

    let id = GraphId::new();
    assert!(SchedulerError::GraphBusy(id).to_string().contains(&id.to_string()));
    assert_eq!(
        SchedulerError::UnknownResource(ResourceType::Custom("gpu_hours".into())).to_string(),
        "unknown resource: gpu_hours"
    );
}

#[test]
fn test_error_into_anyhow() {
    fn usage() -> prometheus_task_graph::core::AppResult<()> {
        Err::<(), _>(SchedulerError::InvalidConfig("bad".into()))?;
        Ok(())
    }
    let err = usage().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SchedulerError>(),
        Some(SchedulerError::InvalidConfig(_))
    ));
}
