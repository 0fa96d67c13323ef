//! Tests for configuration validation

use std::collections::HashMap;
use std::time::Duration;

use prometheus_task_graph::config::{ResourceConfig, SchedulerConfig};
use prometheus_task_graph::core::SchedulerError;
use prometheus_task_graph::util::{Priority, ResourceType};

#[test]
fn test_default_config_is_valid() {
    let cfg = SchedulerConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.preemption_threshold, 8);
    assert_eq!(cfg.max_queue_depth, 1024);
    assert_eq!(cfg.retry_interval_ms, 25);
    assert_eq!(cfg.queue_stale_secs, 30);
    assert_eq!(cfg.history_limit, 256);
    assert!(cfg.max_parallel_nodes >= 1);
    assert!(cfg.max_admission_retries.is_none());
    assert!(cfg.resources.is_empty());
}

#[test]
fn test_resource_config_validation() {
    assert!(ResourceConfig::new(10.0, 1.0).validate().is_ok());
    assert!(ResourceConfig::new(10.0, 0.0).validate().is_ok());
    assert!(ResourceConfig::new(0.0, 1.0).validate().is_err());
    assert!(ResourceConfig::new(-1.0, 1.0).validate().is_err());
    assert!(ResourceConfig::new(10.0, -0.5).validate().is_err());
    assert!(ResourceConfig::new(f64::NAN, 1.0).validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_resource() {
    let cfg = SchedulerConfig::default().with_resource(ResourceType::Compute, 0.0, 1.0);
    match cfg.validate() {
        Err(SchedulerError::InvalidConfig(msg)) => assert!(msg.contains("compute")),
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn test_scheduler_config_invalid_scalars() {
    let cases: Vec<Box<dyn Fn(&mut SchedulerConfig)>> = vec![
        Box::new(|c| c.preemption_threshold = 11),
        Box::new(|c| c.max_queue_depth = 0),
        Box::new(|c| c.max_parallel_nodes = 0),
        Box::new(|c| c.retry_interval_ms = 0),
        Box::new(|c| c.graph_timeout_secs = Some(0)),
        Box::new(|c| c.node_timeout_secs = Some(0)),
        Box::new(|c| c.queue_stale_secs = 0),
        Box::new(|c| c.history_limit = 0),
    ];
    for mutate in cases {
        let mut cfg = SchedulerConfig::default();
        mutate(&mut cfg);
        assert!(matches!(cfg.validate(), Err(SchedulerError::InvalidConfig(_))));
    }
}

#[test]
fn test_config_from_json() {
    let json = r#"{
        "resources": {
            "compute": { "capacity": 4, "refill_rate": 1.5 },
            "request_budget": { "capacity": 100 },
            "gpu_hours": { "capacity": 2, "refill_rate": 0.01 }
        },
        "preemption_threshold": 9,
        "max_admission_retries": 3,
        "node_timeout_secs": 60
    }"#;
    let cfg = SchedulerConfig::from_json_str(json).unwrap();

    assert_eq!(cfg.resources.len(), 3);
    assert_eq!(cfg.resources[&ResourceType::Compute], ResourceConfig::new(4.0, 1.5));
    assert_eq!(cfg.resources[&ResourceType::RequestBudget].refill_rate, 0.0);
    assert!(cfg
        .resources
        .contains_key(&ResourceType::Custom("gpu_hours".into())));
    assert_eq!(cfg.preemption_priority(), Priority::new(9));
    assert_eq!(cfg.max_admission_retries, Some(3));
    // Unspecified fields keep their defaults.
    assert_eq!(cfg.max_queue_depth, 1024);
}

#[test]
fn test_config_from_invalid_json() {
    assert!(matches!(
        SchedulerConfig::from_json_str("{ not json"),
        Err(SchedulerError::InvalidConfig(_))
    ));
    assert!(matches!(
        SchedulerConfig::from_json_str(r#"{ "max_queue_depth": 0 }"#),
        Err(SchedulerError::InvalidConfig(_))
    ));
    assert!(SchedulerConfig::from_json_str(r#"{ "resources": { "": { "capacity": 1 } } }"#).is_err());
}

#[test]
fn test_config_json_roundtrip_keys_are_names() {
    let cfg = SchedulerConfig::default().with_resource(ResourceType::RequestBudget, 50.0, 2.0);
    let value = serde_json::to_value(&cfg).unwrap();
    assert_eq!(value["resources"]["request_budget"]["capacity"], 50.0);
}

#[test]
fn test_env_overrides() {
    let vars: HashMap<&str, &str> = [
        ("TASK_GRAPH_MAX_QUEUE_DEPTH", "16"),
        ("TASK_GRAPH_RETRY_INTERVAL_MS", " 5 "),
        ("TASK_GRAPH_MAX_ADMISSION_RETRIES", "2"),
        ("TASK_GRAPH_GRAPH_TIMEOUT_SECS", "90"),
        ("UNRELATED", "1"),
    ]
    .into_iter()
    .collect();

    let mut cfg = SchedulerConfig::default();
    cfg.apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()))
        .unwrap();

    assert_eq!(cfg.max_queue_depth, 16);
    assert_eq!(cfg.retry_interval_ms, 5);
    assert_eq!(cfg.max_admission_retries, Some(2));
    assert_eq!(cfg.graph_timeout_secs, Some(90));
    assert_eq!(cfg.history_limit, 256);
}

#[test]
fn test_env_override_bad_value() {
    let mut cfg = SchedulerConfig::default();
    let result = cfg.apply_overrides(|key| {
        (key == "TASK_GRAPH_HISTORY_LIMIT").then(|| "lots".to_string())
    });
    match result {
        Err(SchedulerError::InvalidConfig(msg)) => assert!(msg.contains("TASK_GRAPH_HISTORY_LIMIT")),
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn test_execution_options_from_config() {
    let mut cfg = SchedulerConfig::default();
    cfg.graph_timeout_secs = Some(30);
    cfg.node_timeout_secs = Some(5);
    cfg.retry_interval_ms = 10;
    cfg.max_parallel_nodes = 3;

    let options = cfg.execution_options();
    assert_eq!(options.graph_timeout, Some(Duration::from_secs(30)));
    assert_eq!(options.node_timeout, Some(Duration::from_secs(5)));
    assert_eq!(options.retry_interval, Duration::from_millis(10));
    assert_eq!(options.max_parallel, 3);
    assert_eq!(options.max_admission_retries, None);
}
