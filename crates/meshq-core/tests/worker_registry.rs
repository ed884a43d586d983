mod support;

use std::sync::Arc;

use meshq_core::config::QueueConfig;
use meshq_core::models::CoreErrorKind;
use meshq_core::registry::WorkerRegistry;

use support::{FakeEngine, RecordingNotifier};

fn standard(test_name: &str) -> WorkerRegistry {
    WorkerRegistry::standard(
        Arc::new(FakeEngine::default()),
        support::gateway(test_name),
        Arc::new(RecordingNotifier::default()),
        &QueueConfig::default(),
    )
}

#[test]
fn standard_registry_knows_both_task_types() {
    let registry = standard("registry-types");

    assert_eq!(registry.registered_types(), ["PhotoMesh", "Queue"]);
    assert!(registry.instantiated().is_empty());
}

#[test]
fn workers_are_created_once_per_type() {
    let registry = standard("registry-memoized");

    let first = registry.resolve("PhotoMesh").unwrap();
    let again = registry.resolve("PhotoMesh").unwrap();
    let queue = registry.resolve("Queue").unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &queue));
    assert_eq!(registry.instantiated().len(), 2);
}

#[test]
fn unknown_type_is_rejected_at_resolution() {
    let registry = standard("registry-unknown");

    let error = match registry.resolve("Lidar") {
        Err(error) => error,
        Ok(_) => panic!("expected an unknown task type error"),
    };

    assert_eq!(error.kind, CoreErrorKind::UnknownTaskType);
    assert_eq!(error.message, "Unknown task type: Lidar");
    assert!(registry.instantiated().is_empty());
}
