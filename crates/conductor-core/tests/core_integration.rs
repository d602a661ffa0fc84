#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::*;

// ---------------------------------------------------------------------------
// 1. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let capacity = ConductorError::CapacityExceeded {
        agent: AgentId::from("agent-a"),
        resource: ResourceType::Cpu,
        requested: 3.0,
        available: 2.0,
    };
    assert_eq!(
        capacity.to_string(),
        "Capacity exceeded on agent agent-a for cpu: requested 3, available 2"
    );

    let dep = ConductorError::UnknownDependency {
        task: TaskId::from("t2"),
        dependency: TaskId::from("t1"),
    };
    assert_eq!(dep.to_string(), "Task t2 depends on unknown task t1");

    let dup = ConductorError::DuplicateAgent(AgentId::from("agent-a"));
    assert_eq!(dup.to_string(), "Agent agent-a is already registered");

    let config_err = ConductorError::Config("missing key".to_string());
    assert_eq!(config_err.to_string(), "Config error: missing key");

    let bad_json = serde_json::from_str::<serde_json::Value>("not json");
    let err: ConductorError = bad_json.unwrap_err().into();
    assert!(err.to_string().starts_with("JSON error:"));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: ConductorError = io_err.into();
    assert!(err.to_string().starts_with("IO error:"));
}

// ---------------------------------------------------------------------------
// 2. Recoverable vs caller errors
// ---------------------------------------------------------------------------

#[test]
fn recoverable_classification() {
    assert!(ConductorError::NoEligibleAgent(TaskId::from("t")).is_recoverable());
    assert!(ConductorError::HandoffRejected("h".into()).is_recoverable());
    assert!(ConductorError::HandoffTimedOut("h".into()).is_recoverable());
    assert!(!ConductorError::DuplicateTask(TaskId::from("t")).is_recoverable());
    assert!(!ConductorError::TtlExpired("m".into()).is_recoverable());
}

// ---------------------------------------------------------------------------
// 3. Resource amounts built from iterators
// ---------------------------------------------------------------------------

#[test]
fn amounts_from_iterator_and_totals() {
    let amounts: ResourceAmounts = vec![("cpu", 4.0), ("memory", 8192.0)].into_iter().collect();
    assert_eq!(amounts.get(&ResourceType::Cpu), 4.0);
    assert_eq!(amounts.get(&ResourceType::Memory), 8192.0);
    assert_eq!(amounts.get(&ResourceType::Gpu), 0.0);
    assert_eq!(amounts.total(), 8196.0);
    assert_eq!(amounts.resource_types().count(), 2);
}
