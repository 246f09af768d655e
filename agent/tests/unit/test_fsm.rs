//! FSM unit tests

use confdeploy::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use confdeploy::errors::DeployError;

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), &DeploymentState::Queued);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.retry_count(), 0);
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Start).unwrap();
    assert_eq!(fsm.state(), &DeploymentState::InProgress);

    fsm.process(DeploymentEvent::Succeed).unwrap();
    assert_eq!(fsm.state(), &DeploymentState::Completed);
    assert!(fsm.state().is_terminal());
}

#[test]
fn test_fsm_failure_flow() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Start).unwrap();
    fsm.process(DeploymentEvent::Fail("write_file failed".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), &DeploymentState::Failed);
    assert_eq!(fsm.error(), Some("write_file failed"));
}

#[test]
fn test_fsm_requeue_counts_retries() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Start).unwrap();
    fsm.process(DeploymentEvent::Requeue).unwrap();
    assert_eq!(fsm.state(), &DeploymentState::Queued);
    assert_eq!(fsm.retry_count(), 1);

    fsm.process(DeploymentEvent::Start).unwrap();
    fsm.process(DeploymentEvent::Requeue).unwrap();
    assert_eq!(fsm.retry_count(), 2);
}

#[test]
fn test_fsm_rollback_from_terminal_states() {
    for start in [DeploymentState::Completed, DeploymentState::Failed] {
        let mut fsm = DeploymentFsm::from_state(start);
        fsm.process(DeploymentEvent::RollBack).unwrap();
        assert_eq!(fsm.state(), &DeploymentState::RolledBack);
    }
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = DeploymentFsm::new();
    assert!(matches!(
        fsm.process(DeploymentEvent::Succeed),
        Err(DeployError::ValidationError(_))
    ));
    assert_eq!(fsm.state(), &DeploymentState::Queued);

    let mut rolled_back = DeploymentFsm::from_state(DeploymentState::RolledBack);
    assert!(rolled_back.process(DeploymentEvent::RollBack).is_err());
    assert!(rolled_back.process(DeploymentEvent::Start).is_err());

    let mut queued = DeploymentFsm::new();
    assert!(queued.process(DeploymentEvent::RollBack).is_err());
}

#[test]
fn test_state_wire_names() {
    assert_eq!(
        serde_json::to_string(&DeploymentState::InProgress).unwrap(),
        "\"in_progress\""
    );
    assert_eq!(DeploymentState::RolledBack.as_str(), "rolled_back");
    assert!(!DeploymentState::Queued.is_rollback_target());
    assert!(DeploymentState::Failed.is_rollback_target());
}
