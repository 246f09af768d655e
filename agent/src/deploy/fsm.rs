//! Finite State Machine for deployment tasks

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Deployment state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Waiting in the queue
    Queued,

    /// Picked up by the deployer worker
    InProgress,

    /// All operations applied
    Completed,

    /// Aborted, see the record's error and report
    Failed,

    /// Reverted by a later rollback task
    RolledBack,
}

impl DeploymentState {
    /// Terminal for the task id that reached it
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Completed | DeploymentState::Failed | DeploymentState::RolledBack
        )
    }

    /// A rollback may target a deployment in this state
    pub fn is_rollback_target(&self) -> bool {
        matches!(self, DeploymentState::Completed | DeploymentState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Queued => "queued",
            DeploymentState::InProgress => "in_progress",
            DeploymentState::Completed => "completed",
            DeploymentState::Failed => "failed",
            DeploymentState::RolledBack => "rolled_back",
        }
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Dequeued by the worker
    Start,

    /// Execution finished successfully
    Succeed,

    /// Execution failed
    Fail(String),

    /// Transient failure accepted by the queue's retry
    Requeue,

    /// A rollback task restored the pre-deployment backup
    RollBack,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
    retry_count: u32,
}

impl DeploymentFsm {
    /// Create a new FSM in queued state
    pub fn new() -> Self {
        Self::from_state(DeploymentState::Queued)
    }

    /// Resume from a persisted state
    pub fn from_state(state: DeploymentState) -> Self {
        Self {
            state,
            error: None,
            retry_count: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> &DeploymentState {
        &self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Get retry count
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<&DeploymentState, DeployError> {
        let new_state = match (&self.state, &event) {
            // From Queued
            (DeploymentState::Queued, DeploymentEvent::Start) => {
                self.error = None;
                DeploymentState::InProgress
            }

            // From InProgress
            (DeploymentState::InProgress, DeploymentEvent::Succeed) => DeploymentState::Completed,
            (DeploymentState::InProgress, DeploymentEvent::Fail(err)) => {
                self.error = Some(err.clone());
                DeploymentState::Failed
            }
            (DeploymentState::InProgress, DeploymentEvent::Requeue) => {
                self.retry_count += 1;
                DeploymentState::Queued
            }

            // Terminal states only leave through a rollback
            (DeploymentState::Completed, DeploymentEvent::RollBack)
            | (DeploymentState::Failed, DeploymentEvent::RollBack) => DeploymentState::RolledBack,

            // Invalid transitions
            (state, event) => {
                return Err(DeployError::ValidationError(format!(
                    "Invalid transition: {:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        Ok(&self.state)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
