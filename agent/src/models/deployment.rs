//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::workflow::OperationsReport;
use crate::deploy::fsm::DeploymentState;
use crate::utils::generate_id;

/// Urgency of a queued task. Declaration order is rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Numeric rank, higher is dequeued first
    pub fn rank(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Deployment,
    Rollback,
}

/// A unit of work in the deployment queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTask {
    pub id: String,
    pub repository: String,
    pub branch: String,
    pub requested_by: String,
    /// `None` means the queue assigns its default
    pub priority: Option<Priority>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub queued_at: DateTime<Utc>,
    pub task_type: TaskType,
    pub correlation_id: String,
    pub state: DeploymentState,

    /// Original deployment a rollback task reverts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<String>,

    /// Catalogued backup a manual restore task applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,

    /// Per-task override of the pre-deployment backup requirement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_backup: Option<bool>,
}

impl DeploymentTask {
    /// New deployment task for `repository`@`branch`
    pub fn deployment(repository: &str, branch: &str, requested_by: &str) -> Self {
        Self {
            id: generate_id("deploy"),
            repository: repository.to_string(),
            branch: branch.to_string(),
            requested_by: requested_by.to_string(),
            priority: None,
            retry_count: 0,
            max_retries: 3,
            queued_at: Utc::now(),
            task_type: TaskType::Deployment,
            correlation_id: generate_id("corr"),
            state: DeploymentState::Queued,
            rollback_of: None,
            backup_id: None,
            require_backup: None,
        }
    }

    /// New rollback task reverting `original`
    pub fn rollback(original: &DeploymentRecord, requested_by: &str) -> Self {
        Self {
            id: generate_id("rollback"),
            repository: original.repository.clone(),
            branch: original.branch.clone(),
            requested_by: requested_by.to_string(),
            priority: Some(Priority::Urgent),
            retry_count: 0,
            max_retries: 0,
            queued_at: Utc::now(),
            task_type: TaskType::Rollback,
            correlation_id: original.correlation_id.clone(),
            state: DeploymentState::Queued,
            rollback_of: Some(original.id.clone()),
            backup_id: None,
            require_backup: None,
        }
    }

    /// New rollback task restoring a catalogued backup onto the target
    pub fn restore(backup_id: &str, requested_by: &str) -> Self {
        Self {
            id: generate_id("restore"),
            repository: String::new(),
            branch: String::new(),
            requested_by: requested_by.to_string(),
            priority: Some(Priority::Urgent),
            retry_count: 0,
            max_retries: 0,
            queued_at: Utc::now(),
            task_type: TaskType::Rollback,
            correlation_id: generate_id("corr"),
            state: DeploymentState::Queued,
            rollback_of: None,
            backup_id: Some(backup_id.to_string()),
            require_backup: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Effective priority once the queue has assigned a default
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    /// What the task acts on: the repository for deployments, the original
    /// deployment or the backup for rollbacks
    pub fn target(&self) -> Option<&str> {
        let target = match self.task_type {
            TaskType::Deployment => Some(self.repository.as_str()),
            TaskType::Rollback => self.rollback_of.as_deref().or(self.backup_id.as_deref()),
        };
        target.filter(|t| !t.trim().is_empty())
    }
}

/// Log entry attached to a deployment record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentLog {
    /// Log level: 'info', 'warn', 'error', 'debug'
    pub level: String,

    pub message: String,

    pub timestamp: DateTime<Utc>,
}

impl DeploymentLog {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new("info", message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new("warn", message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", message)
    }

    fn new(level: &str, message: impl Into<String>) -> Self {
        Self {
            level: level.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Persisted view of a task and its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub task_type: TaskType,
    pub repository: String,
    pub branch: String,
    pub requested_by: String,
    pub priority: Priority,
    pub correlation_id: String,
    pub state: DeploymentState,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,

    /// Pre-deployment backup taken for this deployment
    pub backup_id: Option<String>,

    pub rollback_of: Option<String>,
    pub rolled_back_by: Option<String>,
    pub report: Option<OperationsReport>,

    #[serde(default)]
    pub logs: Vec<DeploymentLog>,
}

impl From<&DeploymentTask> for DeploymentRecord {
    fn from(task: &DeploymentTask) -> Self {
        Self {
            id: task.id.clone(),
            task_type: task.task_type,
            repository: task.repository.clone(),
            branch: task.branch.clone(),
            requested_by: task.requested_by.clone(),
            priority: task.effective_priority(),
            correlation_id: task.correlation_id.clone(),
            state: task.state.clone(),
            retry_count: task.retry_count,
            created_at: task.queued_at,
            started_at: None,
            finished_at: None,
            error: None,
            backup_id: task.backup_id.clone(),
            rollback_of: task.rollback_of.clone(),
            rolled_back_by: None,
            report: None,
            logs: Vec::new(),
        }
    }
}

/// Partial update applied by `DeploymentStore::update_deployment`
#[derive(Debug, Clone, Default)]
pub struct DeploymentUpdate {
    pub state: Option<DeploymentState>,
    pub retry_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub backup_id: Option<String>,
    pub rolled_back_by: Option<String>,
    pub report: Option<OperationsReport>,
}

impl DeploymentUpdate {
    pub fn state(state: DeploymentState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn apply(self, record: &mut DeploymentRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(retry_count) = self.retry_count {
            record.retry_count = retry_count;
        }
        if self.started_at.is_some() {
            record.started_at = self.started_at;
        }
        if self.finished_at.is_some() {
            record.finished_at = self.finished_at;
        }
        if self.error.is_some() {
            record.error = self.error;
        }
        if self.backup_id.is_some() {
            record.backup_id = self.backup_id;
        }
        if self.rolled_back_by.is_some() {
            record.rolled_back_by = self.rolled_back_by;
        }
        if self.report.is_some() {
            record.report = self.report;
        }
    }
}

/// Parameters accepted by `Orchestrator::trigger_deployment`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerParams {
    /// Defaults to the configured source repository
    pub repository: Option<String>,
    pub branch: Option<String>,
    /// Supplied by the identity layer
    pub requested_by: Option<String>,
    pub priority: Option<Priority>,
    pub correlation_id: Option<String>,
    pub require_backup: Option<bool>,
}

/// Normalized outcome of webhook verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDecision {
    pub should_deploy: bool,
    pub repository: String,
    pub branch: String,
}
