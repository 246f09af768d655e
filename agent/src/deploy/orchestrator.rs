//! Deployment orchestrator.
//!
//! Turns triggers into queued tasks and drains the queue one task at a
//! time. Each state change is written to the [`DeploymentStore`] before the
//! matching [`StatusEvent`] is broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backup::BackupService;
use crate::command::coordinator::CommandCoordinator;
use crate::command::workflow::{BackupRef, DeploymentParams, OperationsReport, RollbackOptions};
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use crate::deploy::queue::{DeploymentQueue, QueueStatus};
use crate::deploy::store::DeploymentStore;
use crate::errors::DeployError;
use crate::models::deployment::{
    DeploymentLog, DeploymentRecord, DeploymentTask, DeploymentUpdate, TaskType, TriggerParams,
    WebhookDecision,
};

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Repository deployed when a trigger names none
    pub source_repository: String,
    pub default_branch: String,
    pub source_root: String,
    pub target_root: String,
    pub allowed_dirs: Vec<String>,
    pub extensions: Vec<String>,

    /// Refuse to deploy without a validated pre-deployment backup
    pub require_backup: bool,

    /// Queue a rollback when a deployment fails after writing files
    pub rollback_on_failure: bool,

    /// Remote directory with plain backup copies for the legacy rollback
    pub legacy_backup_root: Option<String>,

    pub max_retries: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            source_repository: "config".to_string(),
            default_branch: "main".to_string(),
            source_root: String::new(),
            target_root: "/srv/config".to_string(),
            allowed_dirs: Vec::new(),
            extensions: vec![
                ".yml".to_string(),
                ".yaml".to_string(),
                ".json".to_string(),
                ".conf".to_string(),
                ".env".to_string(),
            ],
            require_backup: true,
            rollback_on_failure: false,
            legacy_backup_root: None,
            max_retries: 3,
        }
    }
}

/// Kind of status event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Queued,
    Started,
    Retrying,
    Completed,
    Failed,
    RolledBack,
}

/// Status change broadcast to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub event: EventKind,
    pub deployment_id: String,
    pub status: DeploymentState,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Orchestrator status
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub processing: bool,
    pub current: Option<String>,
    pub queue: QueueStatus,
}

/// Resets the processing flag when the drain loop ends or is dropped
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Deployment orchestrator
pub struct Orchestrator {
    options: OrchestratorOptions,
    queue: DeploymentQueue,
    coordinator: Arc<CommandCoordinator>,
    backups: Option<Arc<dyn BackupService>>,
    store: Arc<dyn DeploymentStore>,
    events: broadcast::Sender<StatusEvent>,
    processing: AtomicBool,
    current: RwLock<Option<String>>,
}

impl Orchestrator {
    pub fn new(
        options: OrchestratorOptions,
        queue: DeploymentQueue,
        coordinator: Arc<CommandCoordinator>,
        backups: Option<Arc<dyn BackupService>>,
        store: Arc<dyn DeploymentStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            options,
            queue,
            coordinator,
            backups,
            store,
            events,
            processing: AtomicBool::new(false),
            current: RwLock::new(None),
        }
    }

    pub fn queue(&self) -> &DeploymentQueue {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    /// Subscribe to status events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            processing: self.processing.load(Ordering::SeqCst),
            current: self.current(),
            queue: self.queue.status(),
        }
    }

    /// Id of the in-flight task
    pub fn current(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_current(&self, id: Option<String>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = id;
    }

    fn emit(&self, event: EventKind, id: &str, status: DeploymentState, message: Option<String>) {
        let _ = self.events.send(StatusEvent {
            event,
            deployment_id: id.to_string(),
            status,
            timestamp: Utc::now(),
            message,
        });
    }

    async fn log(&self, id: &str, log: DeploymentLog) {
        if let Err(e) = self.store.add_deployment_log(id, log).await {
            warn!("Could not record log for {}: {}", id, e);
        }
    }

    /// Queue a deployment, returning its id
    pub async fn trigger_deployment(&self, params: TriggerParams) -> Result<String, DeployError> {
        let repository = params
            .repository
            .unwrap_or_else(|| self.options.source_repository.clone());
        let branch = params
            .branch
            .unwrap_or_else(|| self.options.default_branch.clone());
        let requested_by = params.requested_by.unwrap_or_else(|| "system".to_string());

        let mut task = DeploymentTask::deployment(&repository, &branch, &requested_by)
            .with_max_retries(self.options.max_retries);
        task.priority = params.priority;
        task.require_backup = params.require_backup;
        if let Some(correlation_id) = params.correlation_id {
            task.correlation_id = correlation_id;
        }

        self.submit(task).await
    }

    /// Queue a rollback of `original_id` to its pre-deployment backup
    pub async fn trigger_rollback(
        &self,
        original_id: &str,
        requested_by: &str,
    ) -> Result<String, DeployError> {
        let original = self
            .store
            .get_deployment(original_id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("deployment {}", original_id)))?;

        if original.task_type != TaskType::Deployment {
            return Err(DeployError::ValidationError(format!(
                "rollback: {} is not a deployment",
                original_id
            )));
        }
        if !original.state.is_rollback_target() {
            return Err(DeployError::ValidationError(format!(
                "rollback: deployment {} is {}",
                original_id,
                original.state.as_str()
            )));
        }

        let backups = self.backups.as_ref().ok_or_else(|| {
            DeployError::NotFound(format!(
                "rollback: no backup service to restore deployment {}",
                original_id
            ))
        })?;
        if backups.find_pre_deployment_backup(original_id).await?.is_none() {
            return Err(DeployError::NotFound(format!(
                "rollback: no pre-deployment backup for deployment {}",
                original_id
            )));
        }

        if let Some(existing) = self.queue.pending_rollback(original_id) {
            return Err(DeployError::ValidationError(format!(
                "rollback: deployment {} is already being rolled back by {}",
                original_id, existing
            )));
        }

        let task = DeploymentTask::rollback(&original, requested_by);
        self.submit(task).await
    }

    /// Queue a restore of a catalogued backup onto the target
    pub async fn restore_backup(&self, backup_id: &str, requested_by: &str) -> Result<String, DeployError> {
        let backups = self.backups.as_ref().ok_or_else(|| {
            DeployError::NotFound("restore: no backup service configured".to_string())
        })?;
        // the task validates again before restoring
        let report = backups.validate_backup(backup_id).await?;
        if !report.valid {
            return Err(DeployError::Integrity(format!(
                "restore: backup {} failed validation: {}",
                backup_id,
                report.errors.join("; ")
            )));
        }

        self.submit(DeploymentTask::restore(backup_id, requested_by))
            .await
    }

    /// Act on a verified webhook
    pub async fn handle_webhook(&self, decision: WebhookDecision) -> Result<Option<String>, DeployError> {
        if !decision.should_deploy {
            debug!(
                "Webhook for {}@{} does not require a deployment",
                decision.repository, decision.branch
            );
            return Ok(None);
        }

        let id = self
            .trigger_deployment(TriggerParams {
                repository: Some(decision.repository),
                branch: Some(decision.branch),
                requested_by: Some("webhook".to_string()),
                ..Default::default()
            })
            .await?;
        Ok(Some(id))
    }

    /// Persist, enqueue and announce a new task
    async fn submit(&self, task: DeploymentTask) -> Result<String, DeployError> {
        let id = task.id.clone();
        let record = DeploymentRecord::from(&task);
        self.store.create_deployment(record).await?;

        if let Err(e) = self.queue.enqueue(task) {
            warn!("Could not queue {}: {}", id, e);
            let update = DeploymentUpdate {
                state: Some(DeploymentState::Failed),
                finished_at: Some(Utc::now()),
                error: Some(e.to_string()),
                ..Default::default()
            };
            if let Err(store_err) = self.store.update_deployment(&id, update).await {
                error!("Could not record rejected task {}: {}", id, store_err);
            }
            return Err(e);
        }

        self.log(&id, DeploymentLog::info("Queued")).await;
        self.emit(EventKind::Queued, &id, DeploymentState::Queued, None);
        Ok(id)
    }

    /// Drain the queue, returning how many tasks were executed.
    ///
    /// Returns 0 straight away when another drain is running.
    pub async fn process_queue(&self) -> usize {
        if self.processing.swap(true, Ordering::SeqCst) {
            debug!("Queue is already being processed");
            return 0;
        }
        let _guard = ProcessingGuard(&self.processing);

        let mut executed = 0;
        while let Some(task) = self.queue.dequeue() {
            let id = task.id.clone();
            self.set_current(Some(id.clone()));
            if let Err(e) = self.execute_task(&task).await {
                self.abandon(&task, e).await;
            }
            self.set_current(None);
            executed += 1;
        }
        executed
    }

    async fn execute_task(&self, task: &DeploymentTask) -> Result<(), DeployError> {
        let mut fsm = DeploymentFsm::from_state(DeploymentState::Queued);
        let state = fsm.process(DeploymentEvent::Start)?.clone();

        let update = DeploymentUpdate {
            state: Some(state.clone()),
            retry_count: Some(task.retry_count),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        self.store.update_deployment(&task.id, update).await?;
        self.log(
            &task.id,
            DeploymentLog::info(format!("Started by {}", task.requested_by)),
        )
        .await;
        self.emit(EventKind::Started, &task.id, state, None);

        match task.task_type {
            TaskType::Deployment => {
                let report = self.run_deployment(task).await;
                self.finish_deployment(task, fsm, report).await
            }
            TaskType::Rollback => {
                let report = self.run_rollback(task).await;
                self.finish_rollback(task, fsm, report).await
            }
        }
    }

    async fn run_deployment(&self, task: &DeploymentTask) -> OperationsReport {
        let params = DeploymentParams {
            deployment_id: task.id.clone(),
            repository: task.repository.clone(),
            branch: task.branch.clone(),
            source_root: self.options.source_root.clone(),
            target_root: self.options.target_root.clone(),
            allowed_dirs: self.options.allowed_dirs.clone(),
            extensions: self.options.extensions.clone(),
            require_backup: task.require_backup.unwrap_or(self.options.require_backup),
        };
        self.coordinator
            .deployment_operations(&params, self.backups.as_deref())
            .await
    }

    async fn run_rollback(&self, task: &DeploymentTask) -> OperationsReport {
        let (backup_ref, snapshot_current) = match (&task.rollback_of, &task.backup_id) {
            (Some(original), _) => (BackupRef::Deployment(original.clone()), false),
            (None, Some(backup_id)) => (BackupRef::Backup(backup_id.clone()), true),
            (None, None) => (BackupRef::Deployment(String::new()), false),
        };
        let options = RollbackOptions {
            target_root: self.options.target_root.clone(),
            snapshot_current,
            legacy_root: self.options.legacy_backup_root.clone(),
        };
        self.coordinator
            .rollback_operations(&backup_ref, &options, self.backups.as_deref())
            .await
    }

    async fn finish_deployment(
        &self,
        task: &DeploymentTask,
        mut fsm: DeploymentFsm,
        report: OperationsReport,
    ) -> Result<(), DeployError> {
        if report.success {
            return self.complete(task, fsm, report).await;
        }

        let reason = report
            .error
            .clone()
            .unwrap_or_else(|| "deployment failed".to_string());

        if report.retryable {
            match self.queue.retry(&task.id) {
                Ok(retried) => {
                    let state = fsm.process(DeploymentEvent::Requeue)?.clone();
                    let update = DeploymentUpdate {
                        state: Some(state.clone()),
                        retry_count: Some(retried.retry_count),
                        error: Some(reason.clone()),
                        report: Some(report),
                        ..Default::default()
                    };
                    self.store.update_deployment(&task.id, update).await?;
                    let message = format!(
                        "Transient failure, retry {}/{}: {}",
                        retried.retry_count, retried.max_retries, reason
                    );
                    self.log(&task.id, DeploymentLog::warn(&message)).await;
                    self.emit(EventKind::Retrying, &task.id, state, Some(message));
                    return Ok(());
                }
                Err(e) => warn!("Not retrying {}: {}", task.id, e),
            }
        }

        let wrote_files = !report.files_written.is_empty();
        let had_backup = report.backup_id.is_some();
        self.fail(&task.id, fsm, reason, Some(report)).await?;

        if self.options.rollback_on_failure && wrote_files && had_backup {
            info!("Deployment {} failed after writing files, rolling back", task.id);
            if let Err(e) = self.trigger_rollback(&task.id, "system").await {
                error!("Automatic rollback of {} could not be queued: {}", task.id, e);
            }
        }
        Ok(())
    }

    async fn finish_rollback(
        &self,
        task: &DeploymentTask,
        fsm: DeploymentFsm,
        report: OperationsReport,
    ) -> Result<(), DeployError> {
        if !report.success {
            let reason = report
                .error
                .clone()
                .unwrap_or_else(|| "rollback failed".to_string());
            return self.fail(&task.id, fsm, reason, Some(report)).await;
        }

        if let Some(original_id) = &task.rollback_of {
            self.mark_rolled_back(original_id, &task.id).await?;
        }
        self.complete(task, fsm, report).await
    }

    async fn mark_rolled_back(&self, original_id: &str, rollback_id: &str) -> Result<(), DeployError> {
        let original = self
            .store
            .get_deployment(original_id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("deployment {}", original_id)))?;

        let mut fsm = DeploymentFsm::from_state(original.state);
        let state = fsm.process(DeploymentEvent::RollBack)?.clone();
        let update = DeploymentUpdate {
            state: Some(state.clone()),
            rolled_back_by: Some(rollback_id.to_string()),
            ..Default::default()
        };
        self.store.update_deployment(original_id, update).await?;
        let message = format!("Rolled back by {}", rollback_id);
        self.log(original_id, DeploymentLog::info(&message)).await;
        self.emit(EventKind::RolledBack, original_id, state, Some(message));
        Ok(())
    }

    async fn complete(
        &self,
        task: &DeploymentTask,
        mut fsm: DeploymentFsm,
        report: OperationsReport,
    ) -> Result<(), DeployError> {
        let state = fsm.process(DeploymentEvent::Succeed)?.clone();
        let message = format!("Completed, {} files written", report.files_written.len());
        let update = DeploymentUpdate {
            state: Some(state.clone()),
            finished_at: Some(Utc::now()),
            backup_id: report.backup_id.clone(),
            report: Some(report),
            ..Default::default()
        };
        self.store.update_deployment(&task.id, update).await?;
        if !self.queue.mark_completed(&task.id) {
            warn!("Task {} had already left the processing set", task.id);
        }
        self.log(&task.id, DeploymentLog::info(&message)).await;
        info!("Task {} completed", task.id);
        self.emit(EventKind::Completed, &task.id, state, Some(message));
        Ok(())
    }

    async fn fail(
        &self,
        id: &str,
        mut fsm: DeploymentFsm,
        reason: String,
        report: Option<OperationsReport>,
    ) -> Result<(), DeployError> {
        let state = fsm.process(DeploymentEvent::Fail(reason.clone()))?.clone();
        let update = DeploymentUpdate {
            state: Some(state.clone()),
            finished_at: Some(Utc::now()),
            error: Some(reason.clone()),
            backup_id: report.as_ref().and_then(|r| r.backup_id.clone()),
            report,
            ..Default::default()
        };
        self.store.update_deployment(id, update).await?;
        self.queue.mark_failed(id, &reason);
        self.log(id, DeploymentLog::error(&reason)).await;
        error!("Task {} failed: {}", id, reason);
        self.emit(EventKind::Failed, id, state, Some(reason));
        Ok(())
    }

    /// State machine positioned at the stored state of `id`, started if still queued
    async fn stored_fsm(&self, id: &str) -> Result<DeploymentFsm, DeployError> {
        let record = self
            .store
            .get_deployment(id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("deployment {}", id)))?;
        let mut fsm = DeploymentFsm::from_state(record.state);
        if fsm.state() == &DeploymentState::Queued {
            fsm.process(DeploymentEvent::Start)?;
        }
        Ok(fsm)
    }

    /// Record a task whose execution ended in an error as failed
    async fn abandon(&self, task: &DeploymentTask, cause: DeployError) {
        let reason = cause.to_string();
        error!("Task {} aborted: {}", task.id, reason);
        // a retry may have been queued before the error
        self.queue.remove(&task.id);

        let recorded = match self.stored_fsm(&task.id).await {
            Ok(fsm) => self.fail(&task.id, fsm, reason.clone(), None).await,
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            error!("Could not record failure of {}: {}", task.id, e);
            self.queue.mark_failed(&task.id, &reason);
        }
    }

    /// Mark the in-flight task failed with `reason`, used when shutting down
    pub async fn fail_in_flight(&self, reason: &str) -> Option<String> {
        let id = self.current()?;
        self.set_current(None);

        let recorded = match self.stored_fsm(&id).await {
            Ok(fsm) => self.fail(&id, fsm, reason.to_string(), None).await,
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            error!("Could not mark {} failed: {}", id, e);
            self.queue.mark_failed(&id, reason);
        }
        warn!("In-flight task {} marked failed: {}", id, reason);
        Some(id)
    }

    pub async fn deployment(&self, id: &str) -> Result<Option<DeploymentRecord>, DeployError> {
        self.store.get_deployment(id).await
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<DeploymentRecord>, DeployError> {
        self.store.get_deployment_history(limit).await
    }
}
