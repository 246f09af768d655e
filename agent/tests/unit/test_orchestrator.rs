//! Orchestrator tests over an in-memory remote

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use confdeploy::backup::catalog::BackupQuery;
use confdeploy::backup::BackupService;
use confdeploy::command::executor::{CommandExecutor, CommandOutput, Invocation};
use confdeploy::command::memory::{Failure, MemoryExecutor};
use confdeploy::deploy::fsm::DeploymentState;
use confdeploy::deploy::orchestrator::{EventKind, StatusEvent};
use confdeploy::deploy::store::DeploymentStore;
use confdeploy::errors::DeployError;
use confdeploy::models::backup::BackupType;
use confdeploy::models::deployment::{
    DeploymentUpdate, Priority, TaskType, TriggerParams, WebhookDecision,
};
use confdeploy::workers::deployer;

use crate::common::{compose_file, orchestrator_options, Fixture, REPOSITORY};

fn drain(events: &mut tokio::sync::broadcast::Receiver<StatusEvent>) -> Vec<(EventKind, String)> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push((event.event, event.deployment_id));
    }
    received
}

#[tokio::test]
async fn test_deployment_writes_filtered_files_after_backup() {
    let fixture = Fixture::new().await;
    let id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();

    assert_eq!(fixture.orchestrator.process_queue().await, 1);

    let record = fixture.orchestrator.deployment(&id).await.unwrap().unwrap();
    assert_eq!(record.state, DeploymentState::Completed);
    assert_eq!(record.requested_by, "system");
    assert!(record.started_at.is_some());
    assert!(record.finished_at.is_some());

    let report = record.report.unwrap();
    assert!(report.success);
    assert_eq!(report.files_written.len(), 3);
    assert_eq!(
        fixture.target_file("docker-compose.yml"),
        Some(compose_file("v2"))
    );
    assert!(fixture
        .target_file("nginx/nginx.conf")
        .unwrap()
        .contains("worker_processes 4"));
    assert!(fixture.target_file("README.md").is_none());

    // the pre-deployment backup holds the old tree and is linked to the record
    let backup_id = record.backup_id.unwrap();
    let backup = fixture.backups().get_backup(&backup_id).await.unwrap();
    assert_eq!(backup.backup_type, BackupType::PreDeployment);
    assert_eq!(backup.deployment_id.as_deref(), Some(id.as_str()));
    assert_eq!(backup.file_count, 3);
    assert!(backup.verification.verified);

    assert!(fixture.orchestrator.queue().is_empty());
    assert!(!fixture.orchestrator.queue().is_processing(&id));
}

#[tokio::test]
async fn test_backup_failure_is_tolerated_when_not_required() {
    let mut options = orchestrator_options();
    options.require_backup = false;
    let fixture = Fixture::build(options, true).await;
    fixture.executor.fail_operation(
        "list_directory",
        Failure::Exit {
            code: 5,
            stderr: "EIO".to_string(),
        },
        Some(1),
    );

    let id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;

    let record = fixture.orchestrator.deployment(&id).await.unwrap().unwrap();
    assert_eq!(record.state, DeploymentState::Completed);
    assert!(record.backup_id.is_none());

    let report = record.report.unwrap();
    let backup_steps = report.outcomes("create_backup");
    assert_eq!(backup_steps.len(), 1);
    assert!(!backup_steps[0].success);
    assert!(!backup_steps[0].fatal);
    assert_eq!(
        fixture.target_file("docker-compose.yml"),
        Some(compose_file("v2"))
    );
    assert_eq!(fixture.backups().stats().await.count, 0);
}

#[tokio::test]
async fn test_backup_failure_aborts_when_required() {
    let fixture = Fixture::new().await;
    fixture.executor.fail_operation(
        "list_directory",
        Failure::Exit {
            code: 5,
            stderr: "EIO".to_string(),
        },
        Some(1),
    );

    let id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;

    let record = fixture.orchestrator.deployment(&id).await.unwrap().unwrap();
    assert_eq!(record.state, DeploymentState::Failed);
    assert!(record.error.unwrap().contains("create_backup"));
    assert_eq!(fixture.executor.count_operation("write_file"), 0);
    assert_eq!(
        fixture.target_file("docker-compose.yml"),
        Some(compose_file("v1"))
    );
}

#[tokio::test]
async fn test_trigger_can_override_backup_requirement() {
    let fixture = Fixture::build(orchestrator_options(), false).await;

    let required = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;
    let record = fixture.orchestrator.deployment(&required).await.unwrap().unwrap();
    assert_eq!(record.state, DeploymentState::Failed);

    let waived = fixture
        .orchestrator
        .trigger_deployment(TriggerParams {
            require_backup: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;
    let record = fixture.orchestrator.deployment(&waived).await.unwrap().unwrap();
    assert_eq!(record.state, DeploymentState::Completed);
}

#[tokio::test]
async fn test_rollback_restores_pre_deployment_tree() {
    let fixture = Fixture::new().await;
    fixture
        .executor
        .put_repository_file(REPOSITORY, "extra.yml", "added: true\n");
    let deployment_id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;
    assert_eq!(
        fixture.target_file("docker-compose.yml"),
        Some(compose_file("v2"))
    );
    assert!(fixture.target_file("extra.yml").is_some());

    let mut events = fixture.orchestrator.subscribe();
    let rollback_id = fixture
        .orchestrator
        .trigger_rollback(&deployment_id, "operator")
        .await
        .unwrap();
    assert_eq!(fixture.orchestrator.process_queue().await, 1);

    assert_eq!(
        fixture.target_file("docker-compose.yml"),
        Some(compose_file("v1"))
    );
    assert!(fixture.target_file(".env").unwrap().contains("RELEASE=v1"));
    // files the deployment added are gone again
    assert_eq!(fixture.target_file("extra.yml"), None);

    let original = fixture
        .orchestrator
        .deployment(&deployment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.state, DeploymentState::RolledBack);
    assert_eq!(original.rolled_back_by.as_deref(), Some(rollback_id.as_str()));

    let rollback = fixture
        .orchestrator
        .deployment(&rollback_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rollback.task_type, TaskType::Rollback);
    assert_eq!(rollback.state, DeploymentState::Completed);
    assert_eq!(rollback.priority, Priority::Urgent);
    assert_eq!(rollback.rollback_of.as_deref(), Some(deployment_id.as_str()));
    assert_eq!(rollback.correlation_id, original.correlation_id);

    // the backup records which deployment it reverted
    let backup = fixture
        .backups()
        .get_backup(original.backup_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(
        backup.rollback.map(|r| r.deployment_id),
        Some(deployment_id.clone())
    );

    let received = drain(&mut events);
    assert!(received.contains(&(EventKind::RolledBack, deployment_id)));
    assert_eq!(received.last(), Some(&(EventKind::Completed, rollback_id)));
}

#[tokio::test]
async fn test_rollback_requires_a_pre_deployment_backup() {
    let mut options = orchestrator_options();
    options.require_backup = false;
    let fixture = Fixture::build(options, false).await;

    let id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;

    let result = fixture.orchestrator.trigger_rollback(&id, "operator").await;
    assert!(matches!(result, Err(DeployError::NotFound(_))));

    let result = fixture.orchestrator.trigger_rollback("deploy-missing", "operator").await;
    assert!(matches!(result, Err(DeployError::NotFound(_))));
}

#[tokio::test]
async fn test_rolled_back_deployment_cannot_be_rolled_back_again() {
    let fixture = Fixture::new().await;
    let id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;
    fixture.orchestrator.trigger_rollback(&id, "operator").await.unwrap();
    fixture.orchestrator.process_queue().await;

    let result = fixture.orchestrator.trigger_rollback(&id, "operator").await;
    assert!(matches!(result, Err(DeployError::ValidationError(_))));
}

#[tokio::test]
async fn test_queued_deployment_cannot_be_rolled_back() {
    let fixture = Fixture::new().await;
    let id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();

    let result = fixture.orchestrator.trigger_rollback(&id, "operator").await;
    assert!(matches!(result, Err(DeployError::ValidationError(_))));
}

#[tokio::test]
async fn test_second_rollback_is_rejected_while_first_is_queued() {
    let fixture = Fixture::new().await;
    let deployment_id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;

    let first = fixture
        .orchestrator
        .trigger_rollback(&deployment_id, "operator")
        .await
        .unwrap();
    let result = fixture
        .orchestrator
        .trigger_rollback(&deployment_id, "operator")
        .await;
    assert!(matches!(result, Err(DeployError::ValidationError(msg)) if msg.contains(&first)));

    assert_eq!(fixture.orchestrator.process_queue().await, 1);
    let record = fixture.orchestrator.deployment(&first).await.unwrap().unwrap();
    assert_eq!(record.state, DeploymentState::Completed);
}

#[tokio::test]
async fn test_error_after_start_is_recorded_as_failed() {
    let fixture = Fixture::new().await;
    let deployment_id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;
    let rollback_id = fixture
        .orchestrator
        .trigger_rollback(&deployment_id, "operator")
        .await
        .unwrap();

    // the original leaves the rollback-able states behind the queue's back
    fixture
        .orchestrator
        .store()
        .update_deployment(
            &deployment_id,
            DeploymentUpdate::state(DeploymentState::RolledBack),
        )
        .await
        .unwrap();

    let mut events = fixture.orchestrator.subscribe();
    assert_eq!(fixture.orchestrator.process_queue().await, 1);

    let rollback = fixture
        .orchestrator
        .deployment(&rollback_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rollback.state, DeploymentState::Failed);
    assert!(rollback.finished_at.is_some());
    assert!(rollback.error.is_some());
    assert!(!fixture.orchestrator.queue().contains(&rollback_id));
    assert_eq!(
        drain(&mut events).last(),
        Some(&(EventKind::Failed, rollback_id))
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let fixture = Fixture::new().await;
    fixture
        .executor
        .fail_operation("get_file_contents", Failure::Timeout, Some(1));
    let mut events = fixture.orchestrator.subscribe();

    let id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    assert_eq!(fixture.orchestrator.process_queue().await, 2);

    let record = fixture.orchestrator.deployment(&id).await.unwrap().unwrap();
    assert_eq!(record.state, DeploymentState::Completed);
    assert_eq!(record.retry_count, 1);
    assert_eq!(
        fixture.target_file("docker-compose.yml"),
        Some(compose_file("v2"))
    );

    let kinds: Vec<EventKind> = drain(&mut events).into_iter().map(|(kind, _)| kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Queued,
            EventKind::Started,
            EventKind::Retrying,
            EventKind::Started,
            EventKind::Completed,
        ]
    );
}

#[tokio::test]
async fn test_failure_after_writes_is_not_retried() {
    let fixture = Fixture::new().await;
    fixture.executor.fail_operation(
        "write_file",
        Failure::Exit {
            code: 1,
            stderr: "EROFS".to_string(),
        },
        None,
    );
    let id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();

    assert_eq!(fixture.orchestrator.process_queue().await, 1);
    let record = fixture.orchestrator.deployment(&id).await.unwrap().unwrap();
    assert_eq!(record.state, DeploymentState::Failed);
    assert_eq!(record.retry_count, 0);
    let report = record.report.unwrap();
    assert_eq!(report.fatal().map(|o| o.operation.as_str()), Some("write_file"));
    assert!(!report.retryable);
}

#[tokio::test]
async fn test_rollback_on_failure_queues_rollback() {
    let mut options = orchestrator_options();
    options.rollback_on_failure = true;
    let executor = Arc::new(MemoryExecutor::new());
    let failing = Arc::new(FailNthWrite {
        inner: executor.clone(),
        fail_at: 1,
        writes: AtomicUsize::new(0),
    });
    let fixture = Fixture::with_executor(executor, failing, options, true).await;

    let id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    // the failed deployment and the rollback it queued
    assert_eq!(fixture.orchestrator.process_queue().await, 2);

    let record = fixture.orchestrator.deployment(&id).await.unwrap().unwrap();
    assert_eq!(record.state, DeploymentState::RolledBack);
    assert_eq!(record.report.unwrap().files_written.len(), 1);
    assert_eq!(
        fixture.target_file("docker-compose.yml"),
        Some(compose_file("v1"))
    );
    assert!(fixture.target_file(".env").unwrap().contains("RELEASE=v1"));

    let history = fixture.orchestrator.history(10).await.unwrap();
    let rollback = history
        .iter()
        .find(|r| r.task_type == TaskType::Rollback)
        .unwrap();
    assert_eq!(rollback.requested_by, "system");
    assert_eq!(rollback.state, DeploymentState::Completed);
}

/// Fails exactly one `write_file` call, the `fail_at`-th (zero based)
struct FailNthWrite {
    inner: Arc<MemoryExecutor>,
    fail_at: usize,
    writes: AtomicUsize,
}

#[async_trait]
impl CommandExecutor for FailNthWrite {
    async fn is_reachable(&self, program: &str) -> bool {
        self.inner.is_reachable(program).await
    }

    async fn execute(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError> {
        if invocation.operation == "write_file"
            && self.writes.fetch_add(1, Ordering::SeqCst) == self.fail_at
        {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: "EROFS: read-only file system".to_string(),
                exit_code: 1,
                duration: Duration::ZERO,
            });
        }
        self.inner.execute(invocation, timeout).await
    }
}

#[tokio::test]
async fn test_webhook_decisions() {
    let fixture = Fixture::new().await;

    let skipped = fixture
        .orchestrator
        .handle_webhook(WebhookDecision {
            should_deploy: false,
            repository: "config-repo".to_string(),
            branch: "feature".to_string(),
        })
        .await
        .unwrap();
    assert!(skipped.is_none());
    assert!(fixture.orchestrator.queue().is_empty());

    let id = fixture
        .orchestrator
        .handle_webhook(WebhookDecision {
            should_deploy: true,
            repository: "config-repo".to_string(),
            branch: "main".to_string(),
        })
        .await
        .unwrap()
        .unwrap();
    let record = fixture.orchestrator.deployment(&id).await.unwrap().unwrap();
    assert_eq!(record.requested_by, "webhook");
    assert_eq!(record.state, DeploymentState::Queued);
}

#[tokio::test]
async fn test_rejected_enqueue_is_recorded_as_failed() {
    let fixture = Fixture::new().await;
    let params = TriggerParams {
        correlation_id: Some("corr-1".to_string()),
        ..Default::default()
    };
    for _ in 0..100 {
        fixture
            .orchestrator
            .trigger_deployment(params.clone())
            .await
            .unwrap();
    }

    let result = fixture.orchestrator.trigger_deployment(params).await;
    assert!(matches!(result, Err(DeployError::Capacity { .. })));

    let history = fixture.orchestrator.history(1).await.unwrap();
    assert_eq!(history[0].state, DeploymentState::Failed);
    assert!(history[0].error.as_deref().unwrap().contains("queue is full"));
    assert_eq!(fixture.orchestrator.queue().len(), 100);
}

#[tokio::test]
async fn test_process_queue_is_not_reentrant() {
    let executor = Arc::new(MemoryExecutor::new());
    let slow = Arc::new(SlowExecutor {
        inner: executor.clone(),
        delay: Duration::from_millis(200),
    });
    let fixture = Arc::new(
        Fixture::with_executor(executor, slow, orchestrator_options(), true).await,
    );
    fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();

    let background = fixture.clone();
    let first = tokio::spawn(async move { background.orchestrator.process_queue().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(fixture.orchestrator.status().processing);
    assert!(fixture.orchestrator.current().is_some());
    assert_eq!(fixture.orchestrator.process_queue().await, 0);

    assert_eq!(first.await.unwrap(), 1);
    assert!(!fixture.orchestrator.status().processing);
    assert!(fixture.orchestrator.current().is_none());
}

#[tokio::test]
async fn test_shutdown_fails_in_flight_task() {
    let executor = Arc::new(MemoryExecutor::new());
    let slow = Arc::new(SlowExecutor {
        inner: executor.clone(),
        delay: Duration::from_millis(500),
    });
    let fixture = Arc::new(
        Fixture::with_executor(executor, slow, orchestrator_options(), true).await,
    );
    let id = fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
        let _ = shutdown_rx.await;
    });
    let worker_fixture = fixture.clone();
    let worker = tokio::spawn(async move {
        deployer::run(
            &deployer::Options {
                interval: Duration::from_millis(10),
            },
            &worker_fixture.orchestrator,
            tokio::time::sleep,
            shutdown,
        )
        .await;
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fixture.orchestrator.current().as_deref(), Some(id.as_str()));
    shutdown_tx.send(()).unwrap();
    worker.await.unwrap();

    let record = fixture.orchestrator.deployment(&id).await.unwrap().unwrap();
    assert_eq!(record.state, DeploymentState::Failed);
    assert_eq!(record.error.as_deref(), Some(deployer::SHUTDOWN_REASON));
    assert!(record.finished_at.is_some());
    assert!(!fixture.orchestrator.queue().is_processing(&id));
}

/// Delays every write so a task stays in flight
struct SlowExecutor {
    inner: Arc<MemoryExecutor>,
    delay: Duration,
}

#[async_trait]
impl CommandExecutor for SlowExecutor {
    async fn is_reachable(&self, program: &str) -> bool {
        self.inner.is_reachable(program).await
    }

    async fn execute(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError> {
        if invocation.operation == "write_file" {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.execute(invocation, timeout).await
    }
}

#[tokio::test]
async fn test_restore_backup_applies_catalogued_backup() {
    let fixture = Fixture::new().await;
    let manual = fixture
        .backups()
        .create_backup(BackupType::Manual, Some("known good"))
        .await
        .unwrap();
    let backup_id = manual.backup_id;

    fixture
        .orchestrator
        .trigger_deployment(TriggerParams::default())
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;
    assert_eq!(
        fixture.target_file("docker-compose.yml"),
        Some(compose_file("v2"))
    );

    let restore_id = fixture
        .orchestrator
        .restore_backup(&backup_id, "operator")
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;

    let record = fixture
        .orchestrator
        .deployment(&restore_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, DeploymentState::Completed);
    assert_eq!(
        fixture.target_file("docker-compose.yml"),
        Some(compose_file("v1"))
    );

    // restoring a catalogued backup snapshots the current tree first
    let pre_restore = fixture
        .backups()
        .list_backups(&BackupQuery {
            backup_type: Some(BackupType::PreRestore),
            ..Default::default()
        })
        .await;
    assert_eq!(pre_restore.total, 1);

    let result = fixture.orchestrator.restore_backup("manual-missing", "operator").await;
    assert!(matches!(result, Err(DeployError::NotFound(_))));
}
