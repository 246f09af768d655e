//! Shared fixtures

use std::path::Path;
use std::sync::Arc;

use confdeploy::backup::manager::{BackupManager, BackupOptions};
use confdeploy::backup::BackupService;
use confdeploy::command::coordinator::{CommandCoordinator, CoordinatorOptions};
use confdeploy::command::executor::CommandExecutor;
use confdeploy::command::memory::MemoryExecutor;
use confdeploy::deploy::orchestrator::{Orchestrator, OrchestratorOptions};
use confdeploy::deploy::queue::{DeploymentQueue, QueueOptions};
use confdeploy::deploy::store::LocalDeploymentStore;
use tempfile::TempDir;

pub const TARGET_ROOT: &str = "/srv/config";
pub const REPOSITORY: &str = "config-repo";

/// A compose file long and varied enough that its archive clears the
/// minimum backup size
pub fn compose_file(tag: &str) -> String {
    let mut content = String::from("version: \"3.8\"\nservices:\n");
    for (i, name) in ["api", "worker", "scheduler", "gateway", "cache", "metrics"]
        .iter()
        .enumerate()
    {
        content.push_str(&format!(
            "  {name}:\n    image: registry.local/{name}:{tag}\n    ports:\n      - \"{}:{}\"\n    environment:\n      - SERVICE_ID={}-{}\n",
            8000 + i * 7,
            9100 + i * 13,
            name,
            i * 31 + 17
        ));
    }
    content
}

/// Populate the remote target with the currently deployed configuration
pub fn seed_target(executor: &MemoryExecutor) {
    executor.put_remote_file(
        &format!("{}/docker-compose.yml", TARGET_ROOT),
        &compose_file("v1"),
    );
    executor.put_remote_file(
        &format!("{}/.env", TARGET_ROOT),
        "DATABASE_URL=postgres://db:5432/app\nLOG_LEVEL=info\nRELEASE=v1\n",
    );
    executor.put_remote_file(
        &format!("{}/nginx/nginx.conf", TARGET_ROOT),
        "worker_processes 2;\nevents { worker_connections 512; }\n",
    );
}

/// Populate the source repository with a newer configuration
pub fn seed_repository(executor: &MemoryExecutor) {
    executor.put_repository_file(REPOSITORY, "docker-compose.yml", &compose_file("v2"));
    executor.put_repository_file(
        REPOSITORY,
        ".env",
        "DATABASE_URL=postgres://db:5432/app\nLOG_LEVEL=debug\nRELEASE=v2\n",
    );
    executor.put_repository_file(
        REPOSITORY,
        "nginx/nginx.conf",
        "worker_processes 4;\nevents { worker_connections 1024; }\n",
    );
    executor.put_repository_file(REPOSITORY, "README.md", "not deployed\n");
}

pub fn backup_options(dir: &Path) -> BackupOptions {
    BackupOptions {
        root: dir.join("backups"),
        catalog_path: dir.join("backups").join("catalog.json"),
        target_root: TARGET_ROOT.to_string(),
        ..Default::default()
    }
}

pub fn orchestrator_options() -> OrchestratorOptions {
    OrchestratorOptions {
        source_repository: REPOSITORY.to_string(),
        target_root: TARGET_ROOT.to_string(),
        ..Default::default()
    }
}

/// A fully wired service over an in-memory remote
pub struct Fixture {
    pub dir: TempDir,
    pub executor: Arc<MemoryExecutor>,
    pub coordinator: Arc<CommandCoordinator>,
    pub backups: Option<Arc<BackupManager>>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::build(orchestrator_options(), true).await
    }

    pub async fn build(options: OrchestratorOptions, with_backups: bool) -> Self {
        let executor = Arc::new(MemoryExecutor::new());
        Self::with_executor(executor.clone(), executor, options, with_backups).await
    }

    /// Wire the service over `command_executor`, seeding `executor`
    pub async fn with_executor(
        executor: Arc<MemoryExecutor>,
        command_executor: Arc<dyn CommandExecutor>,
        options: OrchestratorOptions,
        with_backups: bool,
    ) -> Self {
        seed_target(&executor);
        seed_repository(&executor);

        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(CommandCoordinator::new(
            command_executor,
            CoordinatorOptions::default(),
        ));
        coordinator.initialize().await;

        let backups = if with_backups {
            Some(Arc::new(
                BackupManager::open(backup_options(dir.path()), coordinator.clone())
                    .await
                    .unwrap(),
            ))
        } else {
            None
        };

        let orchestrator = Arc::new(Orchestrator::new(
            options,
            DeploymentQueue::new(QueueOptions::default()),
            coordinator.clone(),
            backups.clone().map(|b| b as Arc<dyn BackupService>),
            Arc::new(LocalDeploymentStore::in_memory()),
        ));

        Self {
            dir,
            executor,
            coordinator,
            backups,
            orchestrator,
        }
    }

    pub fn target_file(&self, relative: &str) -> Option<String> {
        self.executor
            .remote_file(&format!("{}/{}", TARGET_ROOT, relative))
    }

    pub fn backups(&self) -> &BackupManager {
        self.backups.as_deref().unwrap()
    }
}
