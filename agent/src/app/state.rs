//! Application state management

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::backup::manager::BackupManager;
use crate::backup::BackupService;
use crate::command::coordinator::CommandCoordinator;
use crate::command::executor::CommandExecutor;
use crate::deploy::orchestrator::Orchestrator;
use crate::deploy::queue::DeploymentQueue;
use crate::deploy::store::{DeploymentStore, LocalDeploymentStore};
use crate::errors::DeployError;

/// Main application state
pub struct AppState {
    pub coordinator: Arc<CommandCoordinator>,

    /// `None` when backups are disabled
    pub backups: Option<Arc<BackupManager>>,

    pub orchestrator: Arc<Orchestrator>,

    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire the coordinator, backup manager, store and orchestrator together
    pub async fn init(
        options: &AppOptions,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self, DeployError> {
        info!("Initializing application state...");

        let coordinator = Arc::new(CommandCoordinator::new(
            executor,
            options.coordinator.clone(),
        ));
        coordinator.initialize().await;

        let backups = match &options.backup {
            Some(backup_options) => Some(Arc::new(
                BackupManager::open(backup_options.clone(), coordinator.clone()).await?,
            )),
            None => {
                warn!("Backups are disabled");
                None
            }
        };

        let store: Arc<dyn DeploymentStore> =
            Arc::new(LocalDeploymentStore::open(&options.store_path).await?);

        let orchestrator = Arc::new(Orchestrator::new(
            options.orchestrator.clone(),
            DeploymentQueue::new(options.queue.clone()),
            coordinator.clone(),
            backups
                .clone()
                .map(|b| b as Arc<dyn BackupService>),
            store,
        ));

        Ok(Self {
            coordinator,
            backups,
            orchestrator,
            started_at: Utc::now(),
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), DeployError> {
        info!("Shutting down application state...");
        let pending = self.orchestrator.queue().len();
        if pending > 0 {
            warn!("{} queued tasks were not executed", pending);
        }
        self.coordinator.shutdown();
        Ok(())
    }
}
