//! Server state

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::app::state::AppState;
use crate::backup::manager::BackupManager;
use crate::command::coordinator::CommandCoordinator;
use crate::deploy::orchestrator::Orchestrator;

/// Server state shared across handlers
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
    pub coordinator: Arc<CommandCoordinator>,
    pub backups: Option<Arc<BackupManager>>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        coordinator: Arc<CommandCoordinator>,
        backups: Option<Arc<BackupManager>>,
    ) -> Self {
        Self {
            orchestrator,
            coordinator,
            backups,
            started_at: Utc::now(),
        }
    }
}

impl From<&AppState> for ServerState {
    fn from(app_state: &AppState) -> Self {
        Self {
            orchestrator: app_state.orchestrator.clone(),
            coordinator: app_state.coordinator.clone(),
            backups: app_state.backups.clone(),
            started_at: app_state.started_at,
        }
    }
}
