//! Backup creation, validation, cataloguing and restore

pub mod archive;
pub mod catalog;
pub mod manager;
pub mod validator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backup::validator::ValidationReport;
use crate::errors::DeployError;
use crate::models::backup::{BackupRecord, BackupType};

/// Options for `restore_from_backup`
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Do not take a pre-restore snapshot of the current target
    pub skip_snapshot: bool,

    /// Parse extracted JSON and YAML files before writing them
    pub validate_config: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            skip_snapshot: false,
            validate_config: true,
        }
    }
}

/// A file that could not be restored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: String,
    pub error: String,
}

/// Outcome of a restore
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub restored: Vec<String>,

    /// Target files absent from the backup, deleted so the tree matches it
    pub removed: Vec<String>,

    pub failed: Vec<FailedFile>,
    pub warnings: Vec<String>,
    pub pre_restore_backup_id: Option<String>,
    pub success: bool,
}

/// Backup operations used by the coordinator workflows and the orchestrator
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Snapshot the target tree before `deployment_id` writes to it
    async fn create_pre_deployment_backup(
        &self,
        deployment_id: &str,
    ) -> Result<BackupRecord, DeployError>;

    /// Snapshot the target tree outside of a deployment
    async fn create_backup(
        &self,
        backup_type: BackupType,
        description: Option<&str>,
    ) -> Result<BackupRecord, DeployError>;

    /// Exact pre-deployment backup for a deployment, if one exists
    async fn find_pre_deployment_backup(
        &self,
        deployment_id: &str,
    ) -> Result<Option<BackupRecord>, DeployError>;

    /// Re-validate a catalogued backup
    async fn validate_backup(&self, backup_id: &str) -> Result<ValidationReport, DeployError>;

    async fn restore_from_backup(
        &self,
        backup_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreReport, DeployError>;

    /// Restore a deployment's pre-deployment backup and record the rollback
    async fn rollback_deployment(&self, deployment_id: &str) -> Result<RestoreReport, DeployError>;
}
