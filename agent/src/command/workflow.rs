//! Multi-step deployment and rollback workflows over the command channels.
//!
//! Both workflows stop at the first fatal step and return an
//! [`OperationsReport`] listing every operation attempted, so callers can
//! see exactly which files were written before a failure.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backup::{BackupService, RestoreOptions, RestoreReport};
use crate::command::coordinator::CommandCoordinator;
use crate::command::operations::join_remote;
use crate::errors::DeployError;

/// Inputs of `deployment_operations`
#[derive(Debug, Clone)]
pub struct DeploymentParams {
    pub deployment_id: String,
    pub repository: String,
    pub branch: String,

    /// Directory inside the repository holding the configuration
    pub source_root: String,

    /// Remote directory the configuration is written to
    pub target_root: String,

    /// Top-level source directories to descend into, empty for all
    pub allowed_dirs: Vec<String>,

    /// File name suffixes to deploy, empty for all
    pub extensions: Vec<String>,

    pub require_backup: bool,
}

/// What a rollback restores from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum BackupRef {
    /// The pre-deployment backup of a deployment
    Deployment(String),

    /// A catalogued backup
    Backup(String),

    /// A plain directory on the remote, restored by the legacy copy
    Directory(String),
}

/// Options of `rollback_operations`
#[derive(Debug, Clone)]
pub struct RollbackOptions {
    pub target_root: String,

    /// Take a pre-restore snapshot before restoring
    pub snapshot_current: bool,

    /// Remote directory holding plain backup copies, used when no backup
    /// service is available
    pub legacy_root: Option<String>,
}

/// One attempted operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub operation: String,
    pub target: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failure stopped the workflow
    #[serde(default)]
    pub fatal: bool,
}

/// Structured result of a workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationsReport {
    pub success: bool,
    pub operations: Vec<OperationOutcome>,
    pub backup_id: Option<String>,
    pub files_written: Vec<String>,
    pub error: Option<String>,

    /// Failure was transient and nothing was written yet
    #[serde(default)]
    pub retryable: bool,

    /// Rollback went through the legacy directory copy
    #[serde(default)]
    pub legacy: bool,
}

impl OperationsReport {
    fn succeeded(&mut self, operation: &str, target: &str) {
        self.operations.push(OperationOutcome {
            operation: operation.to_string(),
            target: target.to_string(),
            success: true,
            error: None,
            fatal: false,
        });
    }

    fn failed(&mut self, operation: &str, target: &str, error: &str) {
        self.operations.push(OperationOutcome {
            operation: operation.to_string(),
            target: target.to_string(),
            success: false,
            error: Some(error.to_string()),
            fatal: false,
        });
    }

    fn abort(mut self, operation: &str, target: &str, err: DeployError) -> Self {
        let message = format!("{} {}: {}", operation, target, err);
        warn!("Workflow aborted: {}", message);
        self.operations.push(OperationOutcome {
            operation: operation.to_string(),
            target: target.to_string(),
            success: false,
            error: Some(err.to_string()),
            fatal: true,
        });
        self.retryable = err.is_transient() && self.files_written.is_empty();
        self.success = false;
        self.error = Some(message);
        self
    }

    fn finish(mut self) -> Self {
        self.success = true;
        self
    }

    /// Outcomes of one operation name
    pub fn outcomes(&self, operation: &str) -> Vec<&OperationOutcome> {
        self.operations
            .iter()
            .filter(|o| o.operation == operation)
            .collect()
    }

    /// The fatal outcome, if the workflow aborted
    pub fn fatal(&self) -> Option<&OperationOutcome> {
        self.operations.iter().find(|o| o.fatal)
    }
}

macro_rules! step {
    ($report:ident, $op:expr, $target:expr, $call:expr) => {
        match $call {
            Ok(value) => {
                $report.succeeded($op, $target);
                value
            }
            Err(e) => return $report.abort($op, $target, e),
        }
    };
}

impl CommandCoordinator {
    /// Back up the target, then copy the source configuration onto it
    pub async fn deployment_operations(
        &self,
        params: &DeploymentParams,
        backups: Option<&dyn BackupService>,
    ) -> OperationsReport {
        let mut report = OperationsReport::default();
        let target_root = params.target_root.as_str();

        info!(
            "Deploying {}@{} to {} ({})",
            params.repository, params.branch, target_root, params.deployment_id
        );

        let backup = match backups {
            Some(service) => service.create_pre_deployment_backup(&params.deployment_id).await,
            None => Err(DeployError::ConfigError(
                "no backup service configured".to_string(),
            )),
        };
        match backup {
            Ok(record) => {
                report.succeeded("create_backup", &record.backup_id);
                report.backup_id = Some(record.backup_id);
            }
            Err(e) if params.require_backup => {
                return report.abort("create_backup", target_root, e);
            }
            Err(e) => {
                warn!("Pre-deployment backup failed, continuing without it: {}", e);
                report.failed("create_backup", target_root, &e.to_string());
            }
        }

        let existing = step!(
            report,
            "list_directory",
            target_root,
            self.list_directory(target_root, true).await
        );
        debug!("Target {} holds {} entries", target_root, existing.len());

        let sources = match self.collect_source_files(params, &mut report).await {
            Ok(sources) => sources,
            Err((dir, e)) => return report.abort("list_repository_directory", &dir, e),
        };
        if sources.is_empty() {
            warn!("No configuration files found in {}", params.repository);
        }

        let parents: BTreeSet<&str> = sources
            .iter()
            .filter_map(|(_, relative)| relative.rsplit_once('/').map(|(parent, _)| parent))
            .collect();
        for parent in parents {
            let dir = join_remote(target_root, parent);
            step!(report, "create_directory", &dir, self.create_directory(&dir).await);
        }

        for (source, relative) in &sources {
            let content = step!(
                report,
                "get_file_contents",
                source,
                self.get_file_contents(&params.repository, source, Some(&params.branch))
                    .await
            );
            let target = join_remote(target_root, relative);
            step!(report, "write_file", &target, self.write_file(&target, &content).await);
            report.files_written.push(target);
        }

        info!(
            "Deployment {} wrote {} files",
            params.deployment_id,
            report.files_written.len()
        );
        report.finish()
    }

    /// Walk the source tree, returning (repository path, path relative to the source root)
    async fn collect_source_files(
        &self,
        params: &DeploymentParams,
        report: &mut OperationsReport,
    ) -> Result<Vec<(String, String)>, (String, DeployError)> {
        let root = params.source_root.trim_matches('/').to_string();
        let mut pending = vec![(root.clone(), String::new())];
        let mut files = Vec::new();

        while let Some((dir, relative_dir)) = pending.pop() {
            let listing = if dir.is_empty() { "." } else { dir.as_str() };
            let entries = self
                .list_repository_directory(&params.repository, listing, Some(&params.branch))
                .await
                .map_err(|e| (listing.to_string(), e))?;
            report.succeeded("list_repository_directory", listing);

            for entry in entries {
                let path = join_remote(&dir, &entry.path);
                let relative = join_remote(&relative_dir, &entry.path);
                if entry.is_file() {
                    if matches_extension(&entry.path, &params.extensions) {
                        files.push((path, relative));
                    }
                } else if !relative_dir.is_empty()
                    || params.allowed_dirs.is_empty()
                    || params.allowed_dirs.iter().any(|d| d == &entry.path)
                {
                    pending.push((path, relative));
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Restore the target from a backup.
    ///
    /// Catalogued backups go through the backup service: validate,
    /// optionally snapshot, restore, then health-check the target. Plain
    /// directories, or any reference when no service is available, use the
    /// legacy remote copy.
    pub async fn rollback_operations(
        &self,
        backup_ref: &BackupRef,
        options: &RollbackOptions,
        backups: Option<&dyn BackupService>,
    ) -> OperationsReport {
        match (backups, backup_ref) {
            (_, BackupRef::Directory(dir)) => self.legacy_rollback(dir, options).await,
            (Some(service), _) => self.restore_rollback(service, backup_ref, options).await,
            (None, BackupRef::Backup(id)) if options.legacy_root.is_some() => {
                let root = options.legacy_root.as_deref().unwrap_or_default();
                self.legacy_rollback(&join_remote(root, id), options).await
            }
            (None, other) => OperationsReport::default().abort(
                "resolve_backup",
                &format!("{:?}", other),
                DeployError::NotFound("no backup service or legacy backup root configured".to_string()),
            ),
        }
    }

    async fn restore_rollback(
        &self,
        service: &dyn BackupService,
        backup_ref: &BackupRef,
        options: &RollbackOptions,
    ) -> OperationsReport {
        let mut report = OperationsReport::default();

        let backup_id = match backup_ref {
            BackupRef::Deployment(deployment_id) => {
                let found = step!(
                    report,
                    "resolve_backup",
                    deployment_id,
                    service.find_pre_deployment_backup(deployment_id).await
                );
                match found {
                    Some(record) => record.backup_id,
                    None => {
                        return report.abort(
                            "resolve_backup",
                            deployment_id,
                            DeployError::NotFound(format!(
                                "no pre-deployment backup for deployment {}",
                                deployment_id
                            )),
                        )
                    }
                }
            }
            BackupRef::Backup(id) | BackupRef::Directory(id) => id.clone(),
        };
        report.backup_id = Some(backup_id.clone());

        let validation = step!(
            report,
            "validate_backup",
            &backup_id,
            service.validate_backup(&backup_id).await
        );
        if !validation.valid {
            return report.abort(
                "validate_backup",
                &backup_id,
                DeployError::Integrity(format!(
                    "backup {} failed validation: {}",
                    backup_id,
                    validation.errors.join("; ")
                )),
            );
        }

        if options.snapshot_current {
            let snapshot = step!(
                report,
                "create_backup",
                &options.target_root,
                service
                    .create_backup(
                        crate::models::backup::BackupType::PreRestore,
                        Some(&format!("before rollback to {}", backup_id)),
                    )
                    .await
            );
            debug!("Pre-restore snapshot {}", snapshot.backup_id);
        }

        let restored: RestoreReport = match backup_ref {
            BackupRef::Deployment(deployment_id) => step!(
                report,
                "restore_backup",
                &backup_id,
                service.rollback_deployment(deployment_id).await
            ),
            _ => step!(
                report,
                "restore_backup",
                &backup_id,
                service
                    .restore_from_backup(
                        &backup_id,
                        RestoreOptions {
                            skip_snapshot: true,
                            validate_config: true,
                        },
                    )
                    .await
            ),
        };

        for path in &restored.restored {
            report.succeeded("write_file", path);
            report.files_written.push(path.clone());
        }
        for path in &restored.removed {
            report.succeeded("delete_file", path);
        }
        for failed in &restored.failed {
            report.failed("write_file", &failed.path, &failed.error);
        }
        if !restored.failed.is_empty() {
            let err = DeployError::Internal(format!(
                "{} of {} files failed to restore",
                restored.failed.len(),
                restored.failed.len() + restored.restored.len()
            ));
            return report.abort("restore_backup", &backup_id, err);
        }

        match self.list_directory(&options.target_root, false).await {
            Ok(_) => report.succeeded("health_check", &options.target_root),
            Err(e) => {
                warn!("Post-restore health check failed: {}", e);
                report.failed("health_check", &options.target_root, &e.to_string());
            }
        }

        info!(
            "Restored {} files from backup {}",
            report.files_written.len(),
            backup_id
        );
        report.finish()
    }

    /// Legacy fallback: copy every file of a remote backup directory onto the target
    async fn legacy_rollback(&self, dir: &str, options: &RollbackOptions) -> OperationsReport {
        let mut report = OperationsReport {
            legacy: true,
            ..Default::default()
        };
        warn!("Rolling back from plain directory {} (legacy copy)", dir);

        let entries = step!(report, "list_directory", dir, self.list_directory(dir, true).await);
        for entry in entries.iter().filter(|e| e.is_file()) {
            let source = join_remote(dir, &entry.path);
            let content = step!(report, "read_file", &source, self.read_file(&source).await);
            let target = join_remote(&options.target_root, &entry.path);
            step!(report, "write_file", &target, self.write_file(&target, &content).await);
            report.files_written.push(target);
        }

        report.finish()
    }
}

fn matches_extension(name: &str, extensions: &[String]) -> bool {
    extensions.is_empty() || extensions.iter().any(|ext| name.ends_with(ext.as_str()))
}
