//! Backup manager.
//!
//! Snapshots the remote target tree through the filesystem channel into
//! gzip tar archives, keeps the catalog in step with the archives on disk
//! and restores snapshots back onto the target.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backup::archive::{self, read_text};
use crate::backup::catalog::{BackupCatalog, BackupQuery, CatalogStats, QueryPage, RetentionPolicy};
use crate::backup::validator::{
    config_parse_error, BackupValidator, BatchOptions, BatchSummary, ValidateOptions,
    ValidationReport, ValidatorOptions,
};
use crate::backup::{BackupService, FailedFile, RestoreOptions, RestoreReport};
use crate::command::coordinator::CommandCoordinator;
use crate::command::operations::join_remote;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::backup::{BackupRecord, BackupType, RollbackLink, Verification};
use crate::utils::{format_size, generate_id, sha256_file, CHECKSUM_ALGORITHM};

/// Patterns skipped when snapshotting the target tree
pub fn default_exclude_patterns() -> Vec<String> {
    [
        ".git",
        "node_modules",
        "__pycache__",
        "*.pyc",
        "*.tmp",
        "*.swp",
        ".DS_Store",
        ".vscode",
        ".idea",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// Backup manager options
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Directory holding the archives
    pub root: PathBuf,

    pub catalog_path: PathBuf,

    /// Remote directory that is snapshotted and restored
    pub target_root: String,

    pub exclude_patterns: Vec<String>,
    pub retention: RetentionPolicy,
    pub validator: ValidatorOptions,

    /// Extract and inspect archives when validating
    pub deep_validation: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("backups"),
            catalog_path: PathBuf::from("backups/catalog.json"),
            target_root: "/srv/config".to_string(),
            exclude_patterns: default_exclude_patterns(),
            retention: RetentionPolicy::default(),
            validator: ValidatorOptions::default(),
            deep_validation: true,
        }
    }
}

/// Outcome of a retention sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub failed: Vec<FailedFile>,
    pub retained: usize,
}

/// Backup manager
pub struct BackupManager {
    options: BackupOptions,
    coordinator: Arc<CommandCoordinator>,
    catalog: Mutex<BackupCatalog>,
    validator: BackupValidator,
}

impl BackupManager {
    pub fn new(
        options: BackupOptions,
        coordinator: Arc<CommandCoordinator>,
        catalog: BackupCatalog,
    ) -> Self {
        let validator = BackupValidator::new(options.validator.clone());
        Self {
            options,
            coordinator,
            catalog: Mutex::new(catalog),
            validator,
        }
    }

    /// Create the private archive root and load the catalog
    pub async fn open(
        options: BackupOptions,
        coordinator: Arc<CommandCoordinator>,
    ) -> Result<Self, DeployError> {
        Dir::new(&options.root).create_private().await?;
        let catalog = BackupCatalog::load(&options.catalog_path, options.retention.clone()).await?;
        Ok(Self::new(options, coordinator, catalog))
    }

    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    pub fn validator(&self) -> &BackupValidator {
        &self.validator
    }

    /// Snapshot the target tree and catalogue it
    async fn snapshot(
        &self,
        backup_type: BackupType,
        deployment_id: Option<&str>,
        description: Option<&str>,
    ) -> Result<BackupRecord, DeployError> {
        let backup_id = generate_id(backup_type.as_str());
        let root = Dir::new(&self.options.root);
        root.create_private().await?;
        let archive_path = root.path().join(format!("{}.tar.gz", backup_id));

        info!("Creating {} backup {}", backup_type, backup_id);
        let result = self
            .write_snapshot(&backup_id, &archive_path, backup_type, deployment_id, description)
            .await;

        match result {
            Ok(record) => {
                info!(
                    "Backup {} created: {} files, {}",
                    record.backup_id,
                    record.file_count,
                    format_size(record.size)
                );
                Ok(record)
            }
            Err(e) => {
                error!("Backup {} failed: {}", backup_id, e);
                if let Err(cleanup) = File::new(&archive_path).delete().await {
                    warn!("Could not remove partial archive {}: {}", archive_path.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    async fn write_snapshot(
        &self,
        backup_id: &str,
        archive_path: &std::path::Path,
        backup_type: BackupType,
        deployment_id: Option<&str>,
        description: Option<&str>,
    ) -> Result<BackupRecord, DeployError> {
        let scratch = tempfile::tempdir()?;
        let pulled = self.pull_target(scratch.path()).await?;
        debug!("Pulled {} files from {}", pulled, self.options.target_root);

        let summary = archive::create_archive(scratch.path(), archive_path).await?;
        let checksum = sha256_file(archive_path).await?;

        let report = self
            .validator
            .validate(
                archive_path,
                &ValidateOptions {
                    expected_checksum: Some(checksum.clone()),
                    deep: self.options.deep_validation,
                },
            )
            .await;
        if !report.valid {
            return Err(DeployError::Integrity(format!(
                "backup {} failed validation: {}",
                backup_id,
                report.errors.join("; ")
            )));
        }
        for warning in &report.warnings {
            warn!("Backup {}: {}", backup_id, warning);
        }

        let now = Utc::now();
        let record = BackupRecord {
            backup_id: backup_id.to_string(),
            path: archive_path.to_path_buf(),
            backup_type,
            created_at: now,
            size: summary.size,
            file_count: summary.file_count,
            checksum: checksum.clone(),
            checksum_algorithm: CHECKSUM_ALGORITHM.to_string(),
            verification: Verification {
                verified: true,
                checksum: Some(checksum),
                last_check: Some(now),
            },
            deployment_id: deployment_id.map(str::to_string),
            rollback: None,
            description: description.map(str::to_string),
        };

        self.catalog.lock().await.add(record.clone()).await?;
        Ok(record)
    }

    /// Copy the remote target tree into `dest`, skipping excluded paths
    async fn pull_target(&self, dest: &Path) -> Result<usize, DeployError> {
        let target_root = &self.options.target_root;
        let entries = self.coordinator.list_directory(target_root, true).await?;

        let mut count = 0;
        for entry in entries.iter().filter(|e| e.is_file()) {
            if is_excluded(&entry.path, &self.options.exclude_patterns) {
                debug!("Excluding {} from backup", entry.path);
                continue;
            }
            let local = dest.join(confined(&entry.path)?);
            let content = self
                .coordinator
                .read_file(&join_remote(target_root, &entry.path))
                .await?;
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&local, content).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Delete target files the restored backup does not contain
    async fn remove_untracked(
        &self,
        files: &[String],
        report: &mut RestoreReport,
    ) -> Result<(), DeployError> {
        let target_root = &self.options.target_root;
        let kept: BTreeSet<&str> = files.iter().map(String::as_str).collect();
        let entries = self.coordinator.list_directory(target_root, true).await?;

        for entry in entries.iter().filter(|e| e.is_file()) {
            if kept.contains(entry.path.as_str())
                || is_excluded(&entry.path, &self.options.exclude_patterns)
            {
                continue;
            }
            if let Err(e) = confined(&entry.path) {
                report.warnings.push(e.to_string());
                continue;
            }
            let target = join_remote(target_root, &entry.path);
            match self.coordinator.delete_file(&target).await {
                Ok(()) => {
                    debug!("Removed {}, not present in backup {}", target, report.backup_id);
                    report.removed.push(target);
                }
                Err(e) => {
                    warn!("Could not remove {}: {}", target, e);
                    report.failed.push(FailedFile {
                        path: target,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn record(&self, backup_id: &str) -> Result<BackupRecord, DeployError> {
        self.catalog
            .lock()
            .await
            .get(backup_id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("backup {}", backup_id)))
    }

    /// Validate a catalogued backup and store the verification result
    pub async fn validate(&self, backup_id: &str) -> Result<ValidationReport, DeployError> {
        let record = self.record(backup_id).await?;
        let report = self
            .validator
            .validate(
                &record.path,
                &ValidateOptions {
                    expected_checksum: Some(record.checksum.clone()),
                    deep: self.options.deep_validation,
                },
            )
            .await;

        let verified = report.valid;
        let checksum = report.metadata.checksum.clone();
        self.catalog
            .lock()
            .await
            .update(backup_id, |r| {
                r.verification = Verification {
                    verified,
                    checksum,
                    last_check: Some(Utc::now()),
                };
            })
            .await?;
        Ok(report)
    }

    /// Validate every catalogued backup
    pub async fn validate_all(&self, options: &BatchOptions) -> BatchSummary {
        let paths: Vec<PathBuf> = self
            .catalog
            .lock()
            .await
            .records()
            .iter()
            .map(|r| r.path.clone())
            .collect();
        self.validator.batch_validate(&paths, options).await
    }

    /// Restore a backup onto the target tree
    pub async fn restore(
        &self,
        backup_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreReport, DeployError> {
        let validation = self.validate(backup_id).await?;
        if !validation.valid {
            return Err(DeployError::Integrity(format!(
                "restore {}: {}",
                backup_id,
                validation.errors.join("; ")
            )));
        }
        let record = self.record(backup_id).await?;

        let scratch = tempfile::tempdir()?;
        let files = archive::extract_archive(&record.path, scratch.path()).await?;

        if options.validate_config {
            let invalid: Vec<String> = files
                .iter()
                .filter_map(|f| config_parse_error(scratch.path(), f).map(|e| format!("{}: {}", f, e)))
                .collect();
            if !invalid.is_empty() {
                return Err(DeployError::ValidationError(format!(
                    "restore {}: invalid configuration: {}",
                    backup_id,
                    invalid.join("; ")
                )));
            }
        }

        let mut report = RestoreReport {
            backup_id: backup_id.to_string(),
            warnings: validation.warnings,
            ..Default::default()
        };

        if !options.skip_snapshot {
            let snapshot = self
                .snapshot(
                    BackupType::PreRestore,
                    None,
                    Some(&format!("before restoring {}", backup_id)),
                )
                .await?;
            report.pre_restore_backup_id = Some(snapshot.backup_id);
        }

        let target_root = &self.options.target_root;
        let parents: BTreeSet<&str> = files
            .iter()
            .filter_map(|f| f.rsplit_once('/').map(|(parent, _)| parent))
            .collect();
        for parent in parents {
            let dir = join_remote(target_root, parent);
            if let Err(e) = self.coordinator.create_directory(&dir).await {
                report.warnings.push(format!("create_directory {}: {}", dir, e));
            }
        }

        for file in &files {
            let target = join_remote(target_root, file);
            let result = match read_text(scratch.path(), file) {
                Ok(content) => self.coordinator.write_file(&target, &content).await,
                Err(e) => Err(DeployError::IoError(e)),
            };
            match result {
                Ok(()) => report.restored.push(target),
                Err(e) => {
                    warn!("Could not restore {}: {}", target, e);
                    report.failed.push(FailedFile {
                        path: target,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.failed.is_empty() {
            self.remove_untracked(&files, &mut report).await?;
        }

        report.success = report.failed.is_empty();
        info!(
            "Restored backup {}: {} files restored, {} removed, {} failed",
            backup_id,
            report.restored.len(),
            report.removed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Restore the exact pre-deployment backup of a deployment
    pub async fn rollback(&self, deployment_id: &str) -> Result<RestoreReport, DeployError> {
        let backup_id = self
            .catalog
            .lock()
            .await
            .find_pre_deployment(deployment_id)
            .map(|r| r.backup_id.clone())
            .ok_or_else(|| {
                DeployError::NotFound(format!(
                    "no pre-deployment backup for deployment {}",
                    deployment_id
                ))
            })?;

        info!("Rolling back deployment {} from backup {}", deployment_id, backup_id);
        let report = self
            .restore(
                &backup_id,
                RestoreOptions {
                    skip_snapshot: true,
                    validate_config: true,
                },
            )
            .await?;

        if report.success {
            let link = RollbackLink {
                rolled_back_at: Utc::now(),
                deployment_id: deployment_id.to_string(),
            };
            self.catalog
                .lock()
                .await
                .update(&backup_id, |r| r.rollback = Some(link))
                .await?;
        }
        Ok(report)
    }

    /// Delete backups past their type's retention
    pub async fn cleanup_expired_backups(&self) -> Result<CleanupReport, DeployError> {
        self.cleanup_expired_backups_at(Utc::now()).await
    }

    pub async fn cleanup_expired_backups_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<CleanupReport, DeployError> {
        let mut catalog = self.catalog.lock().await;
        let expired = catalog.expired_backups(now);
        let mut report = CleanupReport::default();

        for record in expired {
            if let Err(e) = File::new(&record.path).delete().await {
                warn!("Could not delete expired backup {}: {}", record.backup_id, e);
                report.failed.push(FailedFile {
                    path: record.path.display().to_string(),
                    error: e.to_string(),
                });
                continue;
            }
            catalog.remove(&record.backup_id).await?;
            debug!("Deleted expired {} backup {}", record.backup_type, record.backup_id);
            report.deleted.push(record.backup_id);
        }

        report.retained = catalog.records().len();
        info!(
            "Retention sweep deleted {} backups, {} failed, {} retained",
            report.deleted.len(),
            report.failed.len(),
            report.retained
        );
        Ok(report)
    }

    /// Delete one backup. Without `force`, exempt types and backups still
    /// inside their retention window are refused.
    pub async fn delete_backup(&self, backup_id: &str, force: bool) -> Result<BackupRecord, DeployError> {
        let mut catalog = self.catalog.lock().await;
        let record = catalog
            .get(backup_id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("backup {}", backup_id)))?;

        if !force {
            match catalog.retention_days(record.backup_type) {
                None => {
                    return Err(DeployError::Permission(format!(
                        "backup {} is {} and requires force to delete",
                        backup_id, record.backup_type
                    )))
                }
                Some(days) if record.created_at >= Utc::now() - Duration::days(days) => {
                    return Err(DeployError::Permission(format!(
                        "backup {} is within its {}-day retention, use force to delete",
                        backup_id, days
                    )))
                }
                Some(_) => {}
            }
        }

        File::new(&record.path).delete().await?;
        catalog.remove(backup_id).await?;
        info!("Deleted backup {}", backup_id);
        Ok(record)
    }

    pub async fn list_backups(&self, query: &BackupQuery) -> QueryPage {
        self.catalog.lock().await.query(query)
    }

    pub async fn get_backup(&self, backup_id: &str) -> Option<BackupRecord> {
        self.catalog.lock().await.get(backup_id).cloned()
    }

    pub async fn stats(&self) -> CatalogStats {
        self.catalog.lock().await.stats().clone()
    }
}

#[async_trait]
impl BackupService for BackupManager {
    async fn create_pre_deployment_backup(
        &self,
        deployment_id: &str,
    ) -> Result<BackupRecord, DeployError> {
        self.snapshot(
            BackupType::PreDeployment,
            Some(deployment_id),
            Some(&format!("before deployment {}", deployment_id)),
        )
        .await
    }

    async fn create_backup(
        &self,
        backup_type: BackupType,
        description: Option<&str>,
    ) -> Result<BackupRecord, DeployError> {
        self.snapshot(backup_type, None, description).await
    }

    async fn find_pre_deployment_backup(
        &self,
        deployment_id: &str,
    ) -> Result<Option<BackupRecord>, DeployError> {
        Ok(self
            .catalog
            .lock()
            .await
            .find_pre_deployment(deployment_id)
            .cloned())
    }

    async fn validate_backup(&self, backup_id: &str) -> Result<ValidationReport, DeployError> {
        self.validate(backup_id).await
    }

    async fn restore_from_backup(
        &self,
        backup_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreReport, DeployError> {
        self.restore(backup_id, options).await
    }

    async fn rollback_deployment(&self, deployment_id: &str) -> Result<RestoreReport, DeployError> {
        self.rollback(deployment_id).await
    }
}

/// A listing entry as a path that stays below the directory it was listed from
fn confined(relative: &str) -> Result<&Path, DeployError> {
    let path = Path::new(relative);
    let normal = path.components().all(|c| matches!(c, Component::Normal(_)));
    if relative.is_empty() || !normal {
        return Err(DeployError::ValidationError(format!(
            "listing entry '{}' is not a relative path below the target root",
            relative
        )));
    }
    Ok(path)
}

/// Whether a relative path matches an exclude pattern.
///
/// `*suffix` matches file name suffixes, anything else matches a whole path
/// component.
pub fn is_excluded(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_prefix('*') {
        Some(suffix) => path.ends_with(suffix),
        None => path.split('/').any(|component| component == pattern),
    })
}
