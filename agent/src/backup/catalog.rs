//! Persisted backup metadata catalog.
//!
//! One JSON document holds every [`BackupRecord`], aggregate stats and the
//! retention policy. A document that fails to parse is moved aside under a
//! timestamped name and a fresh catalog takes its place. Before each write
//! the previous document is copied into `snapshots/`, keeping the newest
//! [`MAX_SNAPSHOTS`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::backup::{BackupRecord, BackupType};

pub const CATALOG_VERSION: u32 = 1;
pub const MAX_SNAPSHOTS: usize = 5;

/// Retention in days per backup type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub default_days: i64,
    pub overrides: BTreeMap<BackupType, i64>,
    /// Types never deleted by a retention sweep
    pub exempt: Vec<BackupType>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        let mut overrides = BTreeMap::new();
        overrides.insert(BackupType::Scheduled, 7);
        overrides.insert(BackupType::Emergency, 90);
        Self {
            default_days: 30,
            overrides,
            exempt: vec![BackupType::Manual],
        }
    }
}

impl RetentionPolicy {
    /// Retention for a type, `None` when exempt
    pub fn retention_days(&self, backup_type: BackupType) -> Option<i64> {
        if self.exempt.contains(&backup_type) {
            return None;
        }
        Some(
            self.overrides
                .get(&backup_type)
                .copied()
                .unwrap_or(self.default_days),
        )
    }
}

/// Aggregate stats, recomputed on every mutation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub count: usize,
    pub total_size: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub by_type: BTreeMap<BackupType, usize>,
}

impl CatalogStats {
    fn compute(backups: &[BackupRecord]) -> Self {
        let mut by_type = BTreeMap::new();
        for record in backups {
            *by_type.entry(record.backup_type).or_insert(0) += 1;
        }
        Self {
            count: backups.len(),
            total_size: backups.iter().map(|b| b.size).sum(),
            oldest: backups.iter().map(|b| b.created_at).min(),
            newest: backups.iter().map(|b| b.created_at).max(),
            by_type,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    backups: Vec<BackupRecord>,
    stats: CatalogStats,
    retention: RetentionPolicy,
}

impl CatalogDocument {
    fn new(retention: RetentionPolicy) -> Self {
        Self {
            version: CATALOG_VERSION,
            updated_at: Utc::now(),
            backups: Vec::new(),
            stats: CatalogStats::default(),
            retention,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
    LargestFirst,
}

/// Catalog query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupQuery {
    pub backup_type: Option<BackupType>,
    pub deployment_id: Option<String>,
    pub verified: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub sort: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl BackupQuery {
    fn matches(&self, record: &BackupRecord) -> bool {
        self.backup_type.is_none_or(|t| t == record.backup_type)
            && self
                .deployment_id
                .as_ref()
                .is_none_or(|id| record.deployment_id.as_ref() == Some(id))
            && self
                .verified
                .is_none_or(|v| v == record.verification.verified)
            && self.since.is_none_or(|since| record.created_at >= since)
            && self.until.is_none_or(|until| record.created_at <= until)
    }
}

/// One page of query results
#[derive(Debug, Clone, Serialize)]
pub struct QueryPage {
    /// Matches before pagination
    pub total: usize,
    pub backups: Vec<BackupRecord>,
}

/// Backup metadata catalog
#[derive(Debug)]
pub struct BackupCatalog {
    file: File,
    snapshots: Dir,
    document: CatalogDocument,
}

impl BackupCatalog {
    /// Load the catalog at `path`, starting fresh when it is missing or corrupt.
    ///
    /// `retention` replaces whatever policy the stored document carries.
    pub async fn load(path: &Path, retention: RetentionPolicy) -> Result<Self, DeployError> {
        let file = File::new(path);
        let snapshots = Dir::new(
            path.parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("snapshots"),
        );

        let document = if file.exists().await {
            match file.read_json::<CatalogDocument>().await {
                Ok(mut document) => {
                    document.retention = retention;
                    debug!(
                        "Loaded catalog {} with {} backups",
                        path.display(),
                        document.backups.len()
                    );
                    document
                }
                Err(e) => {
                    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.6fZ"));
                    let aside = file.rename_aside(&suffix).await?;
                    warn!(
                        "Catalog {} is corrupt ({}), preserved as {} and reinitialized",
                        path.display(),
                        e,
                        aside.path().display()
                    );
                    CatalogDocument::new(retention)
                }
            }
        } else {
            info!("Initializing catalog at {}", path.display());
            CatalogDocument::new(retention)
        };

        Ok(Self {
            file,
            snapshots,
            document,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn snapshot_dir(&self) -> &Path {
        self.snapshots.path()
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.document.backups
    }

    pub fn get(&self, backup_id: &str) -> Option<&BackupRecord> {
        self.document
            .backups
            .iter()
            .find(|b| b.backup_id == backup_id)
    }

    /// Newest pre-deployment backup linked to `deployment_id`
    pub fn find_pre_deployment(&self, deployment_id: &str) -> Option<&BackupRecord> {
        self.document
            .backups
            .iter()
            .filter(|b| {
                b.backup_type == BackupType::PreDeployment
                    && b.deployment_id.as_deref() == Some(deployment_id)
            })
            .max_by_key(|b| b.created_at)
    }

    pub fn stats(&self) -> &CatalogStats {
        &self.document.stats
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.document.retention
    }

    pub fn retention_days(&self, backup_type: BackupType) -> Option<i64> {
        self.document.retention.retention_days(backup_type)
    }

    /// Backups older than their type's retention at `now`. Exempt types never expire.
    pub fn expired_backups(&self, now: DateTime<Utc>) -> Vec<BackupRecord> {
        self.document
            .backups
            .iter()
            .filter(|b| {
                self.retention_days(b.backup_type)
                    .is_some_and(|days| b.created_at < now - Duration::days(days))
            })
            .cloned()
            .collect()
    }

    pub fn query(&self, query: &BackupQuery) -> QueryPage {
        let mut matches: Vec<&BackupRecord> = self
            .document
            .backups
            .iter()
            .filter(|b| query.matches(b))
            .collect();

        match query.sort {
            SortOrder::NewestFirst => matches.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            SortOrder::OldestFirst => matches.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            SortOrder::LargestFirst => matches.sort_by(|a, b| b.size.cmp(&a.size)),
        }

        let total = matches.len();
        let backups = matches
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        QueryPage { total, backups }
    }

    pub async fn add(&mut self, record: BackupRecord) -> Result<(), DeployError> {
        if self.get(&record.backup_id).is_some() {
            return Err(DeployError::ValidationError(format!(
                "backup {} is already catalogued",
                record.backup_id
            )));
        }
        self.document.backups.push(record);
        self.persist().await
    }

    /// Modify one record in place and persist
    pub async fn update<F>(&mut self, backup_id: &str, f: F) -> Result<BackupRecord, DeployError>
    where
        F: FnOnce(&mut BackupRecord),
    {
        let record = self
            .document
            .backups
            .iter_mut()
            .find(|b| b.backup_id == backup_id)
            .ok_or_else(|| DeployError::NotFound(format!("backup {}", backup_id)))?;
        f(record);
        let updated = record.clone();
        self.persist().await?;
        Ok(updated)
    }

    pub async fn remove(&mut self, backup_id: &str) -> Result<Option<BackupRecord>, DeployError> {
        let Some(index) = self
            .document
            .backups
            .iter()
            .position(|b| b.backup_id == backup_id)
        else {
            return Ok(None);
        };
        let removed = self.document.backups.remove(index);
        self.persist().await?;
        Ok(Some(removed))
    }

    /// Recompute stats, snapshot the previous document and write atomically
    async fn persist(&mut self) -> Result<(), DeployError> {
        self.document.stats = CatalogStats::compute(&self.document.backups);
        self.document.updated_at = Utc::now();

        if self.file.exists().await {
            self.snapshots.create_private().await?;
            let name = format!("catalog-{}.json", Utc::now().format("%Y%m%dT%H%M%S%.6fZ"));
            self.file.copy_to(self.snapshots.path().join(name)).await?;
            self.prune_snapshots().await?;
        }

        self.file.write_json(&self.document).await
    }

    async fn prune_snapshots(&self) -> Result<(), DeployError> {
        let snapshots = self.snapshots.list_files().await?;
        let excess = snapshots.len().saturating_sub(MAX_SNAPSHOTS);
        // names sort chronologically
        for path in snapshots.into_iter().take(excess) {
            File::new(path).delete().await?;
        }
        Ok(())
    }
}
