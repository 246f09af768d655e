//! Deployment record persistence

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::models::deployment::{DeploymentLog, DeploymentRecord, DeploymentUpdate};

/// Persistence layer for deployment records and their logs
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn create_deployment(&self, record: DeploymentRecord) -> Result<(), DeployError>;

    async fn update_deployment(
        &self,
        id: &str,
        update: DeploymentUpdate,
    ) -> Result<DeploymentRecord, DeployError>;

    async fn get_deployment(&self, id: &str) -> Result<Option<DeploymentRecord>, DeployError>;

    /// Most recent records first
    async fn get_deployment_history(&self, limit: usize) -> Result<Vec<DeploymentRecord>, DeployError>;

    async fn add_deployment_log(&self, id: &str, log: DeploymentLog) -> Result<(), DeployError>;
}

/// In-memory store, optionally mirrored to a JSON file
#[derive(Debug, Default)]
pub struct LocalDeploymentStore {
    records: Mutex<Vec<DeploymentRecord>>,
    file: Option<File>,
}

impl LocalDeploymentStore {
    /// Store that lives only in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store mirrored to `path`, loading existing records
    pub async fn open(path: &Path) -> Result<Self, DeployError> {
        let file = File::new(path);
        let records = if file.exists().await {
            match file.read_json::<Vec<DeploymentRecord>>().await {
                Ok(records) => records,
                Err(e) => {
                    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S"));
                    let aside = file.rename_aside(&suffix).await?;
                    warn!(
                        "Deployment records {} unreadable ({}), moved to {}",
                        path.display(),
                        e,
                        aside.path().display()
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        debug!("Loaded {} deployment records from {}", records.len(), path.display());

        Ok(Self {
            records: Mutex::new(records),
            file: Some(file),
        })
    }

    async fn persist(&self, records: &[DeploymentRecord]) -> Result<(), DeployError> {
        match &self.file {
            Some(file) => file.write_json(&records).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DeploymentStore for LocalDeploymentStore {
    async fn create_deployment(&self, record: DeploymentRecord) -> Result<(), DeployError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(DeployError::DuplicateTask(record.id));
        }
        records.push(record);
        self.persist(&records).await
    }

    async fn update_deployment(
        &self,
        id: &str,
        update: DeploymentUpdate,
    ) -> Result<DeploymentRecord, DeployError> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DeployError::NotFound(format!("deployment {}", id)))?;
        update.apply(record);
        let updated = record.clone();
        self.persist(&records).await?;
        Ok(updated)
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<DeploymentRecord>, DeployError> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn get_deployment_history(&self, limit: usize) -> Result<Vec<DeploymentRecord>, DeployError> {
        let records = self.records.lock().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    async fn add_deployment_log(&self, id: &str, log: DeploymentLog) -> Result<(), DeployError> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DeployError::NotFound(format!("deployment {}", id)))?;
        record.logs.push(log);
        self.persist(&records).await
    }
}
