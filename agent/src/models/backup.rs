//! Backup models

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a backup was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupType {
    PreDeployment,
    Scheduled,
    Manual,
    PreRestore,
    Emergency,
}

impl BackupType {
    pub const ALL: [BackupType; 5] = [
        BackupType::PreDeployment,
        BackupType::Scheduled,
        BackupType::Manual,
        BackupType::PreRestore,
        BackupType::Emergency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::PreDeployment => "pre-deployment",
            BackupType::Scheduled => "scheduled",
            BackupType::Manual => "manual",
            BackupType::PreRestore => "pre-restore",
            BackupType::Emergency => "emergency",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackupType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid backup type: {}", s))
    }
}

/// Result of the most recent integrity check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Verification {
    pub verified: bool,
    pub checksum: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
}

/// Set on a backup once it has been used to roll a deployment back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackLink {
    pub rolled_back_at: DateTime<Utc>,
    pub deployment_id: String,
}

/// A backup artifact known to the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub path: PathBuf,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub file_count: usize,
    pub checksum: String,
    pub checksum_algorithm: String,
    #[serde(default)]
    pub verification: Verification,

    /// Deployment the backup was taken for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
