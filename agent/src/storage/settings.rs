//! Settings file management

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backup::catalog::RetentionPolicy;
use crate::backup::validator::ValidationProfile;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::models::deployment::Priority;

/// Service settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,

    /// Local control server
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    /// External command programs
    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    #[serde(default)]
    pub backup: BackupSettings,

    #[serde(default)]
    pub deployment: DeploymentSettings,

    /// Background workers
    #[serde(default)]
    pub workers: WorkerSettings,
}

impl Settings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, DeployError> {
        let file = File::new(path);
        if !file.exists().await {
            info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        file.read_json().await
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub json: bool,

    /// Also write daily rolling files into the layout's logs directory
    #[serde(default)]
    pub file: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8686
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_size: usize,
    pub processing_timeout_secs: u64,
    pub default_priority: Priority,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: 100,
            processing_timeout_secs: 300,
            default_priority: Priority::Normal,
        }
    }
}

/// How to invoke one external program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    30
}

impl ConnectionSettings {
    fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub filesystem: ConnectionSettings,
    pub repository: ConnectionSettings,
    pub probe_args: Vec<String>,
    pub health_check_interval_secs: u64,
    pub max_retries: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            filesystem: ConnectionSettings::new("network-fs"),
            repository: ConnectionSettings::new("repository"),
            probe_args: vec!["ping".to_string()],
            health_check_interval_secs: 60,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub enabled: bool,

    /// Archive directory, defaults to the layout's `backups/`
    pub root: Option<PathBuf>,

    /// Catalog document, defaults to `catalog.json` inside the archive directory
    pub catalog_path: Option<PathBuf>,

    pub exclude_patterns: Vec<String>,
    pub retention: RetentionPolicy,

    /// Largest archive accepted by validation
    pub max_size: u64,

    pub profile: ValidationProfile,
    pub deep_validation: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            catalog_path: None,
            exclude_patterns: crate::backup::manager::default_exclude_patterns(),
            retention: RetentionPolicy::default(),
            max_size: 1024 * 1024 * 1024,
            profile: ValidationProfile::default(),
            deep_validation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSettings {
    pub source_repository: String,
    pub default_branch: String,

    /// Directory inside the repository holding the configuration
    pub source_root: String,

    /// Remote directory receiving the configuration
    pub target_root: String,

    pub allowed_dirs: Vec<String>,
    pub extensions: Vec<String>,
    pub require_backup: bool,
    pub rollback_on_failure: bool,
    pub legacy_backup_root: Option<String>,
    pub max_retries: u32,

    /// Deployment records file, defaults to the layout's `deployments.json`
    pub store_path: Option<PathBuf>,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            source_repository: "config".to_string(),
            default_branch: "main".to_string(),
            source_root: String::new(),
            target_root: "/srv/config".to_string(),
            allowed_dirs: Vec::new(),
            extensions: vec![
                ".yml".to_string(),
                ".yaml".to_string(),
                ".json".to_string(),
                ".conf".to_string(),
                ".env".to_string(),
            ],
            require_backup: true,
            rollback_on_failure: false,
            legacy_backup_root: None,
            max_retries: 3,
            store_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Fallback wake-up of the deployer when no enqueue notification arrives
    pub deployer_interval_secs: u64,

    pub enable_health_check: bool,

    pub enable_retention: bool,
    pub retention_interval_secs: u64,

    /// Take a scheduled backup every N seconds, 0 disables
    pub scheduled_backup_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            deployer_interval_secs: 30,
            enable_health_check: true,
            enable_retention: true,
            retention_interval_secs: 6 * 60 * 60,
            scheduled_backup_interval_secs: 0,
        }
    }
}
