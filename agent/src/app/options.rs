//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::backup::manager::BackupOptions;
use crate::backup::validator::ValidatorOptions;
use crate::command::coordinator::{ConnectionOptions, CoordinatorOptions};
use crate::deploy::orchestrator::OrchestratorOptions;
use crate::deploy::queue::QueueOptions;
use crate::logs::LogOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{ConnectionSettings, Settings};
use crate::workers::{deployer, health, retention};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub lifecycle: LifecycleOptions,
    pub layout: StorageLayout,
    pub log: LogOptions,

    /// Local control server, `None` when disabled
    pub server: Option<ServerOptions>,

    pub queue: QueueOptions,
    pub coordinator: CoordinatorOptions,

    /// Backup subsystem, `None` when disabled
    pub backup: Option<BackupOptions>,

    pub orchestrator: OrchestratorOptions,

    /// Deployment records file
    pub store_path: PathBuf,

    pub deployer: deployer::Options,
    pub health: Option<health::Options>,
    pub retention: Option<retention::Options>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), StorageLayout::default())
    }
}

impl AppOptions {
    /// Convert loaded settings into runtime options
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let log = LogOptions {
            log_level: settings.log.level,
            stdout: true,
            log_dir: settings
                .log
                .file
                .then(|| layout.logs_dir().path().to_path_buf()),
            json_format: settings.log.json,
        };

        let server = settings.server.enabled.then(|| ServerOptions {
            host: settings.server.host.clone(),
            port: settings.server.port,
        });

        let queue = QueueOptions {
            max_size: settings.queue.max_size,
            processing_timeout: Duration::from_secs(settings.queue.processing_timeout_secs),
            default_priority: settings.queue.default_priority,
        };

        let coordinator = CoordinatorOptions {
            filesystem: connection_options(&settings.coordinator.filesystem),
            repository: connection_options(&settings.coordinator.repository),
            probe_args: settings.coordinator.probe_args.clone(),
            health_check_interval: Duration::from_secs(
                settings.coordinator.health_check_interval_secs,
            ),
            max_retries: settings.coordinator.max_retries,
        };

        let deployment = &settings.deployment;
        let backup = settings.backup.enabled.then(|| {
            let root = settings
                .backup
                .root
                .clone()
                .unwrap_or_else(|| layout.backups_dir().path().to_path_buf());
            let catalog_path = settings
                .backup
                .catalog_path
                .clone()
                .unwrap_or_else(|| root.join("catalog.json"));
            BackupOptions {
                root,
                catalog_path,
                target_root: deployment.target_root.clone(),
                exclude_patterns: settings.backup.exclude_patterns.clone(),
                retention: settings.backup.retention.clone(),
                validator: ValidatorOptions {
                    max_size: settings.backup.max_size,
                    profile: settings.backup.profile.clone(),
                },
                deep_validation: settings.backup.deep_validation,
            }
        });

        let orchestrator = OrchestratorOptions {
            source_repository: deployment.source_repository.clone(),
            default_branch: deployment.default_branch.clone(),
            source_root: deployment.source_root.clone(),
            target_root: deployment.target_root.clone(),
            allowed_dirs: deployment.allowed_dirs.clone(),
            extensions: deployment.extensions.clone(),
            require_backup: deployment.require_backup,
            rollback_on_failure: deployment.rollback_on_failure,
            legacy_backup_root: deployment.legacy_backup_root.clone(),
            max_retries: deployment.max_retries,
        };

        let store_path = deployment
            .store_path
            .clone()
            .unwrap_or_else(|| layout.deployments_file().path().to_path_buf());

        let workers = &settings.workers;
        let health = workers.enable_health_check.then(|| health::Options {
            interval: coordinator.health_check_interval,
        });
        let retention = (workers.enable_retention && backup.is_some()).then(|| retention::Options {
            interval: Duration::from_secs(workers.retention_interval_secs),
            scheduled_backup_interval: (workers.scheduled_backup_interval_secs > 0)
                .then(|| Duration::from_secs(workers.scheduled_backup_interval_secs)),
        });

        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            log,
            server,
            queue,
            coordinator,
            backup,
            orchestrator,
            store_path,
            deployer: deployer::Options {
                interval: Duration::from_secs(workers.deployer_interval_secs),
            },
            health,
            retention,
        }
    }
}

fn connection_options(settings: &ConnectionSettings) -> ConnectionOptions {
    ConnectionOptions {
        program: settings.program.clone(),
        args: settings.args.clone(),
        timeout: Duration::from_secs(settings.timeout_secs),
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8686,
        }
    }
}
