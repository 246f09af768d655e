//! confdeploy - Entry Point
//!
//! Queues configuration deployments from a repository onto a remote tree,
//! backing the tree up first and rolling it back on request.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use confdeploy::app::options::AppOptions;
use confdeploy::app::run::run;
use confdeploy::backup::catalog::BackupQuery;
use confdeploy::backup::manager::BackupManager;
use confdeploy::backup::validator::BatchOptions;
use confdeploy::backup::BackupService;
use confdeploy::command::coordinator::CommandCoordinator;
use confdeploy::command::executor::{CommandExecutor, ProcessExecutor};
use confdeploy::errors::DeployError;
use confdeploy::logs::init_logging;
use confdeploy::models::backup::BackupType;
use confdeploy::storage::layout::StorageLayout;
use confdeploy::storage::settings::Settings;
use confdeploy::utils::version_info;

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    if cli_args.contains_key("version") {
        print_json(&version_info());
        return;
    }

    let layout = StorageLayout::default();
    let settings_path = cli_args
        .get("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| layout.settings_file().path().to_path_buf());
    let settings = match Settings::load(&settings_path).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings {}: {}", settings_path.display(), e);
            std::process::exit(1);
        }
    };

    let options = AppOptions::from_settings(&settings, layout);
    let _log_guard = match init_logging(options.log.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessExecutor::new());

    if let Some(command) = cli_args.get("backup") {
        if let Err(e) = backup_command(command, &cli_args, &options, executor).await {
            error!("Backup command '{}' failed: {}", command, e);
            std::process::exit(1);
        }
        return;
    }

    info!("Running confdeploy with options: {:?}", options);
    if let Err(e) = run(options, executor, await_shutdown_signal()).await {
        error!("Failed to run confdeploy: {e}");
        std::process::exit(1);
    }
}

/// One-shot backup maintenance commands
async fn backup_command(
    command: &str,
    cli_args: &HashMap<String, String>,
    options: &AppOptions,
    executor: Arc<dyn CommandExecutor>,
) -> Result<(), DeployError> {
    let backup_options = options
        .backup
        .clone()
        .ok_or_else(|| DeployError::ConfigError("backups are disabled".to_string()))?;

    let coordinator = Arc::new(CommandCoordinator::new(
        executor,
        options.coordinator.clone(),
    ));
    let manager = BackupManager::open(backup_options, coordinator.clone()).await?;
    let id = cli_args.get("id").map(String::as_str);

    match command {
        "list" => print_json(&manager.list_backups(&BackupQuery::default()).await),
        "create" => {
            coordinator.initialize().await;
            let description = cli_args.get("description").map(String::as_str);
            let record = manager.create_backup(BackupType::Manual, description).await?;
            print_json(&record);
        }
        "validate" => match id {
            Some(id) => print_json(&manager.validate(id).await?),
            None => print_json(&manager.validate_all(&BatchOptions::default()).await),
        },
        "cleanup" => print_json(&manager.cleanup_expired_backups().await?),
        "delete" => {
            let id = id.ok_or_else(|| {
                DeployError::ValidationError("--backup=delete requires --id=<backup_id>".to_string())
            })?;
            let force = cli_args.contains_key("force");
            print_json(&manager.delete_backup(id, force).await?);
        }
        other => {
            return Err(DeployError::ValidationError(format!(
                "unknown backup command '{}', expected list|create|validate|cleanup|delete",
                other
            )))
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Unable to render output: {}", e),
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                }
                return;
            }
            _ => warn!("Unable to install signal handlers, falling back to Ctrl+C"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Ctrl+C received, shutting down...");
}
