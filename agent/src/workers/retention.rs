//! Backup retention and scheduled backup worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::backup::manager::BackupManager;
use crate::backup::BackupService;
use crate::models::backup::BackupType;

/// Retention worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between retention sweeps
    pub interval: Duration,

    /// Take a scheduled backup this often
    pub scheduled_backup_interval: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 60 * 60),
            scheduled_backup_interval: None,
        }
    }
}

/// Run the retention worker
pub async fn run<S, F>(
    options: &Options,
    backups: &BackupManager,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Retention worker starting...");
    let mut last_scheduled = Instant::now();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Retention worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        if let Some(every) = options.scheduled_backup_interval {
            if last_scheduled.elapsed() >= every {
                last_scheduled = Instant::now();
                match backups
                    .create_backup(BackupType::Scheduled, Some("scheduled backup"))
                    .await
                {
                    Ok(record) => info!("Scheduled backup {} created", record.backup_id),
                    Err(e) => error!("Scheduled backup failed: {}", e),
                }
            }
        }

        debug!("Sweeping expired backups...");
        match backups.cleanup_expired_backups().await {
            Ok(report) => {
                if !report.deleted.is_empty() || !report.failed.is_empty() {
                    info!(
                        "Retention sweep deleted {} backups, {} failed, {} retained",
                        report.deleted.len(),
                        report.failed.len(),
                        report.retained
                    );
                }
            }
            Err(e) => error!("Retention sweep failed: {}", e),
        }
    }
}
